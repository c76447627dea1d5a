// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The top-level replication engine (§6.1).
//!
//! `Engine` owns every subsystem as an explicit field rather than
//! reaching for a global singleton (§9 "pervasive mutable process
//! state"): the certification index and gcache each sit behind their
//! own `parking_lot::Mutex` (`cert_mtx`/`gcache_mtx` in §5's naming),
//! the two ordering monitors are lock-free-entry structures in their own
//! right, and the current configuration is published through an
//! [`arc_swap::ArcSwap`] so a reader thread never blocks a config
//! reload. Lock order is always `cert_mtx` before `gcache_mtx` when both
//! are held, to rule out deadlock.
//!
//! Seqno assignment is out of scope upstream (the group-communication
//! transport assigns it); this single-node engine has no separate
//! transport to defer to, so `pre_commit` assigns the next global seqno
//! itself, under `cert_mtx`, as `position() + 1`. `local_seqno` and
//! `global_seqno` therefore coincide here - the distinction only matters
//! across a real cluster.

use crate::api::{
    AbortResult, HostError, PreCommitResult, ReplayResult, ReplicationHost, StatusCounters, ToiResult, ViewInfo,
};
use crate::cert::CertIndex;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::flow_control::{FlowControl, Sleep};
use crate::gcache::buffer::BufferId;
use crate::gcache::GCache;
use crate::gtid::{Gtid, Seqno};
use crate::intake::{self, AdmitOutcome, CertifiedWriteset};
use crate::keys::{Key, KeySet, KeyType};
use crate::monitor::OrderingMonitor;
use crate::writeset::{WsFlags, Writeset};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Host-assigned transaction identifier, opaque to the engine.
pub type TrxId = u64;

/// Which monitor a pending trx is currently (or was last) waiting in -
/// needed so [`Engine::abort_pre_commit`] interrupts the right one.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Stage {
    AwaitingApply,
    AwaitingCommit,
}

#[derive(Clone, Copy, Debug)]
struct PendingTrx {
    global_seqno: Seqno,
    depends_seqno: i64,
    pa_unsafe: bool,
    last_seen_seqno: Seqno,
    buffer: BufferId,
    stage: Stage,
}

impl PendingTrx {
    fn certified(&self) -> CertifiedWriteset {
        CertifiedWriteset {
            global_seqno: self.global_seqno,
            depends_seqno: self.depends_seqno,
            pa_unsafe: self.pa_unsafe,
            last_seen_seqno: self.last_seen_seqno,
        }
    }
}

#[derive(Default)]
struct Counters {
    certified: AtomicU64,
    conflicts: AtomicU64,
    replays: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    aborts: AtomicU64,
}

/// The replication engine: certification, gcache, ordering monitors and
/// flow control, wired together behind the §6.1 host-facing operations.
pub struct Engine {
    config: ArcSwap<EngineConfig>,
    cert: Mutex<CertIndex>,
    gcache: Mutex<GCache>,
    apply_monitor: OrderingMonitor,
    commit_monitor: OrderingMonitor,
    flow: Mutex<FlowControl>,
    host: Arc<dyn ReplicationHost>,
    trx_table: Mutex<HashMap<TrxId, PendingTrx>>,
    pending_keys: Mutex<HashMap<TrxId, Vec<Key>>>,
    counters: Counters,
}

impl Engine {
    /// Open gcache and build a fresh engine around `config` and `host`.
    ///
    /// # Errors
    /// Propagates gcache I/O failures from [`GCache::open`].
    pub fn open(config: EngineConfig, host: Arc<dyn ReplicationHost>) -> Result<Self, EngineError> {
        let gcache = GCache::open(&config.gcache)?;
        let cert = CertIndex::new(config.cert.clone());
        let flow = FlowControl::new(&config.flow_control);
        Ok(Self {
            config: ArcSwap::from_pointee(config.clone()),
            cert: Mutex::new(cert),
            gcache: Mutex::new(gcache),
            apply_monitor: OrderingMonitor::new(false),
            commit_monitor: OrderingMonitor::new(config.monitor.commit_order_bypass),
            flow: Mutex::new(flow),
            host,
            trx_table: Mutex::new(HashMap::new()),
            pending_keys: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> arc_swap::Guard<Arc<EngineConfig>> {
        self.config.load()
    }

    /// Re-anchor certification at `gtid` and drop everything gcache
    /// knows about seqno ordering for the old group (§4.2, §4.9). Used
    /// on group reconfiguration / SST receipt.
    pub fn reset_position(&self, gtid: Gtid, version: i32) {
        self.cert.lock().assign_initial_position(gtid.seqno.get(), version);
        self.gcache.lock().seqno_reset(gtid);
    }

    /// `view_cb` dispatch point: forwards the reconfiguration to the
    /// host and returns whatever SST request it decides is needed.
    pub fn on_view_change(&self, view: &ViewInfo) -> crate::api::SstRequest {
        self.host.view_cb(view)
    }

    pub fn sst_sent(&self, _gtid: Gtid) {}

    pub fn sst_received(&self, gtid: Gtid, version: i32) {
        self.reset_position(gtid, version);
        self.host.synced_cb();
    }

    /// Accumulate one key for `trx`'s writeset (§6.1 `append_key`). Keys
    /// are consumed by the next [`Self::pre_commit`] call for this trx.
    pub fn append_key(&self, trx: TrxId, parts: Vec<(Vec<u8>, KeyType)>) {
        let key = Key::new(parts.into_iter().map(|(v, t)| crate::keys::KeyPart::new(v, t)).collect());
        self.pending_keys.lock().entry(trx).or_default().push(key);
    }

    /// Admit `payload` for `trx`, certify it, and drive it through the
    /// apply and commit monitors up to (not including) the commit
    /// monitor's exit, which [`Self::post_commit`] performs once the
    /// host has actually committed the local transaction (§4.4, §6.1).
    ///
    /// # Errors
    /// Propagates gcache allocation failures.
    pub fn pre_commit(&self, trx: TrxId, source_id: u64, flags: WsFlags, payload: &[u8]) -> Result<PreCommitResult, EngineError> {
        self.throttle(payload.len() as i64);

        let keys = self.pending_keys.lock().remove(&trx).unwrap_or_default();
        let keyset = KeySet::new(keys);

        let buffer = {
            let mut gcache = self.gcache.lock();
            let id = gcache.malloc(payload.len())?;
            gcache.payload_mut(id)[..payload.len()].copy_from_slice(payload);
            id
        };

        let outcome = {
            let mut cert = self.cert.lock();
            let last_seen_seqno = Seqno::new(cert.position());
            let global_seqno = Seqno::new(cert.position() + 1);
            self.gcache.lock().seqno_assign(buffer, global_seqno, -1);
            let ws = Writeset::new(global_seqno, global_seqno, last_seen_seqno, source_id, 4, flags, keyset, payload.len());
            intake::admit(&mut cert, ws)
        };

        match outcome {
            AdmitOutcome::Admitted(cw) => {
                self.counters.certified.fetch_add(1, Ordering::Relaxed);
                self.trx_table.lock().insert(
                    trx,
                    PendingTrx {
                        global_seqno: cw.global_seqno,
                        depends_seqno: cw.depends_seqno,
                        pa_unsafe: cw.pa_unsafe,
                        last_seen_seqno: cw.last_seen_seqno,
                        buffer,
                        stage: Stage::AwaitingApply,
                    },
                );

                if intake::enter_apply(&self.apply_monitor, &cw).is_err() {
                    self.abandon(trx, &cw);
                    return Ok(PreCommitResult::MustReplay);
                }
                let applied = self.host.apply_cb(trx, payload, cw.global_seqno);
                intake::exit_apply(&self.apply_monitor, &cw);
                if let Err(HostError(detail)) = applied {
                    crate::warn!("apply_cb failed for seqno {}: {}", cw.global_seqno, detail);
                    self.abandon(trx, &cw);
                    return Ok(PreCommitResult::MustReplay);
                }

                if let Some(entry) = self.trx_table.lock().get_mut(&trx) {
                    entry.stage = Stage::AwaitingCommit;
                }
                if intake::enter_commit(&self.commit_monitor, &cw).is_err() {
                    self.abandon(trx, &cw);
                    return Ok(PreCommitResult::MustReplay);
                }

                Ok(PreCommitResult::Ok)
            }
            AdmitOutcome::CertFailed(_err, global_seqno) => {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                intake::cancel_both(&self.apply_monitor, &self.commit_monitor, global_seqno);
                self.gcache.lock().free(buffer);
                Ok(PreCommitResult::CertFailed)
            }
        }
    }

    /// Exit the commit monitor and notify certification that `trx`
    /// committed (§4.4 step 3, §6.1 `post_commit`). Must be called
    /// exactly once, after `pre_commit` returned `Ok` and the host has
    /// durably committed its own transaction.
    pub fn post_commit(&self, trx: TrxId) {
        let Some(entry) = self.trx_table.lock().remove(&trx) else { return };
        self.commit_monitor.exit(entry.global_seqno.get());
        self.counters.committed.fetch_add(1, Ordering::Relaxed);

        let watermark = self.cert.lock().set_trx_committed(entry.last_seen_seqno);
        // Eviction must never outrun an IST donor holding `seqno_lock`,
        // so the two watermarks are ANDed rather than using either alone.
        let purge_to = watermark.min(self.gcache.lock().seqno_lock_ceiling());
        if purge_to > 0 {
            self.cert.lock().purge_trxs_upto(purge_to);
        }

        let mut gcache = self.gcache.lock();
        gcache.free(entry.buffer);
        if purge_to > 0 {
            gcache.seqno_release(Seqno::new(purge_to));
        }
    }

    /// Roll back `trx`: release its gcache buffer and, if its monitor
    /// wait had not already been cancelled, self-cancel it (§6.1
    /// `post_rollback`).
    pub fn post_rollback(&self, trx: TrxId) {
        let Some(entry) = self.trx_table.lock().remove(&trx) else { return };
        intake::cancel_both(&self.apply_monitor, &self.commit_monitor, entry.global_seqno);
        self.gcache.lock().free(entry.buffer);
        self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    /// Force `victim` out of whichever monitor it is currently waiting
    /// in, so it can be replayed instead of committing in its original
    /// position (§4.4, §6.1 `abort_pre_commit`). `_bf_seqno` identifies
    /// the higher-priority writeset requesting the abort; it is not
    /// otherwise consulted here since monitor order already encodes
    /// priority by seqno.
    pub fn abort_pre_commit(&self, _bf_seqno: Seqno, victim: TrxId) -> AbortResult {
        let table = self.trx_table.lock();
        let Some(entry) = table.get(&victim) else { return AbortResult::Warning };
        match entry.stage {
            Stage::AwaitingApply => self.apply_monitor.interrupt(entry.global_seqno.get()),
            Stage::AwaitingCommit => self.commit_monitor.interrupt(entry.global_seqno.get()),
        }
        self.counters.aborts.fetch_add(1, Ordering::Relaxed);
        AbortResult::Ok
    }

    /// Re-enter the monitor `trx` was interrupted in and retry applying
    /// it, without recertifying - its certification result is preserved
    /// in `trx_table` (§4.4's "does not restart from scratch").
    pub fn replay(&self, trx: TrxId, payload: &[u8]) -> ReplayResult {
        let Some(cw_stage) = self.trx_table.lock().get(&trx).map(|e| (e.certified(), e.stage)) else {
            return ReplayResult::Fail;
        };
        let (cw, stage) = cw_stage;

        if stage == Stage::AwaitingApply {
            if intake::enter_apply(&self.apply_monitor, &cw).is_err() {
                return ReplayResult::Fail;
            }
            let applied = self.host.apply_cb(trx, payload, cw.global_seqno);
            intake::exit_apply(&self.apply_monitor, &cw);
            if applied.is_err() {
                return ReplayResult::Fail;
            }
            if let Some(entry) = self.trx_table.lock().get_mut(&trx) {
                entry.stage = Stage::AwaitingCommit;
            }
        }

        if intake::enter_commit(&self.commit_monitor, &cw).is_err() {
            return ReplayResult::Fail;
        }
        self.counters.replays.fetch_add(1, Ordering::Relaxed);
        ReplayResult::Ok
    }

    /// Total-order isolation region start: admits `payload` exactly like
    /// `pre_commit` but with the `ISOLATION` flag forced on, so it is
    /// indexed without being checked for conflicts (§4.1, §6.1).
    pub fn to_execute_start(&self, trx: TrxId, source_id: u64, payload: &[u8]) -> Result<ToiResult, EngineError> {
        match self.pre_commit(trx, source_id, WsFlags::ISOLATION, payload)? {
            PreCommitResult::Ok => Ok(ToiResult::Ok),
            _ => Ok(ToiResult::Fail),
        }
    }

    pub fn to_execute_end(&self, trx: TrxId) -> ToiResult {
        self.post_commit(trx);
        ToiResult::Ok
    }

    #[must_use]
    pub fn status_get(&self) -> StatusCounters {
        StatusCounters {
            certified: self.counters.certified.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            replays: self.counters.replays.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            rolled_back: self.counters.rolled_back.load(Ordering::Relaxed),
            aborts: self.counters.aborts.load(Ordering::Relaxed),
        }
    }

    /// §5 flow control: sleep the caller before admitting the next
    /// writeset if the slave queue has grown past the configured limits.
    fn throttle(&self, size: i64) {
        match self.flow.lock().process(size) {
            Ok(Sleep::None) => {}
            Ok(Sleep::For(d)) => std::thread::sleep(d),
            Ok(Sleep::Eternity) => loop {
                std::thread::sleep(std::time::Duration::from_secs(3600));
            },
            Err(_out_of_memory) => crate::error!("flow control: slave queue hard limit exceeded"),
        }
    }

    fn abandon(&self, trx: TrxId, cw: &CertifiedWriteset) {
        let entry = self.trx_table.lock().remove(&trx);
        intake::cancel_both(&self.apply_monitor, &self.commit_monitor, cw.global_seqno);
        if let Some(entry) = entry {
            self.gcache.lock().free(entry.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::sync::Mutex as StdMutex;

    struct RecordingHost {
        applied: StdMutex<Vec<(u64, i64)>>,
    }

    impl RecordingHost {
        fn new() -> Self {
            Self { applied: StdMutex::new(Vec::new()) }
        }
    }

    impl ReplicationHost for RecordingHost {
        fn view_cb(&self, _view: &ViewInfo) -> crate::api::SstRequest {
            crate::api::SstRequest::empty()
        }
        fn apply_cb(&self, recv_ctx: u64, _bytes: &[u8], global_seqno: Seqno) -> Result<(), HostError> {
            self.applied.lock().unwrap().push((recv_ctx, global_seqno.get()));
            Ok(())
        }
        fn sst_donate_cb(&self, _request: &crate::api::SstRequest, _gtid: Gtid) -> Result<(), HostError> {
            Ok(())
        }
    }

    fn engine(dir: &std::path::Path) -> Engine {
        let mut cfg = EngineConfig::default();
        cfg.gcache.page_dir = dir.to_path_buf();
        cfg.gcache.name = "gcache".into();
        cfg.gcache.size = 1 << 20;
        Engine::open(cfg, Arc::new(RecordingHost::new())).unwrap()
    }

    #[test]
    fn pre_commit_then_post_commit_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        e.append_key(1, vec![(b"row1".to_vec(), KeyType::Exclusive)]);
        let res = e.pre_commit(1, 1, WsFlags::empty(), b"payload").unwrap();
        assert_eq!(res, PreCommitResult::Ok);
        e.post_commit(1);
        assert_eq!(e.status_get().committed, 1);
    }

    #[test]
    fn conflicting_writesets_one_fails_certification() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        e.append_key(1, vec![(b"row1".to_vec(), KeyType::Exclusive)]);
        assert_eq!(e.pre_commit(1, 1, WsFlags::empty(), b"a").unwrap(), PreCommitResult::Ok);

        e.append_key(2, vec![(b"row1".to_vec(), KeyType::Exclusive)]);
        let res = e.pre_commit(2, 2, WsFlags::empty(), b"b").unwrap();
        assert_eq!(res, PreCommitResult::CertFailed);
        e.post_rollback(2);
        assert_eq!(e.status_get().conflicts, 1);
        e.post_commit(1);
    }

    #[test]
    fn abort_pre_commit_on_unknown_trx_warns() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        assert_eq!(e.abort_pre_commit(Seqno::new(5), 999), AbortResult::Warning);
    }

    #[test]
    fn status_counters_reflect_activity() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        e.append_key(1, vec![(b"a".to_vec(), KeyType::Shared)]);
        e.pre_commit(1, 1, WsFlags::empty(), b"x").unwrap();
        e.post_commit(1);
        let s = e.status_get();
        assert_eq!(s.certified, 1);
        assert_eq!(s.committed, 1);
    }
}
