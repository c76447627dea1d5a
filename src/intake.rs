// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Writeset intake pipeline (§4.4): the sequence of steps that carries a
//! writeset from certification through the apply and commit monitors.
//!
//! This module wires [`crate::cert::CertIndex`] and [`crate::monitor::OrderingMonitor`]
//! together but owns neither; [`crate::engine::Engine`] holds the actual
//! locks and calls these functions inside them. Keeping the wiring
//! separate from lock acquisition makes each step testable without a
//! full `Engine` in scope.

use crate::cert::CertIndex;
use crate::error::CertError;
use crate::gtid::Seqno;
use crate::monitor::OrderingMonitor;
use crate::writeset::Writeset;

/// Certification-derived facts needed to drive a writeset through the
/// ordering monitors, without retaining the [`Writeset`] itself (which
/// [`CertIndex::append_trx`] consumes into its `trx_map`).
#[derive(Clone, Copy, Debug)]
pub struct CertifiedWriteset {
    pub global_seqno: Seqno,
    pub depends_seqno: i64,
    pub pa_unsafe: bool,
    pub last_seen_seqno: Seqno,
}

/// Result of submitting a writeset to certification (§4.4 step 1).
pub enum AdmitOutcome {
    Admitted(CertifiedWriteset),
    /// Certification failed; carries the global seqno so the caller can
    /// self-cancel both monitors at it (§4.4 step 4).
    CertFailed(CertError, Seqno),
}

/// Submit `ws` to certification and, on success, read back the
/// `depends_seqno` the index assigned.
pub fn admit(cert: &mut CertIndex, ws: Writeset) -> AdmitOutcome {
    let global_seqno = ws.global_seqno;
    let pa_unsafe = ws.is_pa_unsafe();
    let last_seen_seqno = ws.last_seen_seqno;
    match cert.append_trx(ws) {
        Ok(()) => {
            let depends_seqno = cert.get(global_seqno.get()).map_or(-1, |w| w.depends_seqno);
            AdmitOutcome::Admitted(CertifiedWriteset { global_seqno, depends_seqno, pa_unsafe, last_seen_seqno })
        }
        Err(e) => AdmitOutcome::CertFailed(e, global_seqno),
    }
}

/// Block until `cw`'s ticket is ready in the apply monitor (§4.4 step 2).
///
/// # Errors
/// [`crate::error::MonitorError::Interrupted`] if [`OrderingMonitor::interrupt`]
/// fired for this seqno - the caller must treat the writeset as needing
/// replay rather than retrying the wait.
pub fn enter_apply(apply_monitor: &OrderingMonitor, cw: &CertifiedWriteset) -> Result<(), crate::error::MonitorError> {
    apply_monitor.enter(cw.global_seqno.get(), cw.depends_seqno, cw.pa_unsafe)
}

pub fn exit_apply(apply_monitor: &OrderingMonitor, cw: &CertifiedWriteset) {
    apply_monitor.exit(cw.global_seqno.get());
}

/// Block until `cw`'s ticket is ready in the commit monitor (§4.4 step 3).
///
/// # Errors
/// See [`enter_apply`].
pub fn enter_commit(commit_monitor: &OrderingMonitor, cw: &CertifiedWriteset) -> Result<(), crate::error::MonitorError> {
    commit_monitor.enter(cw.global_seqno.get(), cw.depends_seqno, cw.pa_unsafe)
}

pub fn exit_commit(commit_monitor: &OrderingMonitor, cw: &CertifiedWriteset) {
    commit_monitor.exit(cw.global_seqno.get());
}

/// Self-cancel both monitors at `seqno` (§4.4 step 4) so a writeset that
/// never enters them - because certification failed, or because its
/// wait was interrupted before it could proceed - does not leave a
/// permanent gap that blocks every later dependant.
pub fn cancel_both(apply_monitor: &OrderingMonitor, commit_monitor: &OrderingMonitor, seqno: Seqno) {
    apply_monitor.self_cancel(seqno.get());
    commit_monitor.self_cancel(seqno.get());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CertConfig;
    use crate::gtid::Seqno as S;
    use crate::keys::{Key, KeyPart, KeySet, KeyType};
    use crate::writeset::WsFlags;

    fn ws(global: i64, last_seen: i64, source: u64) -> Writeset {
        let keyset = KeySet::new(vec![Key::new(vec![KeyPart::new(b"row".to_vec(), KeyType::Exclusive)])]);
        Writeset::new(S::new(global), S::new(global), S::new(last_seen), source, 4, WsFlags::empty(), keyset, 0)
    }

    fn idx() -> CertIndex {
        let mut i = CertIndex::new(CertConfig::default());
        i.assign_initial_position(0, 4);
        i
    }

    #[test]
    fn admitted_writeset_carries_depends_seqno() {
        let mut cert = idx();
        let out = admit(&mut cert, ws(1, 0, 1));
        assert!(matches!(out, AdmitOutcome::Admitted(cw) if cw.depends_seqno == 0));
    }

    #[test]
    fn happy_path_drains_both_monitors() {
        let mut cert = idx();
        let apply = OrderingMonitor::new(false);
        let commit = OrderingMonitor::new(false);

        let AdmitOutcome::Admitted(cw) = admit(&mut cert, ws(1, 0, 1)) else { panic!("expected admission") };
        enter_apply(&apply, &cw).unwrap();
        exit_apply(&apply, &cw);
        enter_commit(&commit, &cw).unwrap();
        exit_commit(&commit, &cw);

        assert_eq!(apply.drained_to(), 1);
        assert_eq!(commit.drained_to(), 1);
    }

    #[test]
    fn cert_failure_self_cancels_so_dependants_are_not_blocked() {
        let mut cert = idx();
        let apply = OrderingMonitor::new(false);
        let commit = OrderingMonitor::new(false);

        let AdmitOutcome::Admitted(cw1) = admit(&mut cert, ws(1, 0, 1)) else { panic!() };
        enter_apply(&apply, &cw1).unwrap();
        exit_apply(&apply, &cw1);
        enter_commit(&commit, &cw1).unwrap();
        exit_commit(&commit, &cw1);

        let conflicting = ws(2, 0, 2); // different source, same default key as ws(1,..)? uses "row" always
        let out = admit(&mut cert, conflicting);
        let AdmitOutcome::CertFailed(_, failed_seqno) = out else { panic!("expected conflict") };
        cancel_both(&apply, &commit, failed_seqno);

        // seqno 3, depending on 2 having drained, must not block forever.
        let AdmitOutcome::Admitted(cw3) = admit(&mut cert, ws(3, 2, 1)) else { panic!() };
        assert!(enter_apply(&apply, &cw3).is_ok());
    }
}
