// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Host-facing surface (§6.1, §6.2).
//!
//! `view_cb`/`apply_cb`/`sst_donate_cb`/`synced_cb` are modeled as a
//! single [`ReplicationHost`] trait object rather than four raw function
//! pointers plus a `void*` context (§10.5) - the engine is driven by a
//! trivial in-process test double in unit tests instead of a process
//! boundary. [`crate::engine::Engine`] implements the §6.1 operation
//! table as inherent methods against a `ReplicationHost`.

use crate::gtid::{Gtid, Seqno};
use std::fmt;

/// Group reconfiguration info passed to [`ReplicationHost::view_cb`].
#[derive(Clone, Debug)]
pub struct ViewInfo {
    pub members: Vec<u64>,
    pub my_index: usize,
}

/// Opaque SST request returned by `view_cb`, or handed to `sst_donate_cb`.
/// Empty means "no state transfer needed".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SstRequest(pub Vec<u8>);

impl SstRequest {
    #[must_use]
    pub fn empty() -> Self {
        SstRequest(Vec::new())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Error a host callback reports back to the engine.
#[derive(Debug)]
pub struct HostError(pub String);

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host callback failed: {}", self.0)
    }
}

impl std::error::Error for HostError {}

/// Callbacks the database host supplies to the engine (§6.2).
///
/// `apply_cb` must not call back into the engine on the same thread -
/// the apply monitor is already held for this seqno and doing so would
/// deadlock.
pub trait ReplicationHost: Send + Sync {
    /// Called on every group reconfiguration; return the SST request
    /// needed to catch up, or [`SstRequest::empty`] if none is needed.
    fn view_cb(&self, view: &ViewInfo) -> SstRequest;

    /// Apply a writeset's payload at `global_seqno`.
    ///
    /// # Errors
    /// Any failure to apply; the engine surfaces this as a replay signal
    /// to the caller of `pre_commit`/`replay`.
    fn apply_cb(&self, recv_ctx: u64, writeset_bytes: &[u8], global_seqno: Seqno) -> Result<(), HostError>;

    /// Called when this node is asked to donate state to a joiner.
    ///
    /// # Errors
    /// Any failure to produce or send the requested state.
    fn sst_donate_cb(&self, request: &SstRequest, gtid: Gtid) -> Result<(), HostError>;

    /// This node has caught up with the group.
    fn synced_cb(&self) {}
}

/// Result of [`crate::engine::Engine::pre_commit`] (§6.1).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PreCommitResult {
    Ok,
    CertFailed,
    MustReplay,
}

/// Result of [`crate::engine::Engine::replay`] (§6.1).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReplayResult {
    Ok,
    Fail,
}

/// Result of [`crate::engine::Engine::abort_pre_commit`] (§6.1).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AbortResult {
    Ok,
    /// The victim trx was not found - already committed, rolled back, or
    /// never admitted.
    Warning,
}

/// Result of a total-order-isolation region operation (§6.1).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ToiResult {
    Ok,
    Fail,
}

/// Enumerated counters returned by `status_get` (§6.1).
#[derive(Clone, Copy, Default, Debug)]
pub struct StatusCounters {
    pub certified: u64,
    pub conflicts: u64,
    pub replays: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub aborts: u64,
}
