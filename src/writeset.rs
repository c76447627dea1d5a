// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Writeset handle and its state machine (§3 Data Model).

use crate::gtid::Seqno;
use crate::keys::KeySet;

/// Writeset flags (§3): a plain bitset over five single-bit flags.
/// Hand-rolled rather than pulling in a bitflags macro crate - five
/// bits with no combinators beyond `contains`/`insert` don't earn a
/// dependency the rest of the engine has no other use for.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct WsFlags(u8);

impl WsFlags {
    /// Forces conflict realization against any concurrent writer, even
    /// same-source (§4.1).
    pub const ISOLATION: WsFlags = WsFlags(0b0000_0001);
    /// Unsafe for parallel apply; raises `last_pa_unsafe` (§4.2).
    pub const PA_UNSAFE: WsFlags = WsFlags(0b0000_0010);
    /// Keys commute; reserved for future certification relaxation.
    pub const COMMUTATIVE: WsFlags = WsFlags(0b0000_0100);
    /// Produced by a native (non-SQL) applier path.
    pub const NATIVE: WsFlags = WsFlags(0b0000_1000);
    /// Already prepared by a two-phase host transaction.
    pub const PREPARED: WsFlags = WsFlags(0b0001_0000);

    #[must_use]
    pub fn empty() -> Self {
        WsFlags(0)
    }

    #[must_use]
    pub fn contains(self, flag: WsFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn insert(&mut self, flag: WsFlags) {
        self.0 |= flag.0;
    }
}

impl std::ops::BitOr for WsFlags {
    type Output = WsFlags;
    fn bitor(self, rhs: WsFlags) -> WsFlags {
        WsFlags(self.0 | rhs.0)
    }
}

/// Writeset lifecycle state (§3). Terminal states are `Committed` and
/// `RolledBack`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WsState {
    New,
    Replicating,
    Certifying,
    CertFailed,
    MustAbort,
    Aborting,
    MustReplay,
    Replaying,
    Applying,
    Committing,
    Committed,
    RolledBack,
}

impl WsState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, WsState::Committed | WsState::RolledBack)
    }

    /// Whether `self -> next` is one of the edges drawn in §3's diagram.
    #[must_use]
    pub fn can_transition_to(self, next: WsState) -> bool {
        use WsState::{
            Aborting, Applying, CertFailed, Certifying, Committed, Committing, MustAbort,
            MustReplay, New, Replaying, Replicating, RolledBack,
        };
        matches!(
            (self, next),
            (New, Replicating)
                | (Replicating, Certifying)
                | (Replicating, MustAbort)
                | (Certifying, Applying)
                | (Certifying, CertFailed)
                | (Certifying, MustAbort)
                | (Applying, Committing)
                | (Applying, MustAbort)
                | (Committing, Committed)
                | (CertFailed, RolledBack)
                | (MustAbort, Aborting)
                | (MustAbort, MustReplay)
                | (Aborting, RolledBack)
                | (MustReplay, Replaying)
                | (Replaying, Applying)
        )
    }
}

/// The in-memory representation of a replicated writeset (§3).
#[derive(Debug)]
pub struct Writeset {
    pub global_seqno: Seqno,
    pub local_seqno: Seqno,
    pub last_seen_seqno: Seqno,
    pub source_id: u64,
    pub version: u32,
    pub flags: WsFlags,
    pub depends_seqno: i64,
    pub state: WsState,
    /// Opaque pointer into gcache; `None` before a buffer is assigned.
    pub gcache_ptr: Option<crate::gcache::buffer::BufferId>,
    pub keyset: KeySet,
    pub payload_len: usize,
}

impl Writeset {
    #[must_use]
    pub fn new(
        global_seqno: Seqno,
        local_seqno: Seqno,
        last_seen_seqno: Seqno,
        source_id: u64,
        version: u32,
        flags: WsFlags,
        keyset: KeySet,
        payload_len: usize,
    ) -> Self {
        Self {
            global_seqno,
            local_seqno,
            last_seen_seqno,
            source_id,
            version,
            flags,
            depends_seqno: -1,
            state: WsState::New,
            gcache_ptr: None,
            keyset,
            payload_len,
        }
    }

    #[must_use]
    pub fn is_isolation(&self) -> bool {
        self.flags.contains(WsFlags::ISOLATION)
    }

    #[must_use]
    pub fn is_pa_unsafe(&self) -> bool {
        self.flags.contains(WsFlags::PA_UNSAFE)
    }

    /// Attempt `self.state -> next`, per the §3 diagram.
    ///
    /// # Errors
    /// Returns the rejected target state if the edge is not legal.
    pub fn transition(&mut self, next: WsState) -> Result<(), WsState> {
        if self.state.can_transition_to(next) {
            self.state = next;
            Ok(())
        } else {
            Err(next)
        }
    }

    pub fn raise_depends_seqno(&mut self, candidate: Seqno) {
        self.depends_seqno = self.depends_seqno.max(candidate.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk() -> Writeset {
        Writeset::new(
            Seqno::new(1),
            Seqno::new(1),
            Seqno::new(0),
            1,
            4,
            WsFlags::empty(),
            KeySet::default(),
            0,
        )
    }

    #[test]
    fn legal_happy_path() {
        let mut w = mk();
        assert!(w.transition(WsState::Replicating).is_ok());
        assert!(w.transition(WsState::Certifying).is_ok());
        assert!(w.transition(WsState::Applying).is_ok());
        assert!(w.transition(WsState::Committing).is_ok());
        assert!(w.transition(WsState::Committed).is_ok());
        assert!(w.state.is_terminal());
    }

    #[test]
    fn illegal_transition_rejected() {
        let mut w = mk();
        assert_eq!(w.transition(WsState::Committed), Err(WsState::Committed));
        assert_eq!(w.state, WsState::New);
    }

    #[test]
    fn must_abort_then_replay_path() {
        let mut w = mk();
        w.transition(WsState::Replicating).unwrap();
        w.transition(WsState::Certifying).unwrap();
        w.transition(WsState::MustAbort).unwrap();
        w.transition(WsState::MustReplay).unwrap();
        w.transition(WsState::Replaying).unwrap();
        w.transition(WsState::Applying).unwrap();
    }

    #[test]
    fn depends_seqno_only_rises() {
        let mut w = mk();
        w.raise_depends_seqno(Seqno::new(5));
        w.raise_depends_seqno(Seqno::new(2));
        assert_eq!(w.depends_seqno, 5);
    }

    #[test]
    fn flags_combine() {
        let f = WsFlags::ISOLATION | WsFlags::PA_UNSAFE;
        assert!(f.contains(WsFlags::ISOLATION));
        assert!(f.contains(WsFlags::PA_UNSAFE));
        assert!(!f.contains(WsFlags::NATIVE));
    }
}
