// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Key entries and the §4.1 conflict/dependency matrix.
//!
//! A [`KeyEntry`] is the unit stored in the certification index, one per
//! distinct canonical key (full or partial). It holds four reference
//! slots total: a last-referencing writeset pointer for each of the
//! three [`KeyType`]s, plus one more for the "full-key variant" - the
//! most recent writeset that inserted these exact bytes as its own full
//! (leaf) key rather than as a prefix of something longer. This matches
//! §3's "a reference count implied by these four pointers" and keeps
//! the leaf/prefix distinction out of the conflict matrix itself (which
//! is stated purely as a 3x3 type-by-type table) while still
//! tracking it for reference-count/eviction bookkeeping.
//!
//! The entry never owns a writeset: it borrows only the handful of
//! fields conflict evaluation needs ([`WsRef`]), so its lifetime is not
//! entangled with the writeset handle's residence in `trx_map` (§9).

use super::part::KeyType;
use crate::gtid::Seqno;

/// The fields of a writeset needed to evaluate a later certification
/// against it. A non-owning snapshot, not a handle: see module doc.
#[derive(Clone, Copy, Debug)]
pub struct WsRef {
    pub global_seqno: Seqno,
    pub source_id: u64,
    pub isolation: bool,
}

/// Result of evaluating one matrix cell against an existing reference.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CellOutcome {
    /// Conflict candidate - realized only if the seqno/source conditions
    /// in §4.1 hold.
    ConflictCandidate,
    /// Dependency only, never a conflict.
    Dependency,
    /// No interaction.
    Nothing,
}

/// The §4.1 conflict matrix: `MATRIX[existing_type][new_type]`.
const MATRIX: [[CellOutcome; 3]; 3] = {
    use CellOutcome::{ConflictCandidate as C, Dependency as D, Nothing as N};
    // Row = existing reference's type, column = new writeset's key type.
    // Column/row order follows KeyType::as_index: EXCL, SEMI, SHARED.
    [
        [C, C, C], // existing EXCLUSIVE
        [C, N, N], // existing SEMI
        [D, N, N], // existing SHARED
    ]
};

#[must_use]
pub fn matrix_cell(existing: KeyType, new: KeyType) -> CellOutcome {
    MATRIX[existing.as_index()][new.as_index()]
}

/// Outcome of checking a new writeset's key part against one existing
/// reference slot.
#[derive(Debug)]
pub enum MatchOutcome {
    /// No interaction with this slot.
    Nothing,
    /// Raise `depends_seqno` to at least this value; no conflict.
    DependsOn(Seqno),
    /// A conflict was realized against this reference.
    Conflict { conflicting_seqno: Seqno },
}

/// Evaluate one existing reference slot against the new writeset's key
/// part, per §4.1's matrix plus the realization conditions.
#[must_use]
pub fn evaluate(
    existing_type: KeyType,
    existing: WsRef,
    new_type: KeyType,
    new_source_id: u64,
    new_last_seen_seqno: Seqno,
) -> MatchOutcome {
    match matrix_cell(existing_type, new_type) {
        CellOutcome::Nothing => MatchOutcome::Nothing,
        CellOutcome::Dependency => MatchOutcome::DependsOn(existing.global_seqno),
        CellOutcome::ConflictCandidate => {
            let realized = existing.global_seqno.get() > new_last_seen_seqno.get()
                && (existing.source_id != new_source_id || existing.isolation);
            if realized {
                MatchOutcome::Conflict { conflicting_seqno: existing.global_seqno }
            } else {
                // "C-reduced-to-D": the candidate did not realize, so it
                // still contributes a dependency.
                MatchOutcome::DependsOn(existing.global_seqno)
            }
        }
    }
}

/// One per distinct canonical key (full or partial) currently indexed.
#[derive(Debug, Default)]
pub struct KeyEntry {
    /// Last writeset that referenced this key with each [`KeyType`],
    /// indexed by `KeyType::as_index`.
    refs: [Option<WsRef>; 3],
    /// Last writeset that inserted these exact bytes as its own full
    /// (leaf) key, together with the type it used.
    full_ref: Option<(KeyType, WsRef)>,
}

impl KeyEntry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reference(&self, key_type: KeyType) -> Option<WsRef> {
        self.refs[key_type.as_index()]
    }

    #[must_use]
    pub fn full_reference(&self) -> Option<(KeyType, WsRef)> {
        self.full_ref
    }

    /// Overwrite the reference for `key_type`, and the full-key variant
    /// if `full` - "overwrite the relevant reference with the new
    /// writeset" (§4.2).
    pub fn set_reference(&mut self, key_type: KeyType, ws: WsRef, full: bool) {
        self.refs[key_type.as_index()] = Some(ws);
        if full {
            self.full_ref = Some((key_type, ws));
        }
    }

    /// Remove the reference for `key_type` if it currently points at
    /// `seqno` (used by conflict cleanup and by eviction unref).
    pub fn clear_reference_if(&mut self, key_type: KeyType, seqno: Seqno) {
        let idx = key_type.as_index();
        if self.refs[idx].is_some_and(|r| r.global_seqno == seqno) {
            self.refs[idx] = None;
        }
        if let Some((t, r)) = self.full_ref {
            if t == key_type && r.global_seqno == seqno {
                self.full_ref = None;
            }
        }
    }

    /// `true` iff at least one of the four pointers is non-null - an
    /// entry with none must be deleted (§3 invariant).
    #[must_use]
    pub fn is_referenced(&self) -> bool {
        self.refs.iter().any(Option::is_some) || self.full_ref.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wsref(seqno: i64, source: u64, isolation: bool) -> WsRef {
        WsRef { global_seqno: Seqno::new(seqno), source_id: source, isolation }
    }

    #[test]
    fn excl_excl_different_source_conflicts() {
        let existing = wsref(5, 1, false);
        let out = evaluate(KeyType::Exclusive, existing, KeyType::Exclusive, 2, Seqno::new(4));
        assert!(matches!(out, MatchOutcome::Conflict { conflicting_seqno } if conflicting_seqno.get() == 5));
    }

    #[test]
    fn excl_excl_same_source_reduces_to_dependency() {
        let existing = wsref(5, 1, false);
        let out = evaluate(KeyType::Exclusive, existing, KeyType::Exclusive, 1, Seqno::new(4));
        assert!(matches!(out, MatchOutcome::DependsOn(s) if s.get() == 5));
    }

    #[test]
    fn excl_excl_within_last_seen_never_conflicts() {
        let existing = wsref(3, 2, false);
        let out = evaluate(KeyType::Exclusive, existing, KeyType::Exclusive, 9, Seqno::new(5));
        assert!(matches!(out, MatchOutcome::DependsOn(s) if s.get() == 3));
    }

    #[test]
    fn shared_excl_is_dependency_only_even_on_conflicting_conditions() {
        let existing = wsref(9, 2, true);
        let out = evaluate(KeyType::Shared, existing, KeyType::Exclusive, 1, Seqno::new(1));
        assert!(matches!(out, MatchOutcome::DependsOn(s) if s.get() == 9));
    }

    #[test]
    fn semi_semi_is_nothing() {
        let existing = wsref(9, 2, true);
        let out = evaluate(KeyType::Semi, existing, KeyType::Semi, 5, Seqno::new(1));
        assert!(matches!(out, MatchOutcome::Nothing));
    }

    #[test]
    fn entry_deleted_when_all_four_pointers_clear() {
        let mut e = KeyEntry::new();
        assert!(!e.is_referenced());
        e.set_reference(KeyType::Shared, wsref(1, 1, false), true);
        assert!(e.is_referenced());
        e.clear_reference_if(KeyType::Shared, Seqno::new(1));
        assert!(!e.is_referenced());
    }
}
