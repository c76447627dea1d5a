// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global sequence numbers and GTIDs (§3 Data Model).
//!
//! A [`Seqno`] is the unit every other module orders on: certification
//! results, gcache occupancy, and monitor tickets are all keyed by it.
//! A [`Gtid`] pairs a seqno with the group identifier it was assigned
//! under; a change of group resets the seqno space (`seqno_reset`).

use std::fmt;

/// Seqno reserved for "unordered" - a buffer or writeset not yet (or
/// never) assigned a position in the replicated stream.
pub const SEQNO_NONE: i64 = 0;

/// Seqno reserved for "invalid" / cleared state.
pub const SEQNO_ILL: i64 = -1;

/// Sentinel meaning "no seqno is locked" (§4.9).
pub const SEQNO_MAX: i64 = i64::MAX;

/// All ordered seqnos are `>= 1`; see [`Seqno::is_ordered`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Seqno(pub i64);

impl Seqno {
    pub const NONE: Seqno = Seqno(SEQNO_NONE);
    pub const ILL: Seqno = Seqno(SEQNO_ILL);
    pub const MAX: Seqno = Seqno(SEQNO_MAX);

    #[must_use]
    pub fn new(v: i64) -> Self {
        Seqno(v)
    }

    /// `true` for any seqno actually assigned a position (`>= 1`).
    #[must_use]
    pub fn is_ordered(self) -> bool {
        self.0 >= 1
    }

    #[must_use]
    pub fn get(self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn checked_sub(self, rhs: i64) -> Option<Seqno> {
        self.0.checked_sub(rhs).map(Seqno)
    }
}

impl fmt::Debug for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            SEQNO_NONE => write!(f, "Seqno(NONE)"),
            SEQNO_ILL => write!(f, "Seqno(ILL)"),
            SEQNO_MAX => write!(f, "Seqno(MAX)"),
            v => write!(f, "Seqno({v})"),
        }
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Seqno {
    fn from(v: i64) -> Self {
        Seqno(v)
    }
}

impl From<Seqno> for i64 {
    fn from(s: Seqno) -> Self {
        s.0
    }
}

/// A group identifier - opaque 128-bit value, conventionally a UUID.
///
/// The engine never interprets the bytes; it only compares them for
/// equality to decide whether a [`Gtid`] change resets the seqno space.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupUuid(pub [u8; 16]);

impl GroupUuid {
    pub const NIL: GroupUuid = GroupUuid([0u8; 16]);

    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        GroupUuid(bytes)
    }
}

impl fmt::Debug for GroupUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for GroupUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// `(group_uuid, seqno)` - a point in the replicated stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Gtid {
    pub group: GroupUuid,
    pub seqno: Seqno,
}

impl Gtid {
    #[must_use]
    pub fn new(group: GroupUuid, seqno: Seqno) -> Self {
        Self { group, seqno }
    }

    /// Whether `other` belongs to the same group, i.e. no seqno-space
    /// reset separates the two GTIDs.
    #[must_use]
    pub fn same_group(&self, other: &Gtid) -> bool {
        self.group == other.group
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.seqno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_values() {
        assert!(!Seqno::NONE.is_ordered());
        assert!(!Seqno::ILL.is_ordered());
        assert!(Seqno::new(1).is_ordered());
    }

    #[test]
    fn gtid_group_change_detected() {
        let a = Gtid::new(GroupUuid::from_bytes([1; 16]), Seqno::new(5));
        let b = Gtid::new(GroupUuid::from_bytes([1; 16]), Seqno::new(6));
        let c = Gtid::new(GroupUuid::from_bytes([2; 16]), Seqno::new(1));
        assert!(a.same_group(&b));
        assert!(!a.same_group(&c));
    }

    #[test]
    fn seqno_ordering() {
        let mut v = vec![Seqno::new(3), Seqno::new(1), Seqno::new(2)];
        v.sort();
        assert_eq!(v, vec![Seqno::new(1), Seqno::new(2), Seqno::new(3)]);
    }
}
