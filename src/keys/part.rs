// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Key parts and the three certification key types (§3, §4.1).

use std::fmt;

/// Certification semantics attached to a [`KeyPart`].
///
/// Ordering of the discriminants matches the row/column order of the
/// conflict matrix in §4.1 (`EXCLUSIVE`, `SEMI`, `SHARED`) so a matrix
/// can be indexed directly by `as usize`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[repr(u8)]
pub enum KeyType {
    Exclusive = 0,
    Semi = 1,
    Shared = 2,
}

impl KeyType {
    pub const ALL: [KeyType; 3] = [KeyType::Exclusive, KeyType::Semi, KeyType::Shared];

    #[must_use]
    pub fn as_index(self) -> usize {
        self as u8 as usize
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyType::Exclusive => "EXCLUSIVE",
            KeyType::Semi => "SEMI",
            KeyType::Shared => "SHARED",
        };
        write!(f, "{s}")
    }
}

/// One segment of a hierarchical key.
///
/// Identity is the byte value alone: "Equality of two key parts is
/// byte-exact on their value; the type tag does not participate in
/// identity" (§3).
#[derive(Clone, Debug)]
pub struct KeyPart {
    pub value: Vec<u8>,
    pub key_type: KeyType,
}

impl KeyPart {
    #[must_use]
    pub fn new(value: impl Into<Vec<u8>>, key_type: KeyType) -> Self {
        Self { value: value.into(), key_type }
    }
}

impl PartialEq for KeyPart {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}
impl Eq for KeyPart {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_ignores_type() {
        let a = KeyPart::new(b"row5".to_vec(), KeyType::Exclusive);
        let b = KeyPart::new(b"row5".to_vec(), KeyType::Shared);
        assert_eq!(a, b);
    }

    #[test]
    fn matrix_index_matches_declared_order() {
        assert_eq!(KeyType::Exclusive.as_index(), 0);
        assert_eq!(KeyType::Semi.as_index(), 1);
        assert_eq!(KeyType::Shared.as_index(), 2);
    }
}
