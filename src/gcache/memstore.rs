// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory gcache tier (§4.8).
//!
//! A bounded heap arena with a soft cap. Used for the smallest, hottest
//! writesets to avoid touching the ring buffer. Tracked allocations are
//! plain `Vec<u8>`s keyed by an incrementing slot id; on pressure,
//! already-released seqno'd buffers are discarded in seqno order until
//! the requested size fits.

use super::buffer::{BufferHeader, FLAG_RELEASED, HEADER_SIZE, STORE_TAG_MEM};
use crate::error::GcacheError;
use crate::gtid::Seqno;
use std::collections::BTreeMap;

struct Slot {
    header: BufferHeader,
    data: Vec<u8>,
    /// `Seqno::NONE` until `seqno_assign`.
    seqno: Seqno,
}

/// Bounded heap arena, soft-capped at `mem_size` (§4.8).
#[derive(Default)]
pub struct MemStore {
    soft_cap: u64,
    used: u64,
    next_offset: u64,
    slots: BTreeMap<u64, Slot>,
}

impl MemStore {
    #[must_use]
    pub fn new(soft_cap: u64) -> Self {
        Self { soft_cap, used: 0, next_offset: 1, slots: BTreeMap::new() }
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.used
    }

    #[must_use]
    pub fn soft_cap(&self) -> u64 {
        self.soft_cap
    }

    /// `true` if `size` fits within the soft cap without eviction.
    #[must_use]
    pub fn fits(&self, size: u64) -> bool {
        self.used + size <= self.soft_cap
    }

    /// Allocate `payload_size` bytes, evicting released seqno'd buffers
    /// (oldest seqno first) under pressure. Fails only if even a fully
    /// empty store could not hold the request.
    ///
    /// # Errors
    /// Returns [`GcacheError::AllocationFull`] if `payload_size` alone
    /// exceeds the soft cap (so eviction could never make room).
    pub fn malloc(&mut self, payload_size: usize) -> Result<u64, GcacheError> {
        let total = payload_size as u64 + HEADER_SIZE as u64;
        if total > self.soft_cap {
            return Err(GcacheError::AllocationFull { requested: payload_size });
        }
        while self.used + total > self.soft_cap {
            if !self.evict_one() {
                return Err(GcacheError::AllocationFull { requested: payload_size });
            }
        }
        let offset = self.next_offset;
        self.next_offset += 1;
        let header = BufferHeader::new(total, STORE_TAG_MEM);
        self.slots.insert(offset, Slot { header, data: vec![0u8; payload_size], seqno: Seqno::NONE });
        self.used += total;
        Ok(offset)
    }

    fn evict_one(&mut self) -> bool {
        let victim = self
            .slots
            .iter()
            .filter(|(_, s)| s.header.is_released() && s.seqno.is_ordered())
            .min_by_key(|(_, s)| s.seqno.get())
            .map(|(off, _)| *off);
        if let Some(off) = victim {
            if let Some(s) = self.slots.remove(&off) {
                self.used -= s.header.size;
            }
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn header(&self, offset: u64) -> Option<BufferHeader> {
        self.slots.get(&offset).map(|s| s.header)
    }

    #[must_use]
    pub fn payload(&self, offset: u64) -> Option<&[u8]> {
        self.slots.get(&offset).map(|s| s.data.as_slice())
    }

    pub fn payload_mut(&mut self, offset: u64) -> Option<&mut [u8]> {
        self.slots.get_mut(&offset).map(|s| s.data.as_mut_slice())
    }

    pub fn assign_seqno(&mut self, offset: u64, seqno: Seqno, depends: i64) {
        if let Some(s) = self.slots.get_mut(&offset) {
            s.seqno = seqno;
            s.header.seqno_global = seqno.get();
            s.header.seqno_depends = depends;
        }
    }

    /// Mark released; reclaim immediately if unordered (§4.5).
    pub fn free(&mut self, offset: u64) {
        let Some(s) = self.slots.get_mut(&offset) else { return };
        s.header.flags |= FLAG_RELEASED;
        if !s.seqno.is_ordered() {
            if let Some(s) = self.slots.remove(&offset) {
                self.used -= s.header.size;
            }
        }
    }

    /// Reclaim a seqno'd buffer once its seqno has been released.
    pub fn discard(&mut self, offset: u64) {
        if let Some(s) = self.slots.remove(&offset) {
            self.used -= s.header.size;
        }
    }

    /// Grow or shrink an unordered allocation in place when possible,
    /// otherwise allocate fresh and copy (§4.5 `realloc`).
    ///
    /// # Errors
    /// Returns [`GcacheError::NotFound`] if `offset` names an unordered
    /// buffer that no longer exists, or [`GcacheError::AllocationFull`]
    /// propagated from the fallback `malloc`.
    pub fn realloc(&mut self, offset: u64, new_size: usize) -> Result<u64, GcacheError> {
        let old = self.slots.get(&offset).ok_or(GcacheError::NotFound)?;
        assert!(!old.seqno.is_ordered(), "realloc only permitted on unordered buffers");
        let old_len = old.data.len();
        if new_size <= old_len {
            let s = self.slots.get_mut(&offset).unwrap();
            s.data.truncate(new_size);
            self.used -= (old_len - new_size) as u64;
            s.header.size -= (old_len - new_size) as u64;
            return Ok(offset);
        }
        let grow_by = (new_size - old_len) as u64;
        if self.used + grow_by <= self.soft_cap {
            let s = self.slots.get_mut(&offset).unwrap();
            s.data.resize(new_size, 0);
            s.header.size += grow_by;
            self.used += grow_by;
            return Ok(offset);
        }
        let new_off = self.malloc(new_size)?;
        let old_data = self.slots.get(&offset).unwrap().data.clone();
        if let Some(dst) = self.payload_mut(new_off) {
            dst[..old_data.len()].copy_from_slice(&old_data);
        }
        self.discard(offset);
        Ok(new_off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_within_cap() {
        let mut m = MemStore::new(1024);
        let off = m.malloc(100).unwrap();
        assert!(m.payload(off).is_some());
        assert_eq!(m.used(), 100 + HEADER_SIZE as u64);
    }

    #[test]
    fn too_large_for_cap_rejected() {
        let mut m = MemStore::new(64);
        assert!(matches!(m.malloc(100), Err(GcacheError::AllocationFull { .. })));
    }

    #[test]
    fn pressure_evicts_released_oldest_seqno_first() {
        let mut m = MemStore::new(100 + 2 * HEADER_SIZE as u64);
        let a = m.malloc(40).unwrap();
        m.assign_seqno(a, Seqno::new(1), -1);
        m.free(a);
        let b = m.malloc(40).unwrap();
        m.assign_seqno(b, Seqno::new(2), -1);
        m.free(b);
        // both released; allocating something bigger should evict `a` first
        let c = m.malloc(50).unwrap();
        assert!(m.payload(a).is_none());
        assert!(m.payload(b).is_some());
        assert!(m.payload(c).is_some());
    }

    #[test]
    fn unordered_free_reclaims_immediately() {
        let mut m = MemStore::new(1024);
        let off = m.malloc(10).unwrap();
        m.free(off);
        assert_eq!(m.used(), 0);
    }
}
