// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sparse, contiguous-keyed seqno→buffer map (§4.5, §4.6).
//!
//! Keys form an interval `[index_begin, index_end)`; seqnos inside the
//! interval that are absent are "holes" represented by `None`. Push/pop
//! at either end and random-index insert/erase are all O(1) amortized;
//! the ends auto-trim holes so `front`/`back` are never `None` while
//! the map is non-empty.

use super::buffer::BufferId;
use crate::gtid::Seqno;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct SeqnoMap {
    /// `slots[i]` holds the buffer for seqno `index_begin + i as i64`.
    slots: VecDeque<Option<BufferId>>,
    index_begin: i64,
    index_end: i64,
}

impl SeqnoMap {
    #[must_use]
    pub fn new() -> Self {
        Self { slots: VecDeque::new(), index_begin: 1, index_end: 1 }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn index_begin(&self) -> i64 {
        self.index_begin
    }

    #[must_use]
    pub fn index_end(&self) -> i64 {
        self.index_end
    }

    /// Insert at `seqno`, which must be `>= index_end` (seqnos only
    /// ever grow; `seqno_assign` requires strictly increasing seqnos).
    ///
    /// # Panics
    /// Panics if `seqno < index_end` - the seqno→pointer map is never
    /// asked to insert behind its current frontier.
    pub fn push_back(&mut self, seqno: Seqno, id: BufferId) {
        let s = seqno.get();
        assert!(s >= self.index_end, "seqno_map: seqno {s} behind index_end {}", self.index_end);
        if self.slots.is_empty() {
            self.index_begin = s;
            self.index_end = s;
        }
        while self.index_end < s {
            self.slots.push_back(None); // hole
            self.index_end += 1;
        }
        self.slots.push_back(Some(id));
        self.index_end += 1;
        self.trim_back_holes();
    }

    #[must_use]
    pub fn get(&self, seqno: Seqno) -> Option<BufferId> {
        let s = seqno.get();
        if s < self.index_begin || s >= self.index_end {
            return None;
        }
        self.slots[(s - self.index_begin) as usize]
    }

    /// Erase the entry at `seqno`, leaving a hole unless it was at an
    /// end, in which case the end is trimmed past any resulting holes.
    pub fn erase(&mut self, seqno: Seqno) {
        let s = seqno.get();
        if s < self.index_begin || s >= self.index_end {
            return;
        }
        let idx = (s - self.index_begin) as usize;
        self.slots[idx] = None;
        self.trim_front_holes();
        self.trim_back_holes();
    }

    fn trim_front_holes(&mut self) {
        while self.slots.front().is_some_and(Option::is_none) {
            self.slots.pop_front();
            self.index_begin += 1;
        }
        if self.slots.is_empty() {
            self.index_end = self.index_begin;
        }
    }

    fn trim_back_holes(&mut self) {
        while self.slots.back().is_some_and(Option::is_none) {
            self.slots.pop_back();
            self.index_end -= 1;
        }
        if self.slots.is_empty() {
            self.index_begin = self.index_end;
        }
    }

    #[must_use]
    pub fn front(&self) -> Option<(Seqno, BufferId)> {
        self.slots.front().and_then(|s| s.map(|id| (Seqno::new(self.index_begin), id)))
    }

    #[must_use]
    pub fn back(&self) -> Option<(Seqno, BufferId)> {
        self.slots.back().and_then(|s| s.map(|id| (Seqno::new(self.index_end - 1), id)))
    }

    /// Iterate populated `(seqno, id)` pairs from `start` upward,
    /// stopping at the first hole - the contract `seqno_get_buffers`
    /// needs for IST (§4.5).
    pub fn contiguous_from(&self, start: Seqno) -> impl Iterator<Item = (Seqno, BufferId)> + '_ {
        let mut s = start.get();
        std::iter::from_fn(move || {
            if s < self.index_begin || s >= self.index_end {
                return None;
            }
            let idx = (s - self.index_begin) as usize;
            let id = self.slots[idx]?;
            let out = (Seqno::new(s), id);
            s += 1;
            Some(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::buffer::StoreTag;

    fn id(off: u64) -> BufferId {
        BufferId { store: StoreTag::Rb, offset: off }
    }

    #[test]
    fn push_back_contiguous() {
        let mut m = SeqnoMap::new();
        m.push_back(Seqno::new(1), id(1));
        m.push_back(Seqno::new(2), id(2));
        m.push_back(Seqno::new(3), id(3));
        assert_eq!(m.index_begin(), 1);
        assert_eq!(m.index_end(), 4);
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn holes_tracked_and_trimmed() {
        let mut m = SeqnoMap::new();
        m.push_back(Seqno::new(1), id(1));
        m.push_back(Seqno::new(2), id(2));
        m.push_back(Seqno::new(3), id(3));
        m.erase(Seqno::new(2));
        assert_eq!(m.get(Seqno::new(2)), None);
        assert_eq!(m.get(Seqno::new(1)), Some(id(1)));
        // erase the tail: back should trim to the new last live entry
        m.erase(Seqno::new(3));
        assert_eq!(m.index_end(), 2);
        assert_eq!(m.back(), Some((Seqno::new(1), id(1))));
    }

    #[test]
    fn scenario_8_seqno_release_empties_map() {
        // §8 scenario 8: {1,2,3,5,6}, no holders -> release(6) empties map.
        let mut m = SeqnoMap::new();
        for s in [1, 2, 3, 5, 6] {
            m.push_back(Seqno::new(s), id(s as u64));
        }
        for s in [1, 2, 3, 5, 6] {
            m.erase(Seqno::new(s));
        }
        assert!(m.is_empty());
        assert_eq!(m.index_begin(), m.index_end());
    }

    #[test]
    fn contiguous_from_stops_at_hole() {
        let mut m = SeqnoMap::new();
        m.push_back(Seqno::new(1), id(1));
        m.push_back(Seqno::new(2), id(2));
        m.push_back(Seqno::new(3), id(3));
        m.erase(Seqno::new(2));
        let got: Vec<_> = m.contiguous_from(Seqno::new(1)).collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0.get(), 1);
    }

    #[test]
    #[should_panic(expected = "behind index_end")]
    fn push_back_behind_frontier_panics() {
        let mut m = SeqnoMap::new();
        m.push_back(Seqno::new(5), id(5));
        m.push_back(Seqno::new(3), id(3));
    }
}
