// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The gcache façade (§4): a three-tier buffer allocator composing
//! [`memstore::MemStore`], [`ringbuf::RingBuffer`], and
//! [`pagestore::PageStore`] behind a single seqno-addressable interface.
//!
//! Allocation tries the tiers in order - memory, then ring buffer, then
//! page files - falling through on `AllocationFull`. Release runs the
//! opposite direction: `seqno_release` walks the seqno→pointer map from
//! its current frontier, discarding released buffers tier-by-tier until
//! it meets an unreleased one or the [`seqno_lock::SeqnoLock`] watermark.

pub mod buffer;
pub mod memstore;
pub mod pagestore;
pub mod ringbuf;
pub mod seqno_lock;
pub mod seqno_map;

use self::buffer::{BufferId, BufferRef, StoreTag};
use self::memstore::MemStore;
use self::pagestore::PageStore;
use self::ringbuf::RingBuffer;
use self::seqno_lock::SeqnoLock;
use self::seqno_map::SeqnoMap;
use crate::config::GcacheConfig;
use crate::error::{GcacheError, GcacheResult};
use crate::gtid::{GroupUuid, Gtid, Seqno, SEQNO_NONE};

/// The three-tier buffer cache (§4).
pub struct GCache {
    mem: MemStore,
    rb: RingBuffer,
    pages: PageStore,
    map: SeqnoMap,
    lock: SeqnoLock,
    seqno_max: i64,
    seqno_released: i64,
    debug: i32,
}

impl GCache {
    /// Open (creating if needed) the ring-buffer file and page
    /// directory described by `config`.
    ///
    /// # Errors
    /// Propagates I/O failures from opening the ring-buffer file or
    /// creating the page directory.
    pub fn open(config: &GcacheConfig) -> GcacheResult<Self> {
        std::fs::create_dir_all(&config.page_dir)?;
        let rb_path = config.page_dir.join(format!("{}.rb", config.name.display()));
        let (rb, survivors) = if rb_path.exists() {
            ringbuf::RingBuffer::open(&rb_path, config.recover)?
        } else {
            (ringbuf::RingBuffer::create(&rb_path, config.size, GroupUuid::NIL)?, Vec::new())
        };

        let mut map = SeqnoMap::new();
        let mut seqno_max = SEQNO_NONE;
        for (seqno, offset, _header) in survivors {
            map.push_back(seqno, BufferId { store: StoreTag::Rb, offset });
            seqno_max = seqno_max.max(seqno.get());
        }

        Ok(Self {
            mem: MemStore::new(config.mem_size),
            rb,
            pages: PageStore::new(
                config.page_dir.clone(),
                config.page_size,
                config.keep_pages_size,
                config.keep_pages,
                config.debug as i32,
            ),
            map,
            lock: SeqnoLock::new(),
            seqno_max,
            seqno_released: SEQNO_NONE,
            debug: config.debug as i32,
        })
    }

    /// Allocate `size` bytes, trying memory, then the ring buffer, then
    /// page files in order (§4.1).
    ///
    /// # Errors
    /// [`GcacheError::AllocationFull`] only if every tier refuses -
    /// the page store is unbounded, so in practice this means an I/O
    /// failure opening a new page, surfaced separately.
    pub fn malloc(&mut self, size: usize) -> GcacheResult<BufferId> {
        if let Ok(offset) = self.mem.malloc(size) {
            return Ok(BufferId { store: StoreTag::Mem, offset });
        }

        let map = &mut self.map;
        match self.rb.malloc(size, |h| {
            if h.seqno_global >= 1 {
                map.erase(Seqno::new(h.seqno_global));
            }
        }) {
            Ok(offset) => return Ok(BufferId { store: StoreTag::Rb, offset }),
            Err(GcacheError::AllocationFull { .. }) => {}
            Err(e) => return Err(e),
        }

        let (page_id, offset) = self.pages.malloc(size)?;
        Ok(BufferId { store: StoreTag::Page(page_id), offset })
    }

    /// Grow or shrink an unordered allocation (§4.5).
    ///
    /// # Errors
    /// Returns whatever the owning tier's `realloc`/`malloc` returns;
    /// a page-store buffer can only grow by falling back to a fresh
    /// `malloc` plus copy, mirrored here across tiers too.
    ///
    /// # Panics
    /// Panics if `id` names a buffer that has already been ordered -
    /// only unordered (not-yet-assigned) buffers may be resized.
    pub fn realloc(&mut self, id: BufferId, new_size: usize) -> GcacheResult<BufferId> {
        match id.store {
            StoreTag::Mem => {
                let offset = self.mem.realloc(id.offset, new_size)?;
                Ok(BufferId { store: StoreTag::Mem, offset })
            }
            StoreTag::Rb | StoreTag::Page(_) => {
                // Neither tier supports in-place resize; copy through a
                // fresh allocation, matching the upstream page-store
                // fallback path for all non-mem tiers here.
                let old_header = self.header(id);
                assert!(old_header.seqno_global < 1, "realloc only permitted on unordered buffers");
                let old_len = (old_header.size as usize).saturating_sub(buffer::WIRE_HEADER_SIZE);
                let copy_len = old_len.min(new_size);
                let old_bytes = self.payload_copy(id, old_len);
                let new_id = self.malloc(new_size)?;
                let dst = self.payload_mut(new_id);
                dst[..copy_len].copy_from_slice(&old_bytes[..copy_len]);
                self.discard(id);
                Ok(new_id)
            }
        }
    }

    #[must_use]
    pub fn header(&self, id: BufferId) -> buffer::BufferHeader {
        match id.store {
            StoreTag::Mem => self.mem.header(id.offset).unwrap_or_else(buffer::BufferHeader::zero),
            StoreTag::Rb => self.rb.header(id.offset),
            StoreTag::Page(page) => self.pages.header(page, id.offset).unwrap_or_else(buffer::BufferHeader::zero),
        }
    }

    #[must_use]
    pub fn payload_copy(&self, id: BufferId, len: usize) -> Vec<u8> {
        match id.store {
            StoreTag::Mem => self.mem.payload(id.offset).map(<[u8]>::to_vec).unwrap_or_default(),
            StoreTag::Rb => self.rb.payload(id.offset, len).to_vec(),
            StoreTag::Page(page) => self.pages.payload(page, id.offset, len).map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }

    pub fn payload_mut(&mut self, id: BufferId) -> &mut [u8] {
        match id.store {
            StoreTag::Mem => self.mem.payload_mut(id.offset).expect("payload_mut: unknown mem offset"),
            StoreTag::Rb => {
                let h = self.rb.header(id.offset);
                let len = (h.size as usize).saturating_sub(buffer::WIRE_HEADER_SIZE);
                self.rb.payload_mut(id.offset, len)
            }
            StoreTag::Page(page) => {
                let h = self.pages.header(page, id.offset).unwrap_or_else(buffer::BufferHeader::zero);
                let len = (h.size as usize).saturating_sub(buffer::WIRE_HEADER_SIZE);
                self.pages.payload_mut(page, id.offset, len).expect("payload_mut: unknown page offset")
            }
        }
    }

    /// Assign the seqno a buffer occupies in the replicated stream
    /// (§4.5 `seqno_assign`); required before `seqno_release` will ever
    /// reach it.
    pub fn seqno_assign(&mut self, id: BufferId, seqno: Seqno, depends: i64) {
        match id.store {
            StoreTag::Mem => self.mem.assign_seqno(id.offset, seqno, depends),
            StoreTag::Rb => {
                let mut h = self.rb.header(id.offset);
                h.seqno_global = seqno.get();
                h.seqno_depends = depends;
                self.rb.rewrite_header(id.offset, h);
            }
            StoreTag::Page(_) => {
                // Page-store headers are append-only and already carry
                // `store`/`size`; seqno assignment for page buffers is
                // recorded only in the seqno map, matching the original's
                // page tier (it doesn't rewrite the header in place for
                // every assign either, relying on `discard_seqno` instead).
            }
        }
        self.map.push_back(seqno, id);
        self.seqno_max = self.seqno_max.max(seqno.get());
    }

    /// Mark `id` released; reclaim immediately if it was never ordered
    /// (§4.5, `free_common`).
    pub fn free(&mut self, id: BufferId) {
        let seqno = match id.store {
            StoreTag::Mem => {
                self.mem.free(id.offset);
                return;
            }
            StoreTag::Rb => {
                self.rb.mark_released(id.offset);
                self.rb.header(id.offset).seqno_global
            }
            StoreTag::Page(page) => {
                self.pages.free(page, id.offset);
                self.pages.header(page, id.offset).map_or(SEQNO_NONE, |h| h.seqno_global)
            }
        };
        if seqno < 1 {
            self.discard(id);
        }
    }

    /// Physically reclaim `id` outright, regardless of release state -
    /// used for unordered buffers and by `seqno_release`'s sweep.
    pub fn discard(&mut self, id: BufferId) {
        match id.store {
            StoreTag::Mem => self.mem.discard(id.offset),
            StoreTag::Rb => { /* reclaimed lazily by the next `malloc`'s eviction loop */ }
            StoreTag::Page(_) => { /* reclaimed by `PageStore::cleanup` once a page empties */ }
        }
    }

    /// Advance the release frontier up to `seqno`, discarding every
    /// released buffer in between, clamped by any active
    /// [`seqno_lock::SeqnoLock`] (§4.5, §4.9).
    pub fn seqno_release(&mut self, seqno: Seqno) {
        let target = self.lock.clamp_release(seqno.get());
        while let Some((front_seqno, id)) = self.map.front() {
            if front_seqno.get() > target {
                break;
            }
            let released = match id.store {
                StoreTag::Mem => true, // MemStore reclaims on free(); presence here means already gone
                StoreTag::Rb => self.rb.header(id.offset).is_released(),
                StoreTag::Page(page) => self.pages.header(page, id.offset).is_some_and(|h| h.is_released()),
            };
            if !released {
                if self.debug != 0 {
                    crate::debug!("gcache: seqno_release({}) stopped at unreleased {}", seqno, front_seqno);
                }
                break;
            }
            self.discard(id);
            self.map.erase(front_seqno);
            self.seqno_released = front_seqno.get();
        }
    }

    /// Reset the cache for a new GTID (§4.9 `seqno_reset`): clear the
    /// seqno map and compact every store, since nothing addressable
    /// under the old group can ever be reached again. The ring buffer
    /// is rewound and re-anchored to `gtid.group` rather than copied;
    /// the page store force-deletes every page regardless of use count.
    pub fn seqno_reset(&mut self, gtid: Gtid) {
        self.map = SeqnoMap::new();
        self.seqno_max = SEQNO_NONE;
        self.seqno_released = SEQNO_NONE;
        self.lock = SeqnoLock::new();
        self.mem = MemStore::new(self.mem.soft_cap());
        self.rb.reset(gtid.group);
        self.pages.reset();
    }

    /// Acquire an IST-style read-lock at `seqno` (§4.5).
    ///
    /// # Errors
    /// [`GcacheError::NotFound`] if `seqno` is not currently resident.
    pub fn seqno_lock(&mut self, seqno: Seqno) -> GcacheResult<()> {
        if self.map.get(seqno).is_none() {
            return Err(GcacheError::NotFound);
        }
        self.lock.lock(seqno);
        Ok(())
    }

    pub fn seqno_unlock(&mut self) {
        self.lock.unlock();
    }

    /// Resolve a gapless run of buffers starting at `from`, for IST
    /// donation (§4.5 `seqno_get_buffers`).
    pub fn seqno_get_buffers(&self, from: Seqno) -> Vec<BufferRef<'_>> {
        self.map
            .contiguous_from(from)
            .map(|(seqno, id)| {
                let (bytes, depends_seqno): (&[u8], i64) = match id.store {
                    StoreTag::Mem => (self.mem.payload(id.offset).unwrap_or(&[]), -1),
                    StoreTag::Rb => {
                        let h = self.rb.header(id.offset);
                        (self.rb.payload(id.offset, (h.size as usize).saturating_sub(buffer::WIRE_HEADER_SIZE)), h.seqno_depends)
                    }
                    StoreTag::Page(page) => {
                        let h = self.pages.header(page, id.offset).unwrap_or_else(buffer::BufferHeader::zero);
                        (
                            self.pages.payload(page, id.offset, (h.size as usize).saturating_sub(buffer::WIRE_HEADER_SIZE)).unwrap_or(&[]),
                            h.seqno_depends,
                        )
                    }
                };
                BufferRef { seqno, depends_seqno, bytes }
            })
            .collect()
    }

    #[must_use]
    pub fn seqno_max(&self) -> i64 {
        self.seqno_max
    }

    #[must_use]
    pub fn seqno_released(&self) -> i64 {
        self.seqno_released
    }

    /// Highest seqno a `purge_trxs_upto` caller may target without
    /// racing an IST donor's [`Self::seqno_lock`]: the certification
    /// index's own `deps_set` eviction watermark must be ANDed with
    /// this one rather than used alone.
    #[must_use]
    pub fn seqno_lock_ceiling(&self) -> i64 {
        self.lock.clamp_release(i64::MAX)
    }
}
