// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Append-only page-file tier (§4.7).
//!
//! Sequentially numbered `gcache.page.NNNNNN` files, each mmap'd whole
//! on creation and used as a non-circular bump allocator. A page is
//! retired (no further allocations) once a request doesn't fit in its
//! remainder; a new page is opened instead. Pages are only ever dropped
//! from the front of the list, and only once their last live buffer has
//! been freed, mirroring the original store's "some free pages can be
//! locked in the middle for a while" tradeoff.
//!
//! File deletion happens off the calling thread. The original spawns a
//! detached `pthread`; here a background worker drains a `crossbeam`
//! channel (§9 redesign note - no raw thread spawn-per-delete).

use super::buffer::{decode_header, encode_header, BufferHeader, STORE_TAG_PAGE, WIRE_HEADER_SIZE};
use crate::error::GcacheError;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

fn page_file_name(dir: &Path, count: u32) -> PathBuf {
    dir.join(format!("gcache.page.{count:06}"))
}

/// Advise the kernel that a retired page's pages are unlikely to be
/// touched again, so they don't sit pinned in the page cache (§4.7
/// `drop_fs_cache`). Best-effort: the page's fd was closed once mapped,
/// so this reopens the file briefly just to issue the hint.
fn drop_fs_cache(path: &Path, len: u64) {
    let Ok(file) = OpenOptions::new().read(true).open(path) else { return };
    // SAFETY: `file` is a valid, open file descriptor for the duration
    // of this call; POSIX_FADV_DONTNEED is advisory and its failure
    // (e.g. ENOSYS on some platforms) has no correctness effect.
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, len as libc::off_t, libc::POSIX_FADV_DONTNEED);
    }
}

struct Page {
    id: u32,
    path: PathBuf,
    ptr: *mut u8,
    size: usize,
    next_offset: usize,
    /// Count of buffers allocated from this page that are not yet
    /// released - the page can only be deleted once this hits zero.
    used: u32,
}

// SAFETY: all access is serialized behind the façade's gcache mutex.
unsafe impl Send for Page {}

impl Drop for Page {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`size` describe the mapping created in `new_page`.
        unsafe {
            libc::munmap(self.ptr.cast(), self.size);
        }
    }
}

impl Page {
    fn remaining(&self) -> usize {
        self.size - self.next_offset
    }

    fn header_at(&self, offset: usize) -> BufferHeader {
        let mut buf = [0u8; WIRE_HEADER_SIZE];
        // SAFETY: offset + WIRE_HEADER_SIZE <= size by construction.
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.add(offset), buf.as_mut_ptr(), WIRE_HEADER_SIZE);
        }
        decode_header(&buf)
    }

    fn write_header(&mut self, offset: usize, bh: &BufferHeader) {
        let buf = encode_header(bh);
        // SAFETY: see `header_at`.
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), self.ptr.add(offset), WIRE_HEADER_SIZE);
        }
    }

    fn payload_ptr(&self, header_offset: usize) -> *mut u8 {
        // SAFETY: see `header_at`.
        unsafe { self.ptr.add(header_offset + WIRE_HEADER_SIZE) }
    }
}

/// Deletion work handed to the background unlink worker.
enum DeleteJob {
    Remove(PathBuf),
    Stop,
}

/// Background worker draining page-file removals so the caller never
/// blocks on `unlink(2)` (§9 redesign note).
struct Deleter {
    tx: crossbeam::channel::Sender<DeleteJob>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Deleter {
    fn spawn() -> Self {
        let (tx, rx) = crossbeam::channel::unbounded::<DeleteJob>();
        let handle = std::thread::spawn(move || {
            for job in rx {
                match job {
                    DeleteJob::Remove(path) => {
                        if let Err(e) = std::fs::remove_file(&path) {
                            crate::warn!("failed to remove page file {:?}: {e}", path);
                        }
                    }
                    DeleteJob::Stop => break,
                }
            }
        });
        Self { tx, handle: Some(handle) }
    }

    fn submit(&self, path: PathBuf) {
        let _ = self.tx.send(DeleteJob::Remove(path));
    }
}

impl Drop for Deleter {
    fn drop(&mut self) {
        let _ = self.tx.send(DeleteJob::Stop);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// The page-file tier (§4.7).
pub struct PageStore {
    dir: PathBuf,
    page_size: u64,
    keep_size: u64,
    keep_pages: usize,
    debug: i32,
    count: u32,
    pages: VecDeque<Page>,
    total_size: u64,
    deleter: Deleter,
}

impl PageStore {
    #[must_use]
    pub fn new(dir: PathBuf, page_size: u64, keep_size: u64, keep_pages: usize, debug: i32) -> Self {
        Self {
            dir,
            page_size,
            keep_size,
            keep_pages,
            debug,
            count: 0,
            pages: VecDeque::new(),
            total_size: 0,
            deleter: Deleter::spawn(),
        }
    }

    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn new_page(&mut self, min_size: u64) -> Result<(), GcacheError> {
        let size = min_size.max(self.page_size).max(WIRE_HEADER_SIZE as u64) as usize;
        let path = page_file_name(&self.dir, self.count);
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        file.set_len(size as u64)?;
        // SAFETY: `file` is sized to `size` and kept open for the
        // mapping's lifetime (the fd itself can close once mapped;
        // `MAP_SHARED` keeps the mapping backed by the file).
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(GcacheError::Io(io::Error::last_os_error()));
        }
        if let Some(retired) = self.pages.back() {
            drop_fs_cache(&retired.path, retired.size as u64);
        }
        self.pages.push_back(Page {
            id: self.count,
            path,
            ptr: ptr.cast(),
            size,
            next_offset: 0,
            used: 0,
        });
        self.total_size += size as u64;
        self.count += 1;
        if self.debug != 0 {
            crate::debug!("gcache: opened page {}", self.count - 1);
        }
        Ok(())
    }

    /// Allocate `payload_size` bytes from the current page, opening a
    /// fresh page if the current one (or none yet) can't fit it.
    ///
    /// # Errors
    /// Propagates I/O failures from creating a new page file.
    pub fn malloc(&mut self, payload_size: usize) -> Result<(u32, u64), GcacheError> {
        let need = WIRE_HEADER_SIZE + payload_size;
        let fits_current = self.pages.back().is_some_and(|p| p.remaining() >= need);
        if !fits_current {
            self.new_page(need as u64)?;
        }
        let page = self.pages.back_mut().expect("just ensured a page exists");
        let offset = page.next_offset;
        let header = BufferHeader::new(need as u64, STORE_TAG_PAGE);
        page.write_header(offset, &header);
        page.next_offset += need;
        page.used += 1;
        let id = page.id;
        self.cleanup();
        Ok((id, offset as u64))
    }

    fn find_page_mut(&mut self, id: u32) -> Option<&mut Page> {
        self.pages.iter_mut().find(|p| p.id == id)
    }

    #[must_use]
    pub fn header(&self, id: u32, offset: u64) -> Option<BufferHeader> {
        self.pages.iter().find(|p| p.id == id).map(|p| p.header_at(offset as usize))
    }

    #[must_use]
    pub fn payload(&self, id: u32, offset: u64, len: usize) -> Option<&[u8]> {
        let page = self.pages.iter().find(|p| p.id == id)?;
        // SAFETY: `len` comes from a header this same page wrote.
        Some(unsafe { std::slice::from_raw_parts(page.payload_ptr(offset as usize), len) })
    }

    pub fn payload_mut(&mut self, id: u32, offset: u64, len: usize) -> Option<&mut [u8]> {
        let page = self.find_page_mut(id)?;
        // SAFETY: see `payload`.
        Some(unsafe { std::slice::from_raw_parts_mut(page.payload_ptr(offset as usize), len) })
    }

    /// Mark the buffer at `(id, offset)` released and drop this page's
    /// live-buffer count, making it eligible for deletion (§4.7).
    pub fn free(&mut self, id: u32, offset: u64) {
        let Some(page) = self.find_page_mut(id) else { return };
        let mut h = page.header_at(offset as usize);
        if !h.is_released() {
            h.release();
            page.write_header(offset as usize, &h);
            page.used = page.used.saturating_sub(1);
        }
        self.cleanup();
    }

    /// `true` if the page has no live buffers left and sits at the
    /// front of the queue, i.e. it is a deletion candidate.
    fn delete_front_if_empty(&mut self) -> bool {
        let Some(front) = self.pages.front() else { return false };
        if front.used > 0 {
            return false;
        }
        let page = self.pages.pop_front().expect("checked front above");
        self.total_size -= page.size as u64;
        drop_fs_cache(&page.path, page.size as u64);
        self.deleter.submit(page.path.clone());
        true
    }

    /// §4.7 cleanup: unlink oldest zero-use pages while over budget
    /// (only ever from the front, so a busy middle page can pin older
    /// ones in place for a while - kept for simplicity, as upstream).
    pub fn cleanup(&mut self) {
        while self.total_size > self.keep_size && self.pages.len() > self.keep_pages {
            if !self.delete_front_if_empty() {
                break;
            }
        }
    }

    /// Force-delete every page regardless of use count (§4.7 `reset`).
    pub fn reset(&mut self) {
        while let Some(page) = self.pages.pop_front() {
            self.total_size -= page.size as u64;
            drop_fs_cache(&page.path, page.size as u64);
            self.deleter.submit(page.path.clone());
        }
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocates_and_rolls_to_new_page() {
        let dir = tempdir().unwrap();
        let mut ps = PageStore::new(dir.path().to_path_buf(), 128, 0, 0, 0);
        let (p0, o0) = ps.malloc(40).unwrap();
        let (p1, _o1) = ps.malloc(100).unwrap();
        assert_eq!(p0, 0);
        assert!(p1 >= p0);
        assert!(ps.payload(p0, o0, 40).is_some());
    }

    #[test]
    fn cleanup_deletes_only_from_front_when_unused() {
        let dir = tempdir().unwrap();
        let mut ps = PageStore::new(dir.path().to_path_buf(), 64, 0, 0, 0);
        let (p0, o0) = ps.malloc(20).unwrap();
        let (_p1, _o1) = ps.malloc(20).unwrap();
        ps.free(p0, o0);
        ps.cleanup();
        assert!(ps.page_count() <= 2);
    }

    #[test]
    fn busy_page_blocks_cleanup_of_later_ones() {
        let dir = tempdir().unwrap();
        let mut ps = PageStore::new(dir.path().to_path_buf(), 64, 0, 0, 0);
        let (p0, _o0) = ps.malloc(20).unwrap();
        let (p1, o1) = ps.malloc(20).unwrap();
        // free only the newer page; the older one (p0) still has a live
        // buffer, so nothing can be unlinked from the front.
        ps.free(p1, o1);
        let before = ps.page_count();
        ps.cleanup();
        assert_eq!(ps.page_count(), before);
        let _ = p0;
    }
}
