//! Virtual file descriptor cache.
//!
//! Decouples the logical number of files a backend wants open from the
//! process's OS descriptor ceiling. Every logical file gets a small integer
//! handle (a [`Vfd`]) that may or may not currently have a real descriptor
//! behind it; [`VfdCache::access`] is the operation that guarantees one,
//! evicting the least-recently-used open entry if the process is at its
//! budget. Callers never see an OS descriptor directly.
//!
//! Ground-truth shape: slot 0 is a sentinel that never holds a real file,
//! used purely as the head/tail anchor of a circular doubly-linked LRU
//! ring (`lru_more_recently`/`lru_less_recently`). Slots not currently on
//! the ring sit on a singly-linked free list threaded through the same
//! `next_free` field, also anchored at slot 0. This lets one array serve
//! both purposes without a separate free-list allocation.

use std::fs::{File as StdFile, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::common::{Component, HealthStatus};
use crate::error::{DbError, Result};

/// Opaque handle into the VFD cache. Index 0 is reserved for the LRU
/// sentinel and is never handed out by [`VfdCache::open`].
pub type Vfd = u32;

const SENTINEL: Vfd = 0;
const INITIAL_CAPACITY: usize = 32;

/// Small state bitmask for a vfd entry. Two bits is not worth pulling in a
/// bitflags crate for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FdState(u8);

impl FdState {
    const DIRTY: u8 = 1 << 0;
    const TEMPORARY: u8 = 1 << 1;

    fn empty() -> Self {
        FdState(0)
    }

    fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    fn remove(&mut self, bit: u8) {
        self.0 &= !bit;
    }
}

impl std::ops::BitOrAssign<u8> for FdState {
    fn bitor_assign(&mut self, bit: u8) {
        self.0 |= bit;
    }
}

struct Entry {
    fd: Option<StdFile>,
    filename: PathBuf,
    flags: i32,
    mode: u32,
    seek_pos: u64,
    state: FdState,
    lru_more_recently: Vfd,
    lru_less_recently: Vfd,
    next_free: Vfd,
}

impl Entry {
    fn closed(filename: PathBuf, flags: i32, mode: u32) -> Self {
        Self {
            fd: None,
            filename,
            flags,
            mode,
            seek_pos: 0,
            state: FdState::empty(),
            lru_more_recently: SENTINEL,
            lru_less_recently: SENTINEL,
            next_free: SENTINEL,
        }
    }

    fn sentinel() -> Self {
        Self::closed(PathBuf::new(), 0, 0)
    }

    fn is_open(&self) -> bool {
        self.fd.is_some()
    }
}

struct Inner {
    slots: Vec<Entry>,
    open_count: usize,
    allocated_file_count: usize,
    temp_counter: u64,
}

/// The cache itself. `budget` is the ceiling on real descriptors this cache
/// may hold open simultaneously (already reduced by the caller's
/// reservation for the rest of the process, e.g. listening sockets).
pub struct VfdCache {
    budget: usize,
    inner: Mutex<Inner>,
    pid: u32,
    next_seq: AtomicU64,
    allocated_file_budget: AtomicU32,
}

impl VfdCache {
    pub fn new(budget: usize) -> Self {
        let mut slots = Vec::with_capacity(INITIAL_CAPACITY);
        slots.push(Entry::sentinel());
        Self {
            budget,
            inner: Mutex::new(Inner {
                slots,
                open_count: 0,
                allocated_file_count: 0,
                temp_counter: 0,
            }),
            pid: std::process::id(),
            next_seq: AtomicU64::new(0),
            allocated_file_budget: AtomicU32::new(32),
        }
    }

    /// Register a new logical file (closed, no descriptor consumed yet) and
    /// return its handle.
    pub fn open(&self, path: impl AsRef<Path>, flags: i32, mode: u32) -> Vfd {
        let mut inner = self.inner.lock();
        let file = allocate_vfd(&mut inner);
        let entry = &mut inner.slots[file as usize];
        entry.filename = path.as_ref().to_path_buf();
        entry.flags = flags;
        entry.mode = mode;
        file
    }

    /// Register and immediately ensure an open descriptor for a fresh
    /// temporary file named from this process's pid and an internal
    /// counter, matching the naming scheme callers expect for spill files.
    pub fn open_temporary(&self, dir: impl AsRef<Path>) -> Result<Vfd> {
        let counter = {
            let mut inner = self.inner.lock();
            inner.temp_counter += 1;
            inner.temp_counter
        };
        let name = format!("pg_sorttemp{}.{}", self.pid, counter);
        let path = dir.as_ref().join(name);
        let flags = libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC;
        let vfd = self.open(&path, flags, 0o600);
        {
            let mut inner = self.inner.lock();
            inner.slots[vfd as usize].state |= FdState::TEMPORARY;
        }
        self.access(vfd)?;
        Ok(vfd)
    }

    /// Guarantee `file` has a live OS descriptor, evicting the
    /// least-recently-used open entry as needed to stay under budget, then
    /// splice `file` to the most-recently-used position. This is the single
    /// choke point every read/write/seek goes through.
    pub fn access(&self, file: Vfd) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.slots[file as usize].is_open() {
            self.reopen(&mut inner, file)
        } else if inner.slots[SENTINEL as usize].lru_less_recently != file {
            lru_unlink(&mut inner, file);
            lru_insert(&mut inner, file);
            Ok(())
        } else {
            Ok(())
        }
    }

    fn reopen(&self, inner: &mut Inner, file: Vfd) -> Result<()> {
        while inner.open_count >= self.budget {
            if !release_lru(inner) {
                break;
            }
        }

        let entry = &inner.slots[file as usize];
        let path = entry.filename.clone();
        let flags = entry.flags;
        let mode = entry.mode;
        let seek_pos = entry.seek_pos;

        let std_file = open_with_flags(&path, flags, mode).map_err(|source| DbError::VfdOpenFailed {
            path: path.display().to_string(),
            source,
        })?;

        let entry = &mut inner.slots[file as usize];
        entry.fd = Some(std_file);
        inner.open_count += 1;

        if seek_pos != 0 {
            inner.slots[file as usize]
                .fd
                .as_mut()
                .expect("just opened")
                .seek(SeekFrom::Start(seek_pos))?;
        }

        lru_insert(inner, file);
        Ok(())
    }

    pub fn read(&self, file: Vfd, buf: &mut [u8]) -> Result<usize> {
        self.access(file)?;
        let mut inner = self.inner.lock();
        let entry = inner.slots[file as usize].fd.as_mut().expect("accessed");
        let n = entry.read(buf)?;
        inner.slots[file as usize].seek_pos += n as u64;
        Ok(n)
    }

    pub fn write(&self, file: Vfd, buf: &[u8]) -> Result<usize> {
        self.access(file)?;
        let mut inner = self.inner.lock();
        let entry = inner.slots[file as usize].fd.as_mut().expect("accessed");
        let n = entry.write(buf)?;
        let slot = &mut inner.slots[file as usize];
        slot.seek_pos += n as u64;
        slot.state |= FdState::DIRTY;
        Ok(n)
    }

    pub fn seek(&self, file: Vfd, pos: SeekFrom) -> Result<u64> {
        self.access(file)?;
        let mut inner = self.inner.lock();
        let entry = inner.slots[file as usize].fd.as_mut().expect("accessed");
        let new_pos = entry.seek(pos)?;
        inner.slots[file as usize].seek_pos = new_pos;
        Ok(new_pos)
    }

    pub fn truncate(&self, file: Vfd, len: u64) -> Result<()> {
        self.access(file)?;
        let mut inner = self.inner.lock();
        let entry = inner.slots[file as usize].fd.as_mut().expect("accessed");
        entry.set_len(len)?;
        Ok(())
    }

    pub fn sync(&self, file: Vfd) -> Result<()> {
        self.access(file)?;
        let mut inner = self.inner.lock();
        let entry = inner.slots[file as usize].fd.as_mut().expect("accessed");
        entry.sync_all()?;
        inner.slots[file as usize].state.remove(FdState::DIRTY);
        Ok(())
    }

    pub fn mark_dirty(&self, file: Vfd) {
        let mut inner = self.inner.lock();
        inner.slots[file as usize].state |= FdState::DIRTY;
    }

    /// Drop the logical file entirely: close any open descriptor (syncing
    /// first if dirty), unlink temporary files from disk, unlink from the
    /// LRU ring, and return the slot to the free list.
    pub fn close(&self, file: Vfd) {
        let mut inner = self.inner.lock();
        if inner.slots[file as usize].is_open() {
            lru_unlink(&mut inner, file);
            self.close_entry(&mut inner, file);
        }
        let is_temp = inner.slots[file as usize].state.contains(FdState::TEMPORARY);
        let path = inner.slots[file as usize].filename.clone();
        if is_temp {
            let _ = std::fs::remove_file(&path);
        }
        free_vfd(&mut inner, file);
    }

    fn close_entry(&self, inner: &mut Inner, file: Vfd) {
        let entry = &mut inner.slots[file as usize];
        if entry.state.contains(FdState::DIRTY) {
            if let Some(f) = entry.fd.as_mut() {
                let _ = f.sync_all();
            }
            entry.state.remove(FdState::DIRTY);
        }
        entry.fd = None;
        inner.open_count -= 1;
    }

    /// Close every cached descriptor without forgetting the logical
    /// entries, for an end-of-transaction checkpoint that wants every dirty
    /// vfd synced but none of the registrations lost.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock();
        let open: Vec<Vfd> = inner
            .slots
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, e)| e.is_open())
            .map(|(i, _)| i as Vfd)
            .collect();
        for file in open {
            lru_unlink(&mut inner, file);
            self.close_entry(&mut inner, file);
        }
    }

    /// Drop every temporary file registered by this backend, mirroring the
    /// end-of-transaction cleanup hook.
    pub fn at_eoxact_files(&self) {
        let mut inner = self.inner.lock();
        let temp: Vec<Vfd> = inner
            .slots
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, e)| e.state.contains(FdState::TEMPORARY))
            .map(|(i, _)| i as Vfd)
            .collect();
        drop(inner);
        for file in temp {
            self.close(file);
        }
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().open_count
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Reserve one slot of the small auxiliary stdio pool that callers use
    /// for files the VFD LRU ring should never manage (config files,
    /// one-shot scans). Returns `Err` once the pool's own ceiling (~32) is
    /// exhausted, independent of the main VFD budget.
    pub fn allocate_file_slot(&self) -> Result<AllocatedFileGuard<'_>> {
        loop {
            let current = self.allocated_file_budget.load(Ordering::SeqCst);
            if current == 0 {
                return Err(DbError::AllocatedFilePoolExhausted { limit: 32 });
            }
            if self
                .allocated_file_budget
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(AllocatedFileGuard { cache: self });
            }
        }
    }
}

/// RAII handle for a slot reserved via [`VfdCache::allocate_file_slot`];
/// returns the slot to the pool on drop, mirroring `FreeFile`.
pub struct AllocatedFileGuard<'a> {
    cache: &'a VfdCache,
}

impl<'a> Drop for AllocatedFileGuard<'a> {
    fn drop(&mut self) {
        self.cache.allocated_file_budget.fetch_add(1, Ordering::SeqCst);
    }
}

fn open_with_flags(path: &Path, flags: i32, mode: u32) -> std::io::Result<StdFile> {
    let mut opts = OpenOptions::new();
    opts.read(flags & libc::O_WRONLY == 0);
    opts.write(flags & (libc::O_WRONLY | libc::O_RDWR) != 0);
    opts.create(flags & libc::O_CREAT != 0);
    opts.truncate(flags & libc::O_TRUNC != 0);
    opts.custom_flags(flags & !(libc::O_CREAT | libc::O_TRUNC | libc::O_WRONLY | libc::O_RDWR));
    opts.mode(mode);
    opts.open(path)
}

fn allocate_vfd(inner: &mut Inner) -> Vfd {
    if inner.slots[SENTINEL as usize].next_free == SENTINEL {
        let old_len = inner.slots.len();
        let mut new_len = old_len * 2;
        if new_len < INITIAL_CAPACITY {
            new_len = INITIAL_CAPACITY;
        }
        for i in old_len..new_len {
            let mut e = Entry::sentinel();
            e.next_free = if i + 1 == new_len { SENTINEL } else { (i + 1) as Vfd };
            inner.slots.push(e);
        }
        inner.slots[SENTINEL as usize].next_free = old_len as Vfd;
    }

    let file = inner.slots[SENTINEL as usize].next_free;
    inner.slots[SENTINEL as usize].next_free = inner.slots[file as usize].next_free;
    file
}

fn free_vfd(inner: &mut Inner, file: Vfd) {
    let entry = &mut inner.slots[file as usize];
    entry.filename = PathBuf::new();
    entry.state = FdState::empty();
    entry.next_free = inner.slots[SENTINEL as usize].next_free;
    inner.slots[SENTINEL as usize].next_free = file;
}

/// Unlink `file` from the LRU ring without closing it.
fn lru_unlink(inner: &mut Inner, file: Vfd) {
    let (more, less) = {
        let e = &inner.slots[file as usize];
        (e.lru_more_recently, e.lru_less_recently)
    };
    inner.slots[less as usize].lru_more_recently = more;
    inner.slots[more as usize].lru_less_recently = less;
}

/// Splice `file` in at the head of the ring (most-recently-used position,
/// adjacent to the sentinel).
fn lru_insert(inner: &mut Inner, file: Vfd) {
    let old_mru = inner.slots[SENTINEL as usize].lru_less_recently;
    inner.slots[file as usize].lru_more_recently = SENTINEL;
    inner.slots[file as usize].lru_less_recently = old_mru;
    inner.slots[SENTINEL as usize].lru_less_recently = file;
    inner.slots[old_mru as usize].lru_more_recently = file;
}

/// Close the single least-recently-used open entry. Returns `false` if the
/// ring is empty (nothing open to evict) — the caller must not spin forever
/// in that case.
fn release_lru(inner: &mut Inner) -> bool {
    let victim = inner.slots[SENTINEL as usize].lru_more_recently;
    if victim == SENTINEL {
        return false;
    }
    let entry = &mut inner.slots[victim as usize];
    entry.seek_pos = entry.fd.as_mut().and_then(|f| f.stream_position().ok()).unwrap_or(entry.seek_pos);
    if entry.state.contains(FdState::DIRTY) {
        if let Some(f) = entry.fd.as_mut() {
            let _ = f.sync_all();
        }
        entry.state.remove(FdState::DIRTY);
    }
    entry.fd = None;
    inner.open_count -= 1;
    lru_unlink(inner, victim);
    true
}

impl Component for VfdCache {
    /// `Degraded` once the ring is running at its full budget (every access
    /// from here on pays an eviction before it can proceed); `Unhealthy` only
    /// if the ring has been driven to zero open entries while still at
    /// budget, which would mean the free list and budget accounting have
    /// diverged.
    fn health_check(&self) -> HealthStatus {
        let open = self.open_count();
        if open > self.budget {
            HealthStatus::Unhealthy
        } else if open == self.budget && self.budget > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_close_reopen_read_roundtrips() {
        let dir = tempdir().unwrap();
        let cache = VfdCache::new(16);
        let path = dir.path().join("roundtrip");
        let vfd = cache.open(&path, libc::O_RDWR | libc::O_CREAT, 0o600);
        cache.write(vfd, b"hello vfd").unwrap();
        cache.close(vfd);

        let vfd2 = cache.open(&path, libc::O_RDWR, 0o600);
        cache.seek(vfd2, SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 9];
        let n = cache.read(vfd2, &mut buf).unwrap();
        assert_eq!(n, 9);
        assert_eq!(&buf, b"hello vfd");
        cache.close(vfd2);
    }

    #[test]
    fn budget_is_never_exceeded_across_many_opens() {
        let dir = tempdir().unwrap();
        let budget = 8;
        let cache = VfdCache::new(budget);
        let mut vfds = Vec::new();
        for i in 0..200 {
            let path = dir.path().join(format!("f{i}"));
            let vfd = cache.open(&path, libc::O_RDWR | libc::O_CREAT, 0o600);
            cache.write(vfd, b"x").unwrap();
            assert!(cache.open_count() <= budget);
            vfds.push(vfd);
        }
        for vfd in vfds {
            cache.close(vfd);
        }
    }

    #[test]
    fn least_recently_used_entry_is_evicted_first() {
        let dir = tempdir().unwrap();
        let cache = VfdCache::new(2);
        let a = cache.open(dir.path().join("a"), libc::O_RDWR | libc::O_CREAT, 0o600);
        let b = cache.open(dir.path().join("b"), libc::O_RDWR | libc::O_CREAT, 0o600);
        cache.access(a).unwrap();
        cache.access(b).unwrap();
        // touch a again so b becomes the LRU victim
        cache.access(a).unwrap();
        let c = cache.open(dir.path().join("c"), libc::O_RDWR | libc::O_CREAT, 0o600);
        cache.access(c).unwrap();
        assert!(cache.open_count() <= 2);
        cache.close(a);
        cache.close(b);
        cache.close(c);
    }

    #[test]
    fn allocated_file_pool_is_independent_of_main_budget() {
        let cache = VfdCache::new(16);
        let mut guards = Vec::new();
        for _ in 0..32 {
            guards.push(cache.allocate_file_slot().unwrap());
        }
        assert!(cache.allocate_file_slot().is_err());
        drop(guards.pop());
        assert!(cache.allocate_file_slot().is_ok());
    }

    #[test]
    fn health_degrades_once_ring_is_at_budget() {
        let dir = tempdir().unwrap();
        let cache = VfdCache::new(2);
        assert_eq!(cache.health_check(), HealthStatus::Healthy);
        let a = cache.open(dir.path().join("a"), libc::O_RDWR | libc::O_CREAT, 0o600);
        let b = cache.open(dir.path().join("b"), libc::O_RDWR | libc::O_CREAT, 0o600);
        cache.access(a).unwrap();
        cache.access(b).unwrap();
        assert_eq!(cache.health_check(), HealthStatus::Degraded);
        cache.close(a);
        cache.close(b);
    }

    #[test]
    fn temporary_file_is_removed_on_close() {
        let dir = tempdir().unwrap();
        let cache = VfdCache::new(16);
        let vfd = cache.open_temporary(dir.path()).unwrap();
        cache.write(vfd, b"scratch").unwrap();
        cache.close(vfd);
        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_none());
    }
}
