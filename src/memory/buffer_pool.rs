//! Shared and local buffer pools.
//!
//! The shared pool is a fixed array of buffer frames plus a parallel array
//! of page-sized data buffers, indexed by a `BufferTag -> frame` hash table
//! ([`crate::memory::hash_index::HashIndex`]) and a circular free list of
//! frames nobody has ever used. A buffer identifier is a signed integer:
//! positive values are 1-based indices into the shared pool, negative
//! values are 1-based indices (negated) into the local pool. Zero is never
//! a valid id.
//!
//! The local pool exists for relations only one backend can ever see (this
//! core treats every relation that way, since there is exactly one
//! backend): ordinary heap memory, round-robin replacement, no locking.
//!
//! Replacement in the shared pool is eligible only for frames with a pin
//! count of zero and no I/O currently in progress; candidates are found by
//! a rotating scan starting from wherever the last scan left off. The
//! sequence that matters for correctness under concurrent access: detach
//! the victim's old tag, install the new tag, and mark the frame
//! I/O-in-progress — all while still holding the table lock — before it is
//! ever released. Only after that transition is complete does the lock get
//! dropped, first for the victim's write-back if it was dirty, then for the
//! new block's disk read. Everything after the initial unlock only needs
//! the frame's I/O-in-progress bit to keep other backends from selecting it
//! as a victim a second time.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{BlockNumber, BufferTag, Component, HealthStatus, RelationId, BLOCK_SIZE};
use crate::error::{DbError, Result};
use crate::storage::md::MdManager;
use crate::storage::page::Page;

/// Signed buffer identifier: positive = shared (1-based), negative = local
/// (1-based, negated). There is no buffer id 0.
pub type BufferId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLockMode {
    Share,
    Exclusive,
}

struct Frame {
    tag: Option<BufferTag>,
    dirty: bool,
    valid: bool,
    io_in_progress: bool,
    pin_count: u32,
    needs_fsync: bool,
}

impl Frame {
    fn empty() -> Self {
        Self {
            tag: None,
            dirty: false,
            valid: false,
            io_in_progress: false,
            pin_count: 0,
            needs_fsync: false,
        }
    }

    fn eligible_for_replacement(&self) -> bool {
        self.pin_count == 0 && !self.io_in_progress
    }
}

struct Inner {
    frames: Vec<Frame>,
    pages: Vec<Page>,
    index: crate::memory::hash_index::HashIndex<BufferTag, usize>,
    free_list: Vec<usize>,
    clock_hand: usize,
}

/// Shared, concurrently-visible buffer pool.
pub struct BufferPool {
    num_buffers: usize,
    inner: Mutex<Inner>,
    storage: Arc<MdManager>,
    lock_bitmap: Mutex<Vec<Option<BufferLockMode>>>,
    shared_buffer_changed: std::sync::atomic::AtomicBool,
}

impl BufferPool {
    pub fn new(num_buffers: usize, _shmem: Arc<crate::memory::shmem::ShmemAllocator>, storage: Arc<MdManager>) -> Self {
        let frames = (0..num_buffers).map(|_| Frame::empty()).collect();
        let pages = (0..num_buffers).map(|_| Page::zeroed()).collect();
        let free_list = (0..num_buffers).collect();
        Self {
            num_buffers,
            inner: Mutex::new(Inner {
                frames,
                pages,
                index: crate::memory::hash_index::HashIndex::new((num_buffers / 4).max(1)),
                free_list,
                clock_hand: 0,
            }),
            storage,
            lock_bitmap: Mutex::new(vec![None; num_buffers]),
            shared_buffer_changed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn frame_index(id: BufferId) -> usize {
        debug_assert!(id > 0);
        (id - 1) as usize
    }

    /// Hit: bump the pin count under the table lock and return. Miss: for a
    /// `P_NEW` request (`block.is_new()`), extend the relation first and
    /// use the block number that produced; then select a victim frame (free
    /// list first, rotating scan otherwise), detach its old tag, install the
    /// new tag and mark I/O in progress — all while still holding the table
    /// lock — then unlock, write the victim back if it was dirty, read the
    /// new block from disk, relock, clear I/O-in-progress and mark the
    /// frame valid. Marking I/O-in-progress before the lock is dropped for
    /// the write-back keeps a concurrent miss's victim scan from selecting
    /// this same frame out from under us.
    pub fn read_buffer(&self, relation: RelationId, block: BlockNumber) -> Result<BufferId> {
        let block = if block.is_new() {
            self.storage.extend(relation, Page::zeroed().as_slice())?
        } else {
            block
        };
        let tag = BufferTag::new(relation, block);
        let mut inner = self.inner.lock();

        if let Some(&frame) = inner.index.find(&tag) {
            inner.frames[frame].pin_count += 1;
            return Ok((frame + 1) as BufferId);
        }

        let frame = self.select_victim(&mut inner)?;

        let old_tag = inner.frames[frame].tag.take();
        if let Some(old_tag) = old_tag {
            inner.index.remove(&old_tag);
        }
        let needs_writeback = inner.frames[frame].dirty;
        let old_page = if needs_writeback { Some(inner.pages[frame].clone()) } else { None };

        inner.frames[frame].tag = Some(tag);
        inner.frames[frame].dirty = false;
        inner.frames[frame].valid = false;
        inner.frames[frame].needs_fsync = false;
        inner.frames[frame].io_in_progress = true;
        inner.frames[frame].pin_count = 1;
        inner.index.enter(tag, || frame);

        drop(inner);

        if let (Some(old_tag), Some(page)) = (old_tag, old_page) {
            if let Err(e) = self.storage.write(old_tag.relation, old_tag.block, page.as_slice()) {
                let mut inner = self.inner.lock();
                inner.frames[frame].io_in_progress = false;
                if let Some(tag) = inner.frames[frame].tag.take() {
                    inner.index.remove(&tag);
                }
                inner.frames[frame].pin_count = 0;
                inner.free_list.push(frame);
                return Err(e);
            }
        }

        let mut page = Page::zeroed();
        let read_result = self.storage.read(relation, block, page.as_mut_slice());

        let mut inner = self.inner.lock();
        inner.frames[frame].io_in_progress = false;
        match read_result {
            Ok(()) => {
                inner.pages[frame] = page;
                inner.frames[frame].valid = true;
                Ok((frame + 1) as BufferId)
            }
            Err(e) => {
                if let Some(tag) = inner.frames[frame].tag.take() {
                    inner.index.remove(&tag);
                }
                inner.frames[frame].pin_count = 0;
                inner.free_list.push(frame);
                Err(e)
            }
        }
    }

    fn select_victim(&self, inner: &mut Inner) -> Result<usize> {
        if let Some(frame) = inner.free_list.pop() {
            return Ok(frame);
        }
        let n = inner.frames.len();
        for _ in 0..n {
            let candidate = inner.clock_hand;
            inner.clock_hand = (inner.clock_hand + 1) % n;
            if inner.frames[candidate].eligible_for_replacement() {
                return Ok(candidate);
            }
        }
        Err(DbError::NoReplacementVictim)
    }

    pub fn release_buffer(&self, id: BufferId) {
        let frame = Self::frame_index(id);
        let mut inner = self.inner.lock();
        if inner.frames[frame].pin_count > 0 {
            inner.frames[frame].pin_count -= 1;
        }
    }

    /// Mark the buffer dirty (this backend just wrote into its page) and
    /// release the pin. The write itself stays entirely in memory; nothing
    /// reaches disk until replacement, an explicit flush, or commit.
    pub fn write_buffer(&self, id: BufferId) {
        let frame = Self::frame_index(id);
        let mut inner = self.inner.lock();
        inner.frames[frame].dirty = true;
        self.shared_buffer_changed.store(true, Ordering::SeqCst);
        if inner.frames[frame].pin_count > 0 {
            inner.frames[frame].pin_count -= 1;
        }
    }

    /// Synchronous write-then-fsync of a buffer's current contents,
    /// independent of the replacement path.
    pub fn flush_buffer(&self, id: BufferId) -> Result<()> {
        let frame = Self::frame_index(id);
        let (tag, page) = {
            let inner = self.inner.lock();
            let tag = inner.frames[frame].tag.ok_or_else(|| {
                DbError::InvariantViolation(format!("flush requested for empty buffer {id}"))
            })?;
            (tag, inner.pages[frame].clone())
        };
        self.storage.flush(tag.relation, tag.block, page.as_slice())?;
        let mut inner = self.inner.lock();
        inner.frames[frame].dirty = false;
        inner.frames[frame].needs_fsync = false;
        Ok(())
    }

    /// Record that another backend dirtied this shared buffer (this core
    /// runs single-backend, but the bit exists so the commit-time skip
    /// logic below has something real to check).
    pub fn mark_dirtied_by_other_backend(&self, id: BufferId) {
        let frame = Self::frame_index(id);
        let mut inner = self.inner.lock();
        inner.frames[frame].needs_fsync = true;
    }

    pub fn lock_buffer(&self, id: BufferId, mode: BufferLockMode) {
        let frame = Self::frame_index(id);
        self.lock_bitmap.lock()[frame] = Some(mode);
    }

    pub fn unlock_buffer(&self, id: BufferId) {
        let frame = Self::frame_index(id);
        self.lock_bitmap.lock()[frame] = None;
    }

    pub fn with_page<R>(&self, id: BufferId, f: impl FnOnce(&Page) -> R) -> R {
        let frame = Self::frame_index(id);
        let inner = self.inner.lock();
        f(&inner.pages[frame])
    }

    pub fn with_page_mut<R>(&self, id: BufferId, f: impl FnOnce(&mut Page) -> R) -> R {
        let frame = Self::frame_index(id);
        let mut inner = self.inner.lock();
        f(&mut inner.pages[frame])
    }

    pub fn pin_count(&self, id: BufferId) -> u32 {
        let frame = Self::frame_index(id);
        self.inner.lock().frames[frame].pin_count
    }

    pub fn is_dirty(&self, id: BufferId) -> bool {
        let frame = Self::frame_index(id);
        self.inner.lock().frames[frame].dirty
    }

    /// Whether any shared buffer has been written since the flag was last
    /// cleared; a read-only transaction that never set it can skip its
    /// commit-time write pass entirely.
    pub fn shared_buffer_changed(&self) -> bool {
        self.shared_buffer_changed.load(Ordering::SeqCst)
    }

    pub fn clear_shared_buffer_changed(&self) {
        self.shared_buffer_changed.store(false, Ordering::SeqCst);
    }

    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    /// Fraction of frames currently pinned, for the health check below and
    /// for any future admin/diagnostic reporting.
    pub fn pinned_fraction(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.frames.is_empty() {
            return 0.0;
        }
        let pinned = inner.frames.iter().filter(|f| f.pin_count > 0).count();
        pinned as f64 / inner.frames.len() as f64
    }
}

impl Component for BufferPool {
    /// `Degraded` once pins cover most of the pool — a burst of concurrent
    /// readers away from `select_victim` finding nothing eligible and
    /// returning [`crate::error::DbError::NoReplacementVictim`]. `Unhealthy`
    /// once every frame is pinned, since the next miss has nowhere to go.
    fn health_check(&self) -> HealthStatus {
        let fraction = self.pinned_fraction();
        if fraction >= 1.0 {
            HealthStatus::Unhealthy
        } else if fraction >= 0.9 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Local (single-backend) buffer pool: ordinary process memory, linear scan
/// for a tag match, round-robin replacement when nothing matches. No locks
/// anywhere in here — nothing outside this backend can ever observe these
/// frames, so there is no concurrency to protect against.
pub struct LocalBufferPool {
    frames: std::cell::RefCell<Vec<Frame>>,
    pages: std::cell::RefCell<Vec<Page>>,
    next_victim: std::cell::Cell<usize>,
    storage: Arc<MdManager>,
}

// SAFETY: this core is single-threaded per backend by construction (the
// spec's concurrency model is "one OS process per backend, strictly
// sequential within a backend"); `Sync` only needs to hold because
// `ServerContext` is shared behind an `Arc`, not because these frames are
// ever touched from two threads at once.
unsafe impl Sync for LocalBufferPool {}

impl LocalBufferPool {
    pub fn new(num_buffers: usize, storage: Arc<MdManager>) -> Self {
        let frames = (0..num_buffers).map(|_| Frame::empty()).collect();
        let pages = (0..num_buffers).map(|_| Page::zeroed()).collect();
        Self {
            frames: std::cell::RefCell::new(frames),
            pages: std::cell::RefCell::new(pages),
            next_victim: std::cell::Cell::new(0),
            storage,
        }
    }

    fn local_id(frame: usize) -> BufferId {
        -((frame + 1) as BufferId)
    }

    fn frame_index(id: BufferId) -> usize {
        debug_assert!(id < 0);
        (-id - 1) as usize
    }

    pub fn read_buffer(&self, relation: RelationId, block: BlockNumber) -> Result<BufferId> {
        let block = if block.is_new() {
            self.storage.extend(relation, Page::zeroed().as_slice())?
        } else {
            block
        };
        let tag = BufferTag::new(relation, block);
        {
            let mut frames = self.frames.borrow_mut();
            if let Some(frame) = frames.iter().position(|f| f.tag == Some(tag)) {
                frames[frame].pin_count += 1;
                return Ok(Self::local_id(frame));
            }
        }

        let frame = {
            let frames = self.frames.borrow();
            let n = frames.len();
            let mut idx = self.next_victim.get();
            let mut chosen = None;
            for _ in 0..n {
                if frames[idx].pin_count == 0 {
                    chosen = Some(idx);
                    idx = (idx + 1) % n;
                    break;
                }
                idx = (idx + 1) % n;
            }
            self.next_victim.set(idx);
            chosen.ok_or(DbError::NoReplacementVictim)?
        };

        if let Some(old_tag) = self.frames.borrow()[frame].tag {
            if self.frames.borrow()[frame].dirty {
                let page = self.pages.borrow()[frame].clone();
                self.storage.write(old_tag.relation, old_tag.block, page.as_slice())?;
            }
        }

        let mut page = Page::zeroed();
        self.storage.read(relation, block, page.as_mut_slice())?;
        self.pages.borrow_mut()[frame] = page;

        let mut frames = self.frames.borrow_mut();
        frames[frame] = Frame {
            tag: Some(tag),
            dirty: false,
            valid: true,
            io_in_progress: false,
            pin_count: 1,
            needs_fsync: false,
        };
        Ok(Self::local_id(frame))
    }

    pub fn release_buffer(&self, id: BufferId) {
        let frame = Self::frame_index(id);
        let mut frames = self.frames.borrow_mut();
        if frames[frame].pin_count > 0 {
            frames[frame].pin_count -= 1;
        }
    }

    /// Mark dirty and release the pin. Writing an unpinned dirty local
    /// buffer back out is left unimplemented: the original leaves this path
    /// as a stub and this core does not guess at what it should do.
    pub fn write_buffer(&self, id: BufferId) {
        let frame = Self::frame_index(id);
        let mut frames = self.frames.borrow_mut();
        frames[frame].dirty = true;
        if frames[frame].pin_count > 0 {
            frames[frame].pin_count -= 1;
        }
    }

    pub fn with_page<R>(&self, id: BufferId, f: impl FnOnce(&Page) -> R) -> R {
        let frame = Self::frame_index(id);
        f(&self.pages.borrow()[frame])
    }

    pub fn with_page_mut<R>(&self, id: BufferId, f: impl FnOnce(&mut Page) -> R) -> R {
        let frame = Self::frame_index(id);
        f(&mut self.pages.borrow_mut()[frame])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::vfd::VfdCache;
    use crate::memory::shmem::ShmemAllocator;
    use tempfile::tempdir;

    fn pool(dir: &std::path::Path, num_buffers: usize) -> BufferPool {
        let vfd_cache = Arc::new(VfdCache::new(64));
        let storage = Arc::new(MdManager::new(dir.to_path_buf(), vfd_cache, true));
        let shmem = Arc::new(ShmemAllocator::new(1024 * 1024));
        BufferPool::new(num_buffers, shmem, storage)
    }

    fn rel(oid: u32) -> RelationId {
        RelationId::new(0, oid)
    }

    #[test]
    fn write_then_evict_then_read_roundtrips_through_disk() {
        let dir = tempdir().unwrap();
        let bp = pool(dir.path(), 2);
        bp.storage.create(rel(1)).unwrap();
        bp.storage.extend(rel(1), &[0u8; BLOCK_SIZE]).unwrap();

        let id = bp.read_buffer(rel(1), BlockNumber::new(0)).unwrap();
        bp.with_page_mut(id, |p| p.fill(0x41));
        bp.write_buffer(id);

        // Evict by filling the other frame and forcing replacement past pool size.
        bp.storage.create(rel(2)).unwrap();
        bp.storage.extend(rel(2), &[0u8; BLOCK_SIZE]).unwrap();
        let id2 = bp.read_buffer(rel(2), BlockNumber::new(0)).unwrap();
        bp.release_buffer(id2);

        bp.storage.create(rel(3)).unwrap();
        bp.storage.extend(rel(3), &[0u8; BLOCK_SIZE]).unwrap();
        let _id3 = bp.read_buffer(rel(3), BlockNumber::new(0)).unwrap();

        let mut buf = vec![0u8; BLOCK_SIZE];
        bp.storage.read(rel(1), BlockNumber::new(0), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x41));
    }

    #[test]
    fn read_only_path_never_sets_shared_buffer_changed() {
        let dir = tempdir().unwrap();
        let bp = pool(dir.path(), 4);
        bp.storage.create(rel(1)).unwrap();
        bp.storage.extend(rel(1), &[0u8; BLOCK_SIZE]).unwrap();
        let id = bp.read_buffer(rel(1), BlockNumber::new(0)).unwrap();
        bp.release_buffer(id);
        assert!(!bp.shared_buffer_changed());
    }

    #[test]
    fn pinned_buffer_is_never_chosen_as_victim() {
        let dir = tempdir().unwrap();
        let bp = pool(dir.path(), 1);
        bp.storage.create(rel(1)).unwrap();
        bp.storage.extend(rel(1), &[0u8; BLOCK_SIZE]).unwrap();
        let id = bp.read_buffer(rel(1), BlockNumber::new(0)).unwrap();
        assert_eq!(bp.pin_count(id), 1);

        bp.storage.create(rel(2)).unwrap();
        bp.storage.extend(rel(2), &[0u8; BLOCK_SIZE]).unwrap();
        let err = bp.read_buffer(rel(2), BlockNumber::new(0));
        assert!(err.is_err());
    }

    #[test]
    fn health_degrades_once_every_frame_is_pinned() {
        let dir = tempdir().unwrap();
        let bp = pool(dir.path(), 1);
        assert_eq!(bp.health_check(), HealthStatus::Healthy);
        bp.storage.create(rel(1)).unwrap();
        bp.storage.extend(rel(1), &[0u8; BLOCK_SIZE]).unwrap();
        let _id = bp.read_buffer(rel(1), BlockNumber::new(0)).unwrap();
        assert_eq!(bp.health_check(), HealthStatus::Unhealthy);
    }

    #[test]
    fn new_block_request_extends_relation_and_reads_the_block_just_written() {
        let dir = tempdir().unwrap();
        let bp = pool(dir.path(), 2);
        bp.storage.create(rel(1)).unwrap();

        let id = bp.read_buffer(rel(1), crate::common::INVALID_BLOCK_NUMBER).unwrap();
        bp.with_page(id, |p| assert!(p.as_slice().iter().all(|&b| b == 0)));
        bp.release_buffer(id);

        assert_eq!(bp.storage.count_blocks(rel(1)).unwrap(), 1);
    }

    #[test]
    fn local_buffer_pool_roundtrips_without_locking() {
        let dir = tempdir().unwrap();
        let vfd_cache = Arc::new(VfdCache::new(64));
        let storage = Arc::new(MdManager::new(dir.path().to_path_buf(), vfd_cache, true));
        storage.create(rel(5)).unwrap();
        storage.extend(rel(5), &[0u8; BLOCK_SIZE]).unwrap();

        let local = LocalBufferPool::new(4, storage);
        let id = local.read_buffer(rel(5), BlockNumber::new(0)).unwrap();
        assert!(id < 0);
        local.with_page_mut(id, |p| p.fill(0x99));
        local.write_buffer(id);
        local.release_buffer(id);
    }
}
