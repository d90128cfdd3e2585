//! Shared-memory allocator and named-structure registry.
//!
//! Models one pre-sized region carved bump-fashion, exactly as the source
//! describes: an 8-byte-aligned cursor advanced under a single global lock,
//! memory never returned. On top of the raw budget sits the "shmem index": a
//! name -> size/location registry so that every module can look up its own
//! structure by a fixed string name instead of hard-wiring offsets into
//! header files.
//!
//! This process does not actually map a POSIX shared memory segment (there is
//! only one address space here), so [`ShmemAllocator`] tracks *capacity*
//! rather than raw bytes: callers reserve budget here and store their actual
//! typed data in an [`crate::memory::arena::Arena`]. The accounting mirrors
//! `shmem_alloc`/`shmem_init_struct` closely enough that the same exhaustion
//! and size-mismatch failure modes apply.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{DbError, Result};

const ALIGN: usize = 8;

fn align_up(n: usize) -> usize {
    (n + ALIGN - 1) / ALIGN * ALIGN
}

struct ShmemIndexEntry {
    size: usize,
    offset: usize,
}

/// Stands in for `ShmemLock` (protects the bump cursor) and `ShmemIndexLock`
/// (protects the name registry) combined into one allocator object; the
/// source keeps them as two separate spinlocks; here they're two fields each
/// behind their own `parking_lot::Mutex`, which plays the same short
/// critical-section role as a spinlock without busy-waiting.
pub struct ShmemAllocator {
    total_bytes: usize,
    free_offset: Mutex<usize>,
    index: Mutex<HashMap<String, ShmemIndexEntry>>,
}

impl ShmemAllocator {
    pub fn new(total_bytes: usize) -> Self {
        Self {
            total_bytes,
            free_offset: Mutex::new(0),
            index: Mutex::new(HashMap::new()),
        }
    }

    /// Bump-allocate `size` bytes of budget. Returns the offset the caller
    /// should treat as this reservation's identity (useful for logging and
    /// for the `is_valid` check); never returned once granted.
    pub fn alloc(&self, size: usize) -> Result<usize> {
        let size = align_up(size);
        let mut free = self.free_offset.lock();
        let new_free = free.checked_add(size).ok_or_else(|| DbError::ShmemExhausted {
            requested: size,
            available: self.total_bytes.saturating_sub(*free),
        })?;
        if new_free > self.total_bytes {
            return Err(DbError::ShmemExhausted {
                requested: size,
                available: self.total_bytes - *free,
            });
        }
        let offset = *free;
        *free = new_free;
        Ok(offset)
    }

    pub fn is_valid(&self, offset: usize) -> bool {
        offset < self.total_bytes
    }

    pub fn bytes_used(&self) -> usize {
        *self.free_offset.lock()
    }

    pub fn bytes_total(&self) -> usize {
        self.total_bytes
    }

    /// Look up or register a named structure. Returns `(offset, found)`,
    /// mirroring `shmem_init_struct`'s `found_ptr` out-parameter: `found ==
    /// true` means a previous caller already registered this name and the
    /// caller should attach rather than (re)initialize.
    pub fn init_struct(&self, name: &str, size: usize) -> Result<(usize, bool)> {
        let mut index = self.index.lock();
        if let Some(entry) = index.get(name) {
            if entry.size != size {
                return Err(DbError::ShmemSizeMismatch {
                    name: name.to_string(),
                    existing: entry.size,
                    requested: size,
                });
            }
            return Ok((entry.offset, true));
        }
        let offset = self.alloc(size)?;
        index.insert(name.to_string(), ShmemIndexEntry { size, offset });
        Ok((offset, false))
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.index.lock().get(name).map(|e| e.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_advances_cursor_and_never_shrinks() {
        let a = ShmemAllocator::new(4096);
        let o1 = a.alloc(100).unwrap();
        let o2 = a.alloc(100).unwrap();
        assert!(o2 > o1);
        assert_eq!(a.bytes_used(), align_up(100) * 2);
    }

    #[test]
    fn alloc_fails_when_region_exhausted() {
        let a = ShmemAllocator::new(64);
        assert!(a.alloc(128).is_err());
    }

    #[test]
    fn init_struct_attaches_on_second_call() {
        let a = ShmemAllocator::new(4096);
        let (off1, found1) = a.init_struct("BufferDescriptors", 256).unwrap();
        assert!(!found1);
        let (off2, found2) = a.init_struct("BufferDescriptors", 256).unwrap();
        assert!(found2);
        assert_eq!(off1, off2);
    }

    #[test]
    fn init_struct_rejects_size_mismatch() {
        let a = ShmemAllocator::new(4096);
        a.init_struct("LockMgrLock", 64).unwrap();
        assert!(a.init_struct("LockMgrLock", 128).is_err());
    }
}
