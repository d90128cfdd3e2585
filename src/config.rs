//! Ambient configuration surface.
//!
//! These are the knobs the spec calls out as relevant to the storage core.
//! Everything else (SQL-layer settings, network listeners) belongs to a
//! higher layer and has no business here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Root directory containing per-database subdirectories.
    pub data_dir: String,
    /// Size of the shared buffer pool, in frames.
    pub shared_buffers: usize,
    /// Size of the local (unshared) buffer pool, in frames.
    pub local_buffers: usize,
    /// Maximum concurrent backends; bounds semaphore and lock table sizing.
    pub max_backends: usize,
    /// If false, fsync is a no-op. Unsafe; for testing only.
    pub enable_fsync: bool,
    /// Milliseconds a waiter sleeps before deadlock checking kicks in.
    pub deadlock_timeout: Duration,
    /// Total size of the shared memory region the arena/allocator carve from.
    pub shmem_region_bytes: usize,
    /// Ceiling on simultaneously-open OS file descriptors the VFD cache may
    /// hold, minus a small reservation for the rest of the process.
    pub max_open_files: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            shared_buffers: 4096,
            local_buffers: 64,
            max_backends: 100,
            enable_fsync: true,
            deadlock_timeout: Duration::from_secs(1),
            shmem_region_bytes: 256 * 1024 * 1024,
            max_open_files: 1000,
        }
    }
}

impl DatabaseConfig {
    /// Reservation the VFD cache keeps below `max_open_files` for descriptors
    /// the rest of the process needs (sockets, log files, ...).
    pub fn vfd_reserve(&self) -> usize {
        (self.max_open_files / 10).max(10)
    }

    pub fn vfd_budget(&self) -> usize {
        self.max_open_files.saturating_sub(self.vfd_reserve())
    }
}
