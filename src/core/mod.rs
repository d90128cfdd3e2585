//! Central server context and cooperative cancellation.
//!
//! The original backend relies on a constellation of process-wide globals
//! (`MyProc`, `BufferDescriptors`, `LockMethodTbl`, `ShmemBase`, ...) that every
//! subsystem reaches into directly. That works for a single-postmaster/
//! fork-per-backend process model but makes nothing unit-testable in
//! isolation. [`ServerContext`] centralizes those globals behind one struct
//! passed by reference, so a test can spin up a buffer pool and lock manager
//! without a running postmaster.
//!
//! Signal-driven cancellation (`InterruptPending`, `InterruptHoldoffCount`,
//! `CritSectionCount`) is replaced by an explicit [`CancellationToken`] and a
//! [`NoCancelGuard`] RAII scope: code that must not be interrupted mid-mutation
//! (spinlock-equivalent critical sections) acquires the guard, and cancellation
//! delivery is deferred for as long as any guard is outstanding.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::common::{Component, HealthStatus};
use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::io::vfd::VfdCache;
use crate::memory::buffer_pool::{BufferPool, LocalBufferPool};
use crate::memory::shmem::ShmemAllocator;
use crate::storage::md::MdManager;
use crate::transaction::deadlock::DeadlockDetector;
use crate::transaction::lock_manager::LockManager;

/// Cooperative cancellation signal, replacing the source's signal-delivered
/// `InterruptPending` flag. `check()` is meant to be called at the safe
/// points the spec enumerates: command-loop boundaries and semaphore-wait
/// wakeups. It does nothing while a [`NoCancelGuard`] is outstanding.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancellationInner>,
}

#[derive(Default)]
struct CancellationInner {
    requested: AtomicBool,
    holdoff: AtomicUsize,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Delivery is deferred while holdoff is nonzero;
    /// the next `check()` after the last guard drops will observe it.
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
    }

    /// Returns `Err(DbError::Cancelled)` if cancellation was requested and no
    /// no-cancel guard is currently held.
    pub fn check(&self) -> Result<()> {
        if self.inner.holdoff.load(Ordering::SeqCst) == 0 && self.inner.requested.load(Ordering::SeqCst) {
            return Err(crate::error::DbError::Cancelled);
        }
        Ok(())
    }

    /// Acquire a scope in which `check()` is inert. Mirrors bracketing a
    /// spinlock-held region with `InterruptHoldoffCount`. Nests: the
    /// innermost guard to drop only re-enables delivery once every
    /// outstanding guard is gone.
    pub fn no_cancel_scope(&self) -> NoCancelGuard {
        self.inner.holdoff.fetch_add(1, Ordering::SeqCst);
        NoCancelGuard { token: self.clone() }
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }
}

/// RAII guard suppressing cancellation delivery for its lifetime. Dropping it
/// always decrements the holdoff counter, including on unwind, which is the
/// property the rewrite needs in place of manual `HOLD_INTERRUPTS()` /
/// `RESUME_INTERRUPTS()` pairing.
pub struct NoCancelGuard {
    token: CancellationToken,
}

impl Drop for NoCancelGuard {
    fn drop(&mut self) {
        self.token.inner.holdoff.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a backend needs to touch the storage core, wired together once
/// at startup and passed by reference from then on.
pub struct ServerContext {
    pub config: DatabaseConfig,
    pub cancel: CancellationToken,
    pub shmem: Arc<ShmemAllocator>,
    pub vfd_cache: Arc<VfdCache>,
    pub storage: Arc<MdManager>,
    pub buffer_pool: Arc<BufferPool>,
    pub local_buffer_pool: Arc<LocalBufferPool>,
    pub lock_manager: Arc<LockManager>,
    pub deadlock_detector: Arc<DeadlockDetector>,
}

impl ServerContext {
    /// Bootstrap phase: build every subsystem and wire the dependencies the
    /// spec's control-flow section describes (buffer pool depends on the
    /// shmem hash index and on the storage manager; the storage manager
    /// depends on the VFD cache).
    pub fn initialize(config: DatabaseConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let cancel = CancellationToken::new();
        let shmem = Arc::new(ShmemAllocator::new(config.shmem_region_bytes));
        let vfd_cache = Arc::new(VfdCache::new(config.vfd_budget()));
        let storage = Arc::new(MdManager::new(PathBuf::from(&config.data_dir), vfd_cache.clone(), config.enable_fsync));
        let buffer_pool = Arc::new(BufferPool::new(config.shared_buffers, shmem.clone(), storage.clone()));
        let local_buffer_pool = Arc::new(LocalBufferPool::new(config.local_buffers, storage.clone()));
        let deadlock_detector = Arc::new(DeadlockDetector::new(config.deadlock_timeout));
        let lock_manager = Arc::new(LockManager::new(config.max_backends, deadlock_detector.clone()));

        tracing::info!(
            shared_buffers = config.shared_buffers,
            max_backends = config.max_backends,
            "server context initialized"
        );

        Ok(Self {
            config,
            cancel,
            shmem,
            vfd_cache,
            storage,
            buffer_pool,
            local_buffer_pool,
            lock_manager,
            deadlock_detector,
        })
    }

    /// Per-backend wait semaphore allocation happens lazily in the lock
    /// manager; this just hands out the next process id for bookkeeping.
    pub fn new_process_id(&self) -> crate::common::ProcessId {
        self.lock_manager.allocate_process_id()
    }

    /// Poll every long-lived subsystem's [`Component::health_check`] and
    /// report the worst status alongside the per-subsystem breakdown, the
    /// way an admin endpoint or supervisor would before deciding whether to
    /// keep routing work to this backend.
    pub fn health_report(&self) -> Vec<(&'static str, HealthStatus)> {
        vec![
            ("vfd_cache", self.vfd_cache.health_check()),
            ("storage", self.storage.health_check()),
            ("buffer_pool", self.buffer_pool.health_check()),
            ("lock_manager", self.lock_manager.health_check()),
        ]
    }

    /// Worst status across [`Self::health_report`]'s components.
    pub fn overall_health(&self) -> HealthStatus {
        self.health_report()
            .into_iter()
            .map(|(_, status)| status)
            .max_by_key(|status| match status {
                HealthStatus::Healthy => 0,
                HealthStatus::Degraded => 1,
                HealthStatus::Unhealthy => 2,
            })
            .unwrap_or(HealthStatus::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_cancel_guard_defers_and_restores() {
        let token = CancellationToken::new();
        token.request();
        {
            let _guard = token.no_cancel_scope();
            assert!(token.check().is_ok());
        }
        assert!(token.check().is_err());
    }

    #[test]
    fn nested_guards_require_all_to_drop() {
        let token = CancellationToken::new();
        token.request();
        let outer = token.no_cancel_scope();
        let inner = token.no_cancel_scope();
        drop(inner);
        assert!(token.check().is_ok());
        drop(outer);
        assert!(token.check().is_err());
    }

    #[test]
    fn fresh_context_reports_healthy_across_every_subsystem() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            data_dir: dir.path().display().to_string(),
            shared_buffers: 8,
            local_buffers: 4,
            ..DatabaseConfig::default()
        };
        let ctx = ServerContext::initialize(config).unwrap();
        assert_eq!(ctx.overall_health(), HealthStatus::Healthy);
        assert_eq!(ctx.health_report().len(), 4);
    }
}
