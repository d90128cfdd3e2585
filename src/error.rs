//! Crate-wide error type.
//!
//! Every fallible operation in the storage core returns [`Result<T>`], an alias
//! over [`DbError`]. Variants are grouped roughly the way the error kinds are
//! described for this subsystem: transient OS errors are retried internally and
//! never surface here; what remains are resource exhaustion, structural
//! invariant violations, lock conflicts, and ordinary user-visible failures.

use thiserror::Error;

use crate::common::{BlockNumber, RelationId, TransactionId};
use crate::transaction::lock::LockMode;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("relation {0:?} has no segment containing block {1}")]
    BlockOutOfRange(RelationId, BlockNumber),

    #[error("short read on relation {0:?} segment {1}: expected {2} bytes, got {3}")]
    ShortRead(RelationId, u32, usize, usize),

    #[error("no free vfd slots and the lru ring is empty")]
    VfdRingExhausted,

    #[error("open failed for '{path}' even after evicting every other vfd: {source}")]
    VfdOpenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("allocate-file pool exhausted ({limit} slots in use)")]
    AllocatedFilePoolExhausted { limit: usize },

    #[error("shared memory region exhausted: requested {requested} bytes, {available} available")]
    ShmemExhausted { requested: usize, available: usize },

    #[error("shmem index entry '{name}' already registered with size {existing}, requested {requested}")]
    ShmemSizeMismatch {
        name: String,
        existing: usize,
        requested: usize,
    },

    #[error("buffer pool exhausted: no unpinned frame available for replacement")]
    NoReplacementVictim,

    #[error("structural invariant violated: {0}")]
    InvariantViolation(String),

    #[error("lock timeout: process {process} waited past the deadline for {mode:?} on {tag:?}")]
    LockTimeout {
        process: TransactionId,
        tag: String,
        mode: LockMode,
    },

    #[error("deadlock detected: {victim} aborted to break a wait cycle of length {cycle_len}")]
    Deadlock { victim: TransactionId, cycle_len: usize },

    #[error("operation cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// True for errors the spec classifies as backend-wide fatal: the backend
    /// cannot make further progress and the postmaster must reinitialize
    /// shared state rather than merely abort the current transaction.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DbError::InvariantViolation(_) | DbError::ShmemExhausted { .. } | DbError::VfdRingExhausted
        )
    }

    /// True for errors a caller may reasonably retry the transaction after.
    pub fn is_retriable(&self) -> bool {
        matches!(self, DbError::LockTimeout { .. } | DbError::Deadlock { .. })
    }
}
