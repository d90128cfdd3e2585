//! Multi-granularity locking: the mode lattice and tag types, the lock
//! manager that grants/blocks/wakes against them, and the deadlock detector
//! the manager consults once a wait has run past its timeout.

pub mod deadlock;
pub mod lock;
pub mod lock_manager;

pub use deadlock::DeadlockDetector;
pub use lock::{LockMode, LockTag};
pub use lock_manager::LockManager;
