//! Shared-memory emulation: a bump allocator and named-structure registry,
//! the typed arena that replaces its offset convention, an intrusive queue
//! built on that arena, an extensible hash table, and the shared/local
//! buffer pools built from all of the above.

pub mod arena;
pub mod buffer_pool;
pub mod hash_index;
pub mod queue;
pub mod shmem;

pub use arena::{Arena, Idx};
pub use shmem::ShmemAllocator;
