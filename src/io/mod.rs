//! Low-level OS file-descriptor management, kept separate from the
//! relation-aware storage manager that sits on top of it.

pub mod vfd;

pub use vfd::VfdCache;
