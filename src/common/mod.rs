//! Shared identifiers and small value types used across the storage core.
//!
//! Nothing in this module owns a resource; everything here is `Copy` or
//! trivially `Clone` so it can be passed by value the way the spec's data
//! model treats relation identifiers and block numbers.

use serde::{Deserialize, Serialize};

/// Database object identifier, reused for both tablespace and relation oids.
pub type Oid = u32;

/// Identifies a transaction for lock-holder bookkeeping and deadlock
/// detection. Not related to MVCC snapshot ids; this core does not implement
/// MVCC.
pub type TransactionId = u64;

/// Identifies a backend process for per-process wait-queue bookkeeping.
pub type ProcessId = u64;

/// Fixed page size for every relation. A compile-time constant in the
/// original system; kept as one here since segment/block arithmetic depends
/// on reader and writer agreeing on it.
pub const BLOCK_SIZE: usize = 8192;

/// Maximum blocks per segment file before a relation spills into
/// `<relfilenode>.1`, `.2`, etc. 131072 blocks * 8 KiB = 1 GiB per segment.
pub const SEGMENT_SIZE_BLOCKS: u32 = 131072;

/// Sentinel block number meaning "allocate a new block at the end of the
/// relation" rather than addressing an existing one.
pub const INVALID_BLOCK_NUMBER: BlockNumber = BlockNumber(u32::MAX);

/// Unsigned 32-bit index of a fixed-size page inside a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

impl BlockNumber {
    pub const fn new(n: u32) -> Self {
        BlockNumber(n)
    }

    pub fn is_new(self) -> bool {
        self == INVALID_BLOCK_NUMBER
    }

    /// Which segment (0-based) this block lives in.
    pub fn segment(self) -> u32 {
        self.0 / SEGMENT_SIZE_BLOCKS
    }

    /// Byte offset of this block within its segment file.
    pub fn offset_in_segment(self) -> u64 {
        (self.0 % SEGMENT_SIZE_BLOCKS) as u64 * BLOCK_SIZE as u64
    }
}

impl std::fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique relation identity: `(tablespace_oid, relation_oid)`.
/// Value-typed, never mutated, and used both as the file-naming key and as
/// part of every buffer tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationId {
    pub tablespace_oid: Oid,
    pub relation_oid: Oid,
}

impl RelationId {
    pub const fn new(tablespace_oid: Oid, relation_oid: Oid) -> Self {
        Self {
            tablespace_oid,
            relation_oid,
        }
    }

    /// Base filename for segment 0 (segments 1.. append `.N`).
    pub fn base_filename(&self) -> String {
        self.relation_oid.to_string()
    }
}

/// `(relation, block)` key identifying what a buffer frame currently caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferTag {
    pub relation: RelationId,
    pub block: BlockNumber,
}

impl BufferTag {
    pub fn new(relation: RelationId, block: BlockNumber) -> Self {
        Self { relation, block }
    }
}

/// Lifecycle trait implemented by the long-lived subsystems wired into
/// [`crate::core::ServerContext`]. Mirrors the teacher stack's `Component`
/// convention so every subsystem reports health the same way.
pub trait Component: Send + Sync {
    fn health_check(&self) -> HealthStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_number_segment_math() {
        let b = BlockNumber::new(131072);
        assert_eq!(b.segment(), 1);
        assert_eq!(b.offset_in_segment(), 0);

        let b = BlockNumber::new(131071);
        assert_eq!(b.segment(), 0);
        assert_eq!(b.offset_in_segment(), 131071 * BLOCK_SIZE as u64);
    }

    #[test]
    fn invalid_block_is_new() {
        assert!(INVALID_BLOCK_NUMBER.is_new());
        assert!(!BlockNumber::new(0).is_new());
    }
}
