//! Lock modes, tags, and the granted/holder bookkeeping the lock manager
//! mutates under its table-wide lock.
//!
//! Eight modes, the lowest reserved as "no lock" so a freshly allocated
//! holder's per-mode count array starts meaningfully at index 0. The
//! conflict table is the same fixed bitmask matrix real multi-granularity
//! lock managers ship: row `m`'s bits name every mode that cannot be held
//! concurrently with `m` by two different transactions.

use crate::common::{Oid, ProcessId, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockMode {
    AccessShare = 1,
    RowShare = 2,
    RowExclusive = 3,
    Share = 4,
    ShareRowExclusive = 5,
    Exclusive = 6,
    AccessExclusive = 7,
}

pub const NUM_LOCK_MODES: usize = 8;

impl LockMode {
    pub const ALL: [LockMode; 7] = [
        LockMode::AccessShare,
        LockMode::RowShare,
        LockMode::RowExclusive,
        LockMode::Share,
        LockMode::ShareRowExclusive,
        LockMode::Exclusive,
        LockMode::AccessExclusive,
    ];

    pub fn as_index(self) -> usize {
        self as u8 as usize
    }

    /// Bitmask of modes that conflict with `self` when held by a different
    /// transaction. Bit `h` set means mode `h` conflicts.
    pub fn conflict_mask(self) -> u16 {
        conflict_table()[self.as_index()]
    }

    pub fn conflicts_with(self, other: LockMode) -> bool {
        self.conflict_mask() & (1 << other.as_index()) != 0
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LockMode::AccessShare => "AccessShare",
            LockMode::RowShare => "RowShare",
            LockMode::RowExclusive => "RowExclusive",
            LockMode::Share => "Share",
            LockMode::ShareRowExclusive => "ShareRowExclusive",
            LockMode::Exclusive => "Exclusive",
            LockMode::AccessExclusive => "AccessExclusive",
        };
        write!(f, "{name}")
    }
}

const AS: usize = LockMode::AccessShare as usize;
const RS: usize = LockMode::RowShare as usize;
const RE: usize = LockMode::RowExclusive as usize;
const SH: usize = LockMode::Share as usize;
const SRE: usize = LockMode::ShareRowExclusive as usize;
const EX: usize = LockMode::Exclusive as usize;
const AE: usize = LockMode::AccessExclusive as usize;

fn bits(modes: &[usize]) -> u16 {
    modes.iter().fold(0u16, |acc, &m| acc | (1 << m))
}

/// Index 0 (the reserved zero mode) conflicts with nothing and is never
/// requested; it exists purely so `LockMode::as_index()` lines up with
/// array position. Built once behind a `OnceLock` since `bits()` isn't a
/// `const fn`.
fn conflict_table() -> &'static [u16; NUM_LOCK_MODES] {
    static TABLE: std::sync::OnceLock<[u16; NUM_LOCK_MODES]> = std::sync::OnceLock::new();
    TABLE.get_or_init(|| {
        let mut t = [0u16; NUM_LOCK_MODES];
        t[AS] = bits(&[AE]);
        t[RS] = bits(&[EX, AE]);
        t[RE] = bits(&[SH, SRE, EX, AE]);
        t[SH] = bits(&[RE, SRE, EX, AE]);
        t[SRE] = bits(&[RE, SH, SRE, EX, AE]);
        t[EX] = bits(&[RS, RE, SH, SRE, EX, AE]);
        t[AE] = bits(&[AS, RS, RE, SH, SRE, EX, AE]);
        t
    })
}

/// Which of the (at most three) independent lock method tables a tag
/// belongs to. The default table is where ordinary relation/page locking
/// happens; user locks and the spare table exist for callers that want
/// isolated namespaces sharing the same acquire/release machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMethod {
    Default,
    User,
    Spare,
}

/// Identifies a lockable object: a relation, optionally narrowed to a page
/// and tuple offset for finer granularity, scoped to a database and a
/// method table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockTag {
    pub relation: Oid,
    pub database: Oid,
    pub object: Oid,
    pub offset: u16,
    pub method: LockMethod,
}

impl LockTag {
    pub fn relation(database: Oid, relation: Oid) -> Self {
        Self {
            relation,
            database,
            object: 0,
            offset: 0,
            method: LockMethod::Default,
        }
    }
}

/// Per-mode granted counts for one lockable object, shared by every
/// transaction currently holding or waiting on it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModeCounts([u32; NUM_LOCK_MODES]);

impl ModeCounts {
    pub fn get(&self, mode: LockMode) -> u32 {
        self.0[mode.as_index()]
    }

    pub fn add(&mut self, mode: LockMode, delta: i32) {
        let slot = &mut self.0[mode.as_index()];
        *slot = (*slot as i64 + delta as i64).max(0) as u32;
    }

    /// Bitmask of modes with at least one grant.
    pub fn granted_mask(&self) -> u16 {
        let mut mask = 0u16;
        for mode in LockMode::ALL {
            if self.get(mode) > 0 {
                mask |= 1 << mode.as_index();
            }
        }
        mask
    }
}

/// One request sitting on a lock object's wait queue.
pub struct WaitEntry {
    pub process: ProcessId,
    pub transaction: TransactionId,
    pub mode: LockMode,
}

/// A lockable object: the tag, the granted-count table, the list of
/// holders, and the FIFO wait queue. Lives in the lock manager's arena;
/// referenced by tag through a hash index and by holders through their
/// `lock` field.
pub struct LockObject {
    pub tag: LockTag,
    pub granted: ModeCounts,
    pub wait_queue: std::collections::VecDeque<WaitEntry>,
}

impl LockObject {
    pub fn new(tag: LockTag) -> Self {
        Self {
            tag,
            granted: ModeCounts::default(),
            wait_queue: std::collections::VecDeque::new(),
        }
    }

    /// Counts contributed by every transaction other than `txn`, restricted
    /// to the conflict mask of `mode`. A nonempty result means `mode` can't
    /// be granted to `txn` right now.
    pub fn conflicts_for(&self, mode: LockMode, self_counts: &ModeCounts) -> bool {
        let conflict_mask = mode.conflict_mask();
        for other in LockMode::ALL {
            if conflict_mask & (1 << other.as_index()) == 0 {
                continue;
            }
            let external = self.granted.get(other).saturating_sub(self_counts.get(other));
            if external > 0 {
                return true;
            }
        }
        false
    }
}

/// Tracks one (lock, process, transaction) triple's held mode counts.
/// `conflicts_for` always excludes these counts before checking for a
/// conflict, so a transaction may freely upgrade (e.g. `RowShare` to
/// `Exclusive`) or re-acquire any mode it already holds, even one that
/// conflicts with itself in [`conflict_table`] — there is no "self-conflict"
/// state for a single transaction to be rejected for.
pub struct Holder {
    pub lock_tag: LockTag,
    pub process: ProcessId,
    pub transaction: TransactionId,
    pub counts: ModeCounts,
}

impl Holder {
    pub fn new(lock_tag: LockTag, process: ProcessId, transaction: TransactionId) -> Self {
        Self {
            lock_tag,
            process,
            transaction,
            counts: ModeCounts::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.granted_mask() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_share_only_conflicts_with_access_exclusive() {
        assert!(!LockMode::AccessShare.conflicts_with(LockMode::RowExclusive));
        assert!(LockMode::AccessShare.conflicts_with(LockMode::AccessExclusive));
    }

    #[test]
    fn access_exclusive_conflicts_with_everything() {
        for mode in LockMode::ALL {
            assert!(LockMode::AccessExclusive.conflicts_with(mode));
        }
    }

    #[test]
    fn share_and_row_exclusive_conflict_but_two_shares_do_not() {
        assert!(LockMode::Share.conflicts_with(LockMode::RowExclusive));
        assert!(!LockMode::Share.conflicts_with(LockMode::Share));
    }

    #[test]
    fn own_transaction_counts_are_excluded_from_conflict_check() {
        let mut lock = LockObject::new(LockTag::relation(1, 100));
        let mut holder_counts = ModeCounts::default();
        holder_counts.add(LockMode::Exclusive, 1);
        lock.granted.add(LockMode::Exclusive, 1);

        // Same transaction requesting Exclusive again (it already holds it)
        // must not see itself as a conflict.
        assert!(!lock.conflicts_for(LockMode::Exclusive, &holder_counts));

        // A different transaction holding nothing sees a real conflict.
        assert!(lock.conflicts_for(LockMode::Exclusive, &ModeCounts::default()));
    }
}
