//! Intrusive doubly-linked queue over arena indices.
//!
//! The source links queue elements via offsets embedded inside the
//! surrounding struct (`SHM_QUEUE`), so any struct that wants to live on a
//! shared-memory list embeds one and walks it by subtracting the link's own
//! offset back to the struct's base address. The typed-arena model makes
//! that subtraction unnecessary: a [`Link`] just names another arena slot
//! directly, so [`ShmQueue`] stores indices into whatever arena the caller
//! is already using for its elements, rather than owning element storage
//! itself.
//!
//! An empty queue is self-linked (`next == prev == self`), exactly as in the
//! source: there's no dedicated "end of list" sentinel value, so the only
//! way to test emptiness is to compare a node's `next` against its own
//! index.

use crate::memory::arena::Idx;

/// Embed one of these in any element type that needs to live on a
/// [`ShmQueue`]. Mirrors `SHM_QUEUE`'s `prev`/`next` pair.
#[derive(Debug, Clone, Copy)]
pub struct Link<T> {
    prev: Option<Idx<T>>,
    next: Option<Idx<T>>,
}

impl<T> Default for Link<T> {
    fn default() -> Self {
        Self { prev: None, next: None }
    }
}

impl<T> Link<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Trait elements must implement so the queue can reach into their embedded
/// [`Link`] without owning the element storage.
pub trait Linked: Sized {
    fn link(&self) -> &Link<Self>;
    fn link_mut(&mut self) -> &mut Link<Self>;
}

/// A doubly-linked, self-linked-when-empty queue over arena-backed elements
/// of type `T`. The queue itself holds only a head index; callers provide
/// the arena on every call, matching how the source's queue head is just
/// another `SHM_QUEUE` living in whoever owns it (often inline in a control
/// structure), not a separate allocation.
pub struct ShmQueue<T> {
    head: Option<Idx<T>>,
}

impl<T> Default for ShmQueue<T> {
    fn default() -> Self {
        Self { head: None }
    }
}

impl<T: Linked> ShmQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Insert `elem` immediately before the head (i.e. at the tail), the
    /// only insertion primitive the source exposes; every other insertion
    /// position is expressed by callers as "insert before X".
    pub fn insert_at_tail(&mut self, arena: &mut crate::memory::arena::Arena<T>, elem: Idx<T>) {
        match self.head {
            None => {
                arena.get_mut(elem).link_mut().next = Some(elem);
                arena.get_mut(elem).link_mut().prev = Some(elem);
                self.head = Some(elem);
            }
            Some(head) => self.insert_before(arena, head, elem),
        }
    }

    /// Insert `elem` immediately before `before`. If `before` is the current
    /// head, `elem` becomes the new head's predecessor (tail).
    pub fn insert_before(&mut self, arena: &mut crate::memory::arena::Arena<T>, before: Idx<T>, elem: Idx<T>) {
        let prev = arena.get(before).link().prev.unwrap_or(before);
        arena.get_mut(elem).link_mut().prev = Some(prev);
        arena.get_mut(elem).link_mut().next = Some(before);
        arena.get_mut(prev).link_mut().next = Some(elem);
        arena.get_mut(before).link_mut().prev = Some(elem);
    }

    /// Unlink `elem` from the queue. If `elem` was the head, the head
    /// advances to its successor, or becomes empty if `elem` was the sole
    /// member.
    pub fn delete(&mut self, arena: &mut crate::memory::arena::Arena<T>, elem: Idx<T>) {
        let (prev, next) = {
            let link = arena.get(elem).link();
            (link.prev.unwrap_or(elem), link.next.unwrap_or(elem))
        };
        if prev == elem {
            self.head = None;
        } else {
            arena.get_mut(prev).link_mut().next = Some(next);
            arena.get_mut(next).link_mut().prev = Some(prev);
            if self.head == Some(elem) {
                self.head = Some(next);
            }
        }
        arena.get_mut(elem).link_mut().next = None;
        arena.get_mut(elem).link_mut().prev = None;
    }

    pub fn head(&self) -> Option<Idx<T>> {
        self.head
    }

    /// The element following `elem`, or `None` if `elem` is the last before
    /// wrapping back to the head (mirrors `shm_queue_next`'s `end_ptr` check).
    pub fn next(&self, arena: &crate::memory::arena::Arena<T>, elem: Idx<T>) -> Option<Idx<T>> {
        let n = arena.get(elem).link().next?;
        if Some(n) == self.head {
            None
        } else {
            Some(n)
        }
    }

    /// Iterate from the head to the tail.
    pub fn iter<'a>(&self, arena: &'a crate::memory::arena::Arena<T>) -> ShmQueueIter<'a, T> {
        ShmQueueIter {
            arena,
            head: self.head,
            cur: self.head,
            started: false,
        }
    }
}

pub struct ShmQueueIter<'a, T> {
    arena: &'a crate::memory::arena::Arena<T>,
    head: Option<Idx<T>>,
    cur: Option<Idx<T>>,
    started: bool,
}

impl<'a, T: Linked> Iterator for ShmQueueIter<'a, T> {
    type Item = Idx<T>;

    fn next(&mut self) -> Option<Idx<T>> {
        let cur = self.cur?;
        if self.started && Some(cur) == self.head {
            return None;
        }
        self.started = true;
        self.cur = self.arena.get(cur).link().next;
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::arena::Arena;

    #[derive(Debug)]
    struct Node {
        value: u32,
        link: Link<Node>,
    }

    impl Linked for Node {
        fn link(&self) -> &Link<Self> {
            &self.link
        }
        fn link_mut(&mut self) -> &mut Link<Self> {
            &mut self.link
        }
    }

    #[test]
    fn empty_queue_has_no_head() {
        let q: ShmQueue<Node> = ShmQueue::new();
        assert!(q.is_empty());
        assert!(q.head().is_none());
    }

    #[test]
    fn insert_at_tail_preserves_order() {
        let mut arena = Arena::new();
        let mut q = ShmQueue::new();
        let ids: Vec<_> = (0..5)
            .map(|v| {
                let idx = arena.push(Node { value: v, link: Link::new() });
                q.insert_at_tail(&mut arena, idx);
                idx
            })
            .collect();
        let values: Vec<u32> = q.iter(&arena).map(|idx| arena.get(idx).value).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert_eq!(q.head(), Some(ids[0]));
    }

    #[test]
    fn delete_head_advances_to_successor() {
        let mut arena = Arena::new();
        let mut q = ShmQueue::new();
        let a = arena.push(Node { value: 1, link: Link::new() });
        let b = arena.push(Node { value: 2, link: Link::new() });
        q.insert_at_tail(&mut arena, a);
        q.insert_at_tail(&mut arena, b);
        q.delete(&mut arena, a);
        assert_eq!(q.head(), Some(b));
        let values: Vec<u32> = q.iter(&arena).map(|idx| arena.get(idx).value).collect();
        assert_eq!(values, vec![2]);
    }

    #[test]
    fn delete_last_element_empties_queue() {
        let mut arena = Arena::new();
        let mut q = ShmQueue::new();
        let a = arena.push(Node { value: 1, link: Link::new() });
        q.insert_at_tail(&mut arena, a);
        q.delete(&mut arena, a);
        assert!(q.is_empty());
    }

    #[test]
    fn insert_before_head_becomes_new_tail() {
        let mut arena = Arena::new();
        let mut q = ShmQueue::new();
        let a = arena.push(Node { value: 1, link: Link::new() });
        q.insert_at_tail(&mut arena, a);
        let b = arena.push(Node { value: 2, link: Link::new() });
        // inserting before head == inserting at tail, per shm_queue_insert_before
        q.insert_before(&mut arena, a, b);
        let values: Vec<u32> = q.iter(&arena).map(|idx| arena.get(idx).value).collect();
        assert_eq!(values, vec![1, 2]);
    }
}
