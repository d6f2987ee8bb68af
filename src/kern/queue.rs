//! Intrusive Queue - Doubly-linked list threaded through kernel records
//!
//! Based on Mach4 kern/queue.h by Avadis Tevanian Jr. (1985)
//!
//! The linkage lives inside the records being queued, so an element can be
//! removed in O(1) without knowing anything but its key, and a record can sit
//! on several queues at once through separate chain fields. Records live in
//! keyed tables (threads by [`Tid`](crate::types::Tid), tasks by
//! [`TaskId`](crate::types::TaskId)), so links are keys rather than pointers.
//! A [`Chained`] view tells the queue which chain field of which table to
//! walk.
//!
//! ## Usage Pattern
//!
//! ```ignore
//! struct Thread {
//!     run_link: QueueChain<Tid>,
//!     wait_link: QueueChain<Tid>,
//! }
//!
//! let mut ready = QueueHead::new();
//! ready.push_back(&mut RunLinks(&mut threads), tid);
//! ```

use core::fmt::Debug;

// ============================================================================
// Queue Chain
// ============================================================================

/// Linkage embedded in a queued record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueChain<K> {
    next: Option<K>,
    prev: Option<K>,
    linked: bool,
}

impl<K> QueueChain<K> {
    pub const fn new() -> Self {
        Self {
            next: None,
            prev: None,
            linked: false,
        }
    }

    /// Whether the record is currently on a queue through this chain
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

impl<K> Default for QueueChain<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// A table whose records carry a chain field for key `K`
pub trait Chained<K> {
    fn chain(&self, key: K) -> Option<&QueueChain<K>>;
    fn chain_mut(&mut self, key: K) -> Option<&mut QueueChain<K>>;
}

fn link<K: Copy + Debug, S: Chained<K> + ?Sized>(store: &mut S, key: K) -> &mut QueueChain<K> {
    match store.chain_mut(key) {
        Some(c) => c,
        None => panic!("queue: no record for {:?}", key),
    }
}

// ============================================================================
// Queue Head
// ============================================================================

/// Head of an intrusive queue
///
/// Plain data: it can be copied out of its owner, operated on together with
/// the record table, and written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueHead<K> {
    head: Option<K>,
    tail: Option<K>,
    len: usize,
}

impl<K> Default for QueueHead<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> QueueHead<K> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }
}

impl<K: Copy + Eq + Debug> QueueHead<K> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> Option<K> {
        self.head
    }

    pub fn last(&self) -> Option<K> {
        self.tail
    }

    /// Enqueue at the tail
    pub fn push_back<S: Chained<K> + ?Sized>(&mut self, store: &mut S, key: K) {
        let old_tail = self.tail;
        {
            let c = link(store, key);
            debug_assert!(!c.linked, "queue: {:?} already linked", key);
            c.next = None;
            c.prev = old_tail;
            c.linked = true;
        }
        match old_tail {
            Some(t) => link(store, t).next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        self.len += 1;
    }

    /// Enqueue at the head
    pub fn push_front<S: Chained<K> + ?Sized>(&mut self, store: &mut S, key: K) {
        let old_head = self.head;
        {
            let c = link(store, key);
            debug_assert!(!c.linked, "queue: {:?} already linked", key);
            c.next = old_head;
            c.prev = None;
            c.linked = true;
        }
        match old_head {
            Some(h) => link(store, h).prev = Some(key),
            None => self.tail = Some(key),
        }
        self.head = Some(key);
        self.len += 1;
    }

    /// Insert `key` immediately before `before`, which must be on this queue
    pub fn insert_before<S: Chained<K> + ?Sized>(&mut self, store: &mut S, key: K, before: K) {
        let prev = link(store, before).prev;
        {
            let c = link(store, key);
            debug_assert!(!c.linked, "queue: {:?} already linked", key);
            c.next = Some(before);
            c.prev = prev;
            c.linked = true;
        }
        link(store, before).prev = Some(key);
        match prev {
            Some(p) => link(store, p).next = Some(key),
            None => self.head = Some(key),
        }
        self.len += 1;
    }

    /// Unlink `key`, which the caller knows to be on this queue
    ///
    /// Returns false (and changes nothing) if the record is not linked.
    pub fn remove<S: Chained<K> + ?Sized>(&mut self, store: &mut S, key: K) -> bool {
        let (next, prev) = {
            let c = link(store, key);
            if !c.linked {
                return false;
            }
            let pair = (c.next, c.prev);
            *c = QueueChain::new();
            pair
        };
        match prev {
            Some(p) => link(store, p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => link(store, n).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        true
    }

    /// Dequeue from the head
    pub fn pop_front<S: Chained<K> + ?Sized>(&mut self, store: &mut S) -> Option<K> {
        let key = self.head?;
        self.remove(store, key);
        Some(key)
    }

    /// Successor of `key` on this queue
    pub fn next_of<S: Chained<K> + ?Sized>(&self, store: &S, key: K) -> Option<K> {
        store.chain(key).and_then(|c| c.next)
    }

    /// Walk the queue from head to tail
    pub fn iter<'a, S: Chained<K> + ?Sized>(&self, store: &'a S) -> Iter<'a, K, S> {
        Iter {
            store,
            cursor: self.head,
            remaining: self.len,
        }
    }

    /// Linear membership test
    pub fn contains<S: Chained<K> + ?Sized>(&self, store: &S, key: K) -> bool {
        self.iter(store).any(|k| k == key)
    }
}

/// Iterator over queue keys
pub struct Iter<'a, K, S: ?Sized> {
    store: &'a S,
    cursor: Option<K>,
    remaining: usize,
}

impl<K: Copy + Eq + Debug, S: Chained<K> + ?Sized> Iterator for Iter<'_, K, S> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        if self.remaining == 0 {
            return None;
        }
        let key = self.cursor?;
        self.cursor = self.store.chain(key).and_then(|c| c.next);
        self.remaining -= 1;
        Some(key)
    }
}
