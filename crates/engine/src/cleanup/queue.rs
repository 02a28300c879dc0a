//! Queue of attempts awaiting cleanup.
//!
//! Entries become eligible at `min_start_time`; the queue is a min-heap
//! on that instant with `(atr_id, attempt_id)` deduplication, shared
//! between the attempt paths that enqueue their own failures, the
//! lost-attempt scanner, and the dispatcher that drains it.

use keystone_kv::KeyspaceRef;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Instant;

/// One attempt awaiting cleanup.
#[derive(Debug, Clone)]
pub struct CleanupEntry {
    /// ATR document holding the attempt entry
    pub atr_id: String,
    /// Attempt to clean
    pub attempt_id: String,
    /// Collection holding the ATR
    pub atr_keyspace: KeyspaceRef,
    /// Earliest instant the entry may be processed
    pub min_start_time: Instant,
    /// Re-verify server-side expiry before acting (set for entries
    /// discovered on foreign ATRs)
    pub check_if_expired: bool,
}

impl CleanupEntry {
    /// Entry eligible at `min_start_time`.
    pub fn new(
        atr_keyspace: KeyspaceRef,
        atr_id: impl Into<String>,
        attempt_id: impl Into<String>,
        min_start_time: Instant,
        check_if_expired: bool,
    ) -> Self {
        Self {
            atr_id: atr_id.into(),
            attempt_id: attempt_id.into(),
            atr_keyspace,
            min_start_time,
            check_if_expired,
        }
    }

    fn dedup_key(&self) -> (String, String) {
        (self.atr_id.clone(), self.attempt_id.clone())
    }
}

// Min-heap on min_start_time: the earliest-eligible entry surfaces
// first.
struct HeapItem(CleanupEntry);

impl Eq for HeapItem {}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.0.min_start_time == other.0.min_start_time
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.min_start_time.cmp(&self.0.min_start_time)
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<HeapItem>,
    queued: HashSet<(String, String)>,
}

/// Deduplicated time-ordered cleanup queue.
#[derive(Default)]
pub struct CleanupQueue {
    inner: Mutex<QueueInner>,
}

impl CleanupQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue unless the same `(atr_id, attempt_id)` is already
    /// queued. Returns whether the entry was added.
    pub fn push(&self, entry: CleanupEntry) -> bool {
        let mut inner = self.inner.lock();
        if !inner.queued.insert(entry.dedup_key()) {
            return false;
        }
        inner.heap.push(HeapItem(entry));
        true
    }

    /// Dequeue the head. With `check_time`, only an entry whose
    /// `min_start_time` has passed is returned.
    pub fn pop(&self, check_time: bool) -> Option<CleanupEntry> {
        let mut inner = self.inner.lock();
        let ready = match inner.heap.peek() {
            Some(item) => !check_time || item.0.min_start_time <= Instant::now(),
            None => return None,
        };
        if !ready {
            return None;
        }
        let entry = inner.heap.pop().unwrap().0;
        inner.queued.remove(&entry.dedup_key());
        Some(entry)
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(atr: &str, attempt: &str, at: Instant) -> CleanupEntry {
        CleanupEntry::new(
            KeyspaceRef::default_collection("b"),
            atr,
            attempt,
            at,
            true,
        )
    }

    #[test]
    fn test_orders_by_min_start_time() {
        let q = CleanupQueue::new();
        let now = Instant::now();
        q.push(entry("atr-1", "a", now + Duration::from_millis(50)));
        q.push(entry("atr-2", "b", now));
        q.push(entry("atr-3", "c", now + Duration::from_millis(10)));

        assert_eq!(q.pop(false).unwrap().attempt_id, "b");
        assert_eq!(q.pop(false).unwrap().attempt_id, "c");
        assert_eq!(q.pop(false).unwrap().attempt_id, "a");
        assert!(q.pop(false).is_none());
    }

    #[test]
    fn test_pop_respects_eligibility() {
        let q = CleanupQueue::new();
        q.push(entry("atr-1", "a", Instant::now() + Duration::from_secs(60)));
        assert!(q.pop(true).is_none());
        assert_eq!(q.len(), 1);
        assert!(q.pop(false).is_some());
    }

    #[test]
    fn test_dedup_by_atr_and_attempt() {
        let q = CleanupQueue::new();
        let now = Instant::now();
        assert!(q.push(entry("atr-1", "a", now)));
        assert!(!q.push(entry("atr-1", "a", now + Duration::from_secs(1))));
        // Different attempt on the same ATR is distinct
        assert!(q.push(entry("atr-1", "b", now)));
        assert_eq!(q.len(), 2);

        // Popping releases the dedup slot
        q.pop(false).unwrap();
        q.pop(false).unwrap();
        assert!(q.push(entry("atr-1", "a", now)));
    }
}
