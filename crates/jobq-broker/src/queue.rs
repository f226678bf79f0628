use chrono::{DateTime, Utc};
use jobq_core::{JobId, Priority};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Heap entry for a waiting job. `seq` is the put sequence number, which
/// orders equal priorities and lets the store detect stale entries.
#[derive(Clone, PartialEq, Eq)]
struct Entry {
    priority: Priority,
    seq: u64,
    jid: JobId,
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first
        match self.priority.cmp(&other.priority) {
            // Within same priority, earlier put first (FIFO)
            Ordering::Equal => other.seq.cmp(&self.seq),
            ordering => ordering,
        }
    }
}

#[derive(Clone)]
struct Delayed {
    ready_at: DateTime<Utc>,
    entry: Entry,
}

/// Pending jobs of one named queue.
///
/// Entries are never removed eagerly when a job is canceled or moved; the
/// owner checks each popped `(jid, seq)` against its records and skips the
/// ones that no longer match.
#[derive(Default)]
pub struct PendingQueue {
    heap: BinaryHeap<Entry>,
    delayed: Vec<Delayed>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a job that is poppable right away
    pub fn push(&mut self, jid: JobId, priority: Priority, seq: u64) {
        self.heap.push(Entry { priority, seq, jid });
    }

    /// Push a job that becomes poppable at `ready_at`
    pub fn schedule(&mut self, jid: JobId, priority: Priority, seq: u64, ready_at: DateTime<Utc>) {
        self.delayed.push(Delayed {
            ready_at,
            entry: Entry { priority, seq, jid },
        });
    }

    /// Move every delayed job whose time has come into the heap, returning
    /// the promoted `(jid, seq)` pairs
    pub fn promote(&mut self, now: DateTime<Utc>) -> Vec<(JobId, u64)> {
        let (ready, pending): (Vec<_>, Vec<_>) = self
            .delayed
            .drain(..)
            .partition(|delayed| delayed.ready_at <= now);
        self.delayed = pending;

        ready
            .into_iter()
            .map(|delayed| {
                let promoted = (delayed.entry.jid.clone(), delayed.entry.seq);
                self.heap.push(delayed.entry);
                promoted
            })
            .collect()
    }

    /// Pop the highest priority entry
    pub fn pop(&mut self) -> Option<(JobId, u64)> {
        self.heap.pop().map(|entry| (entry.jid, entry.seq))
    }

    /// Entries held, stale ones included
    pub fn len(&self) -> usize {
        self.heap.len() + self.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
