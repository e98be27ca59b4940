//! Two-bucket priority queue shared by the job manager (producer) and the
//! worker pool (consumers).
//!
//! Higher priority dequeues first within a bucket; ties break FIFO via a
//! monotonic sequence number. Imports drain before exports when both hold
//! work. `pop` parks on a `Notify` rather than spinning.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::ids::JobId;

use super::types::QueueBucket;

#[derive(Debug, Eq, PartialEq)]
struct Entry {
    priority: u8,
    seq: u64,
    job_id: JobId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: highest priority wins; older sequence wins ties.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct State {
    imports: BinaryHeap<Entry>,
    exports: BinaryHeap<Entry>,
    seq: u64,
}

#[derive(Default)]
pub struct PriorityQueue {
    state: Mutex<State>,
    notify: Notify,
    closed: AtomicBool,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, bucket: QueueBucket, job_id: JobId, priority: u8) {
        {
            let mut state = self.state.lock();
            let seq = state.seq;
            state.seq += 1;
            let entry = Entry {
                priority,
                seq,
                job_id,
            };
            match bucket {
                QueueBucket::Imports => state.imports.push(entry),
                QueueBucket::Exports => state.exports.push(entry),
            }
        }
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<JobId> {
        let mut state = self.state.lock();
        if let Some(entry) = state.imports.pop() {
            return Some(entry.job_id);
        }
        state.exports.pop().map(|e| e.job_id)
    }

    /// Blocks until an entry is available or the queue is closed and empty.
    pub async fn pop(&self) -> Option<JobId> {
        loop {
            let notified = self.notify.notified();
            if let Some(job_id) = self.try_pop() {
                return Some(job_id);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Wake all waiting workers so they can observe shutdown.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.imports.len() + state.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
