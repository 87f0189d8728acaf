//! Per-node work queues.
//!
//! Queues are unbounded at insertion time; the bandwidth cap is applied when
//! the dispatcher pulls ([`WorkQueue::pop_capped`]). The owning node guards
//! all of its queues with its single node mutex, so the queues themselves
//! carry no locking.

use std::collections::VecDeque;

use conclave_types::{NodeError, TestCase, Trace};

/// Wire-size estimate used for the bandwidth cap.
pub trait Payload {
    fn payload_size(&self) -> usize;
}

impl Payload for Trace {
    fn payload_size(&self) -> usize {
        self.size()
    }
}

impl Payload for TestCase {
    fn payload_size(&self) -> usize {
        self.size()
    }
}

impl Payload for NodeError {
    fn payload_size(&self) -> usize {
        self.log.len()
    }
}

/// FIFO queue of one item kind.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: VecDeque<T>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self { items: VecDeque::new() }
    }
}

impl<T> WorkQueue<T> {
    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    /// Jump the queue. Used for the initial seed test case.
    pub fn push_front(&mut self, item: T) {
        self.items.push_front(item);
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        self.items.extend(items);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn drain_all(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }
}

impl<T: Payload> WorkQueue<T> {
    /// Pop items in order while their total size stays within `max_bytes`.
    /// Always yields at least one item if the queue is non-empty, so an
    /// oversized item cannot wedge the queue.
    pub fn pop_capped(&mut self, max_bytes: u64) -> Vec<T> {
        let mut out = Vec::new();
        let mut total = 0u64;
        while let Some(next) = self.items.front() {
            let size = next.payload_size() as u64;
            if !out.is_empty() && total + size > max_bytes {
                break;
            }
            total += size;
            if let Some(item) = self.items.pop_front() {
                out.push(item);
            }
        }
        out
    }
}

/// The three queues every node owns.
#[derive(Debug, Default)]
pub struct Queues {
    pub traces: WorkQueue<Trace>,
    pub tests: WorkQueue<TestCase>,
    pub errors: WorkQueue<NodeError>,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
