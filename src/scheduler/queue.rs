//! Priority-ordered queue of pending messages.
//!
//! Any number of producers insert while a single dispatcher drains. The heap
//! and the insertion counter sit behind one lock, so a message is never lost
//! or popped twice.

use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::domain::{Priority, QueuedMessage};

struct QueueInner<P, D> {
    heap: BinaryHeap<QueuedMessage<P, D>>,
    next_sequence: u64,
}

impl<P, D> QueueInner<P, D> {
    fn insert(&mut self, mut message: QueuedMessage<P, D>) {
        self.next_sequence += 1;
        message.stamp(self.next_sequence);
        self.heap.push(message);
    }
}

/// Thread-safe priority queue, optionally bounded.
pub struct DispatchQueue<P, D> {
    inner: Mutex<QueueInner<P, D>>,
    capacity: Option<usize>,
}

impl<P, D> DispatchQueue<P, D> {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Create a queue that rejects fresh work once it holds `capacity`
    /// messages. `None` means unbounded.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_sequence: 0,
            }),
            capacity,
        }
    }

    fn inner(&self) -> MutexGuard<'_, QueueInner<P, D>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Insert a fresh message. Hands the message back if the queue is full.
    pub fn push(&self, message: QueuedMessage<P, D>) -> Result<(), QueuedMessage<P, D>> {
        let mut inner = self.inner();
        if self.capacity.is_some_and(|capacity| inner.heap.len() >= capacity) {
            return Err(message);
        }
        inner.insert(message);
        Ok(())
    }

    /// Put a message back for another attempt. It keeps its priority but
    /// takes a fresh enqueue time, so it lines up behind work already
    /// waiting at the same priority. Retries ignore the capacity bound.
    pub fn requeue(&self, mut message: QueuedMessage<P, D>) {
        message.refresh();
        self.inner().insert(message);
    }

    /// Remove the message that should be dispatched next.
    pub fn pop(&self) -> Option<QueuedMessage<P, D>> {
        self.inner().heap.pop()
    }

    /// Priority of the next message, without removing it.
    pub fn peek_priority(&self) -> Option<Priority> {
        self.inner().heap.peek().map(|m| m.priority())
    }

    pub fn len(&self) -> usize {
        self.inner().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner().heap.is_empty()
    }

    /// Number of pending messages with the given priority.
    pub fn len_by_priority(&self, priority: Priority) -> usize {
        self.inner().heap.iter().filter(|m| m.priority() == priority).count()
    }

    /// Remove every pending message, in dispatch order.
    pub fn drain(&self) -> Vec<QueuedMessage<P, D>> {
        let heap = std::mem::take(&mut self.inner().heap);
        heap.into_sorted_vec().into_iter().rev().collect()
    }

    /// Drop every pending message without completing it. Returns how many
    /// were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner();
        let dropped = inner.heap.len();
        inner.heap.clear();
        dropped
    }
}

impl<P, D> Default for DispatchQueue<P, D> {
    fn default() -> Self {
        Self::new()
    }
}
