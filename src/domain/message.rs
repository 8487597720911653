//! QueuedMessage - one unit of outbound work waiting for dispatch
//!
//! A message carries its payload, a shared handle to its destination, its
//! priority and enqueue time (which together define dispatch order), a
//! retry counter, and an optional single-shot completion callback.

use std::cmp::Ordering;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use super::priority::Priority;

/// Default retry ceiling for a message.
pub const MAX_RETRIES: u32 = 3;

/// Completion callback, invoked at most once with the delivery result.
pub type CompletionCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// What happened when a message was completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The message had no callback attached.
    NoCallback,
    /// The callback ran to completion.
    Invoked,
    /// The callback panicked; the panic was caught and logged.
    Panicked,
}

/// A message waiting in the dispatch queue.
pub struct QueuedMessage<P, D> {
    payload: P,
    destination: Arc<D>,
    priority: Priority,
    enqueued_at: Instant,
    sequence: u64,
    retry_count: u32,
    max_retries: u32,
    on_complete: Option<CompletionCallback>,
}

impl<P, D> QueuedMessage<P, D> {
    /// Create a message with no callback and the default retry ceiling.
    pub fn new(payload: P, destination: Arc<D>, priority: Priority) -> Self {
        Self {
            payload,
            destination,
            priority,
            enqueued_at: Instant::now(),
            sequence: 0,
            retry_count: 0,
            max_retries: MAX_RETRIES,
            on_complete: None,
        }
    }

    /// Attach a completion callback.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Attach an already boxed callback, if any.
    pub fn with_boxed_callback(mut self, callback: Option<CompletionCallback>) -> Self {
        self.on_complete = callback;
        self
    }

    /// Override the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn destination(&self) -> &Arc<D> {
        &self.destination
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Insertion sequence stamped by the queue (0 until first inserted).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn has_callback(&self) -> bool {
        self.on_complete.is_some()
    }

    /// Whether another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Count one retry. Never moves past the ceiling.
    pub fn increment_retry_count(&mut self) {
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
        }
    }

    pub(crate) fn stamp(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Give the message a fresh effective enqueue time before it re-enters
    /// the queue for a retry.
    pub(crate) fn refresh(&mut self) {
        self.enqueued_at = Instant::now();
    }

    /// Finish the message, firing its callback with `success`.
    ///
    /// A panic inside the callback is caught and logged; it never reaches
    /// the caller.
    pub fn complete(mut self, success: bool) -> CallbackOutcome {
        let Some(callback) = self.on_complete.take() else {
            return CallbackOutcome::NoCallback;
        };

        match catch_unwind(AssertUnwindSafe(move || callback(success))) {
            Ok(()) => CallbackOutcome::Invoked,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(
                    priority = %self.priority,
                    retry_count = self.retry_count,
                    success,
                    reason = %reason,
                    "Message completion callback panicked"
                );
                CallbackOutcome::Panicked
            }
        }
    }
}

impl<P, D> std::fmt::Debug for QueuedMessage<P, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedMessage")
            .field("priority", &self.priority)
            .field("sequence", &self.sequence)
            .field("retry_count", &self.retry_count)
            .field("has_callback", &self.on_complete.is_some())
            .finish()
    }
}

// Greater means dispatched sooner: higher priority first, then earlier
// enqueue time, then lower insertion sequence.
impl<P, D> Ord for QueuedMessage<P, D> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl<P, D> PartialOrd for QueuedMessage<P, D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P, D> PartialEq for QueuedMessage<P, D> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<P, D> Eq for QueuedMessage<P, D> {}
