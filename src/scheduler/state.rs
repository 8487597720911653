//! Dispatcher lifecycle state, tick results, and running counters

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Lifecycle of a dispatcher: `Stopped -> Running <-> Paused -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchState {
    Stopped,
    Running,
    Paused,
}

impl DispatchState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Running => 1,
            Self::Paused => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }

    /// Whether the dispatcher accepts new work in this state.
    pub fn accepts_work(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Atomic holder for `DispatchState`. Every transition is a compare-and-set
/// so concurrent callers agree on exactly one winner.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(DispatchState::Stopped.as_u8()))
    }

    pub(crate) fn get(&self) -> DispatchState {
        DispatchState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move `from -> to`. Returns false if the state was not `from`.
    pub(crate) fn transition(&self, from: DispatchState, to: DispatchState) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Move any non-stopped state to `Stopped`. Returns the state it left,
    /// or `None` if it was already stopped.
    pub(crate) fn stop(&self) -> Option<DispatchState> {
        let stopped = DispatchState::Stopped.as_u8();
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != stopped).then_some(stopped)
            })
            .ok()
            .map(DispatchState::from_u8)
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReport {
    /// The dispatcher was stopped or paused; nothing happened.
    Skipped(DispatchState),
    /// The limiter refused admission. `wait` is how long the dispatcher
    /// paused itself for (zero means it did not pause).
    Deferred { wait: Duration },
    /// A batch was processed (possibly empty).
    Dispatched { attempted: usize, sent: usize, failed: usize },
}

impl TickReport {
    pub fn attempted(&self) -> usize {
        match self {
            Self::Dispatched { attempted, .. } => *attempted,
            _ => 0,
        }
    }
}

/// Running counters for one dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Messages accepted by `enqueue`.
    pub enqueued: u64,
    /// Messages refused at `enqueue` (stopped or full).
    pub rejected: u64,
    /// Messages delivered.
    pub sent: u64,
    /// Messages dropped after exhausting retries, or failed on stop.
    pub failed: u64,
    /// Retry re-queues scheduled.
    pub retried: u64,
    /// Rate-limit signals received from the transport.
    pub rate_limited: u64,
    /// Transient errors received from the transport (panics included).
    pub transient_errors: u64,
    /// Transport futures that panicked.
    pub transport_panics: u64,
    /// Completion callbacks that panicked.
    pub callback_panics: u64,
    /// Ticks that got past the state gate.
    pub ticks: u64,
    /// Ticks refused by the limiter.
    pub deferred_ticks: u64,
    /// Largest queue depth observed at enqueue.
    pub peak_queue_depth: usize,
}

impl DispatchStats {
    /// Messages that reached a final outcome.
    pub fn completed(&self) -> u64 {
        self.sent + self.failed
    }
}
