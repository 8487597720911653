//! Scripted in-process transport for tests and simulation
//!
//! Outcomes are resolved per attempt in this order: the next scripted
//! outcome if any remain, then the first matching fault rule, then the
//! fallback outcome.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{Transport, TransportError};

/// What the mock does on one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Success,
    RateLimited(Option<Duration>),
    Transient(String),
    /// Panic inside `send`, to exercise the dispatcher's isolation.
    Panic(String),
}

/// A message the mock accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: String,
    pub destination: String,
}

/// Transport double that records deliveries and replays scripted failures.
#[derive(Debug)]
pub struct MockTransport {
    script: Mutex<VecDeque<MockOutcome>>,
    faults: Vec<(usize, MockOutcome)>,
    fallback: MockOutcome,
    latency: Duration,
    attempts: AtomicUsize,
    attempts_by_payload: Mutex<HashMap<String, usize>>,
    delivered: Mutex<Vec<Delivery>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    /// A transport where every send succeeds.
    pub fn new() -> Self {
        Self::always(MockOutcome::Success)
    }

    /// A transport that answers every unscripted attempt with `outcome`.
    pub fn always(outcome: MockOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            faults: Vec::new(),
            fallback: outcome,
            latency: Duration::ZERO,
            attempts: AtomicUsize::new(0),
            attempts_by_payload: Mutex::new(HashMap::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Queue outcomes for the next attempts, in order.
    pub fn with_script(self, outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        lock(&self.script).extend(outcomes);
        self
    }

    /// Answer every `every`-th attempt (1-based) with `outcome`. Earlier
    /// rules take precedence when several match.
    pub fn with_fault_every(mut self, every: usize, outcome: MockOutcome) -> Self {
        if every > 0 {
            self.faults.push((every, outcome));
        }
        self
    }

    /// Delay each send, to model a slow remote.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Total send attempts so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Send attempts made for one payload.
    pub fn attempts_for(&self, payload: &str) -> usize {
        lock(&self.attempts_by_payload).get(payload).copied().unwrap_or(0)
    }

    /// Successful deliveries in the order they happened.
    pub fn delivered(&self) -> Vec<Delivery> {
        lock(&self.delivered).clone()
    }

    pub fn delivered_payloads(&self) -> Vec<String> {
        lock(&self.delivered).iter().map(|d| d.payload.clone()).collect()
    }

    fn next_outcome(&self, attempt: usize) -> MockOutcome {
        if let Some(outcome) = lock(&self.script).pop_front() {
            return outcome;
        }
        self.faults
            .iter()
            .find(|(every, _)| attempt % every == 0)
            .map(|(_, outcome)| outcome.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Payload = String;
    type Destination = String;

    async fn send(&self, payload: &String, destination: &String) -> Result<(), TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.attempts_by_payload).entry(payload.clone()).or_insert(0) += 1;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.next_outcome(attempt) {
            MockOutcome::Success => {
                lock(&self.delivered).push(Delivery {
                    payload: payload.clone(),
                    destination: destination.clone(),
                });
                Ok(())
            }
            MockOutcome::RateLimited(retry_after) => Err(TransportError::RateLimited { retry_after }),
            MockOutcome::Transient(detail) => Err(TransportError::Transient(detail)),
            MockOutcome::Panic(reason) => panic!("{}", reason),
        }
    }
}
