//! Dispatcher - drains the priority queue under the rate limiter's control.
//!
//! A single background worker ticks on a fixed interval. Each tick:
//! 1. Returns immediately unless the dispatcher is running (not paused)
//! 2. Asks the limiter for admission, pausing for the backoff if refused
//! 3. Pops up to one batch of messages, re-checking admission before each
//! 4. Sends each through the transport and folds the outcome into the
//!    limiter, then completes, retries, or drops the message
//!
//! Ticks never overlap: the worker runs them one at a time and manual calls
//! to `tick()` take the same lock.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::domain::{CallbackOutcome, CompletionCallback, MAX_RETRIES, Priority, QueuedMessage};
use crate::error::{RelayqError, Result};
use crate::transport::{Transport, TransportError};

use super::queue::DispatchQueue;
use super::rate_limit::{RateLimitConfig, RateLimiter};
use super::state::{DispatchState, DispatchStats, StateCell, TickReport};

/// Default interval between ticks.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);
/// Default number of sends per tick.
pub const MAX_BATCH_SIZE: usize = 5;
/// Pause applied when the transport signals a rate limit without a hint.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_millis(1000);
/// How long `stop()` waits for an in-flight tick before aborting it.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Request budget and backoff policy.
    pub rate_limit: RateLimitConfig,
    /// Interval between worker ticks.
    pub tick_interval: Duration,
    /// Max messages sent per tick.
    pub max_batch_size: usize,
    /// Retries allowed per message after its first attempt.
    pub max_retries: u32,
    /// Pause used when a rate-limit signal carries no retry-after.
    pub default_retry_after: Duration,
    /// Reject fresh work beyond this many pending messages (`None` = unbounded).
    pub queue_capacity: Option<usize>,
    /// Grace period for an in-flight tick during `stop()`.
    pub stop_grace: Duration,
    /// Fail every still-queued message on `stop()` instead of leaving it queued.
    pub fail_pending_on_stop: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            tick_interval: TICK_INTERVAL,
            max_batch_size: MAX_BATCH_SIZE,
            max_retries: MAX_RETRIES,
            default_retry_after: DEFAULT_RETRY_AFTER,
            queue_capacity: None,
            stop_grace: STOP_GRACE,
            fail_pending_on_stop: false,
        }
    }
}

impl DispatcherConfig {
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_default_retry_after(mut self, retry_after: Duration) -> Self {
        self.default_retry_after = retry_after;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_fail_pending_on_stop(mut self, fail: bool) -> Self {
        self.fail_pending_on_stop = fail;
        self
    }

    /// Reject settings the worker cannot run with.
    fn check(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(RelayqError::InvalidConfig("tick_interval must be greater than 0".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(RelayqError::InvalidConfig("max_batch_size must be greater than 0".to_string()));
        }
        Ok(())
    }
}

type Message<T> = QueuedMessage<<T as Transport>::Payload, <T as Transport>::Destination>;

/// Handle to the background tick task.
struct Worker {
    handle: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

struct Inner<T: Transport> {
    config: DispatcherConfig,
    transport: T,
    queue: Arc<DispatchQueue<T::Payload, T::Destination>>,
    limiter: RateLimiter,
    state: StateCell,
    stats: Mutex<DispatchStats>,
    tick_lock: AsyncMutex<()>,
    worker: Mutex<Option<Worker>>,
    resume_timer: Mutex<Option<JoinHandle<()>>>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Priority rate-limited dispatch queue.
///
/// Cheap to clone; clones share the same queue, limiter, and worker.
pub struct Dispatcher<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Dispatcher<T> {
    /// Create a stopped dispatcher.
    pub fn new(transport: T, config: DispatcherConfig) -> Self {
        let queue = Arc::new(DispatchQueue::with_capacity(config.queue_capacity));
        let limiter = RateLimiter::new(config.rate_limit.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                queue,
                limiter,
                state: StateCell::new(),
                stats: Mutex::new(DispatchStats::default()),
                tick_lock: AsyncMutex::new(()),
                worker: Mutex::new(None),
                resume_timer: Mutex::new(None),
            }),
        }
    }

    /// Create a stopped dispatcher with default settings.
    pub fn with_defaults(transport: T) -> Self {
        Self::new(transport, DispatcherConfig::default())
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// Start the background worker on the current tokio runtime.
    ///
    /// Returns `Ok(true)` if this call started the dispatcher and `Ok(false)`
    /// if it was already started.
    pub fn start(&self) -> Result<bool> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| RelayqError::NoRuntime(e.to_string()))?;
        self.inner.config.check()?;

        // Hold the worker slot across the transition so a concurrent stop()
        // always finds the worker it has to shut down.
        let mut slot = lock(&self.inner.worker);
        if !self.inner.state.transition(DispatchState::Stopped, DispatchState::Running) {
            tracing::debug!(state = %self.inner.state.get(), "Dispatcher already started");
            return Ok(false);
        }

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = runtime.spawn(run_worker(
            Arc::downgrade(&self.inner),
            self.inner.config.tick_interval,
            shutdown_rx,
        ));
        *slot = Some(Worker { handle, shutdown });

        tracing::info!(
            tick_interval_ms = self.inner.config.tick_interval.as_millis() as u64,
            max_batch_size = self.inner.config.max_batch_size,
            "Dispatcher started"
        );
        Ok(true)
    }

    /// Stop the dispatcher.
    ///
    /// No tick starts after this returns. An in-flight tick gets the
    /// configured grace period to finish before the worker is aborted.
    /// Queued messages stay queued (unprocessed) unless
    /// `fail_pending_on_stop` is set, in which case each is completed with
    /// `false`. Returns false if the dispatcher was already stopped.
    pub async fn stop(&self) -> bool {
        // Same slot lock as start(): the transition and taking the worker
        // happen together, so a racing start() never has its worker taken.
        let (previous, worker) = {
            let mut slot = lock(&self.inner.worker);
            let Some(previous) = self.inner.state.stop() else {
                return false;
            };
            (previous, slot.take())
        };

        if let Some(timer) = lock(&self.inner.resume_timer).take() {
            timer.abort();
        }

        if let Some(Worker { mut handle, shutdown }) = worker {
            let _ = shutdown.send(());
            let grace = self.inner.config.stop_grace;
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => tracing::debug!("Dispatcher worker joined"),
                Ok(Err(e)) => tracing::error!(error = ?e, "Dispatcher worker ended abnormally"),
                Err(_) => {
                    tracing::warn!(
                        grace_ms = grace.as_millis() as u64,
                        "In-flight tick overran stop grace period, aborting worker"
                    );
                    handle.abort();
                }
            }
        }

        if self.inner.config.fail_pending_on_stop {
            self.inner.fail_pending();
        }

        tracing::info!(
            previous = %previous,
            pending = self.inner.queue.len(),
            "Dispatcher stopped"
        );
        true
    }

    /// Pause dispatching. Ticks become no-ops until `resume()`.
    pub fn pause(&self) -> bool {
        let paused = self.inner.state.transition(DispatchState::Running, DispatchState::Paused);
        if paused {
            tracing::info!("Dispatcher paused");
        }
        paused
    }

    /// Resume a paused dispatcher.
    pub fn resume(&self) -> bool {
        let resumed = self.inner.state.transition(DispatchState::Paused, DispatchState::Running);
        if resumed {
            tracing::info!("Dispatcher resumed");
        }
        resumed
    }

    pub fn state(&self) -> DispatchState {
        self.inner.state.get()
    }

    /// True unless stopped (a paused dispatcher is still running).
    pub fn is_running(&self) -> bool {
        self.state().accepts_work()
    }

    pub fn is_paused(&self) -> bool {
        self.state() == DispatchState::Paused
    }

    /// Queue a message without completion notification.
    pub fn enqueue(&self, payload: T::Payload, destination: impl Into<Arc<T::Destination>>, priority: Priority) -> bool {
        self.submit(payload, destination.into(), priority, None)
    }

    /// Queue a message; `callback` fires exactly once with the final result.
    ///
    /// If the dispatcher is stopped or the queue is full, the callback fires
    /// immediately with `false` and the message is discarded. The callback is
    /// the only channel through which a message's failure is reported.
    pub fn enqueue_with_callback<F>(
        &self,
        payload: T::Payload,
        destination: impl Into<Arc<T::Destination>>,
        priority: Priority,
        callback: F,
    ) -> bool
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.submit(payload, destination.into(), priority, Some(Box::new(callback)))
    }

    /// Queue a message and get a receiver that resolves with the final
    /// result. If the message is dropped by `clear()`, the receiver reports
    /// a closed channel instead.
    pub fn enqueue_tracked(
        &self,
        payload: T::Payload,
        destination: impl Into<Arc<T::Destination>>,
        priority: Priority,
    ) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.submit(
            payload,
            destination.into(),
            priority,
            Some(Box::new(move |success| {
                let _ = tx.send(success);
            })),
        );
        rx
    }

    fn submit(
        &self,
        payload: T::Payload,
        destination: Arc<T::Destination>,
        priority: Priority,
        callback: Option<CompletionCallback>,
    ) -> bool {
        let message = QueuedMessage::new(payload, destination, priority)
            .with_max_retries(self.inner.config.max_retries)
            .with_boxed_callback(callback);

        let state = self.inner.state.get();
        if !state.accepts_work() {
            tracing::warn!(priority = %priority, "Dispatcher is not running, message rejected");
            lock(&self.inner.stats).rejected += 1;
            self.inner.finish(message, false);
            return false;
        }

        match self.inner.queue.push(message) {
            Ok(()) => {
                let depth = self.inner.queue.len();
                {
                    let mut stats = lock(&self.inner.stats);
                    stats.enqueued += 1;
                    stats.peak_queue_depth = stats.peak_queue_depth.max(depth);
                }
                tracing::debug!(priority = %priority, depth, "Message queued");
                true
            }
            Err(message) => {
                tracing::warn!(
                    priority = %priority,
                    capacity = ?self.inner.queue.capacity(),
                    "Dispatch queue full, message rejected"
                );
                lock(&self.inner.stats).rejected += 1;
                self.inner.finish(message, false);
                false
            }
        }
    }

    /// Run one tick now. Waits for any tick already in progress.
    pub async fn tick(&self) -> TickReport {
        self.inner.tick().await
    }

    pub fn queue_size(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn queue_size_by_priority(&self, priority: Priority) -> usize {
        self.inner.queue.len_by_priority(priority)
    }

    /// Drop all pending messages without completing them.
    pub fn clear(&self) -> usize {
        let dropped = self.inner.queue.clear();
        if dropped > 0 {
            tracing::info!(dropped, "Dispatch queue cleared");
        }
        dropped
    }

    pub fn stats(&self) -> DispatchStats {
        lock(&self.inner.stats).clone()
    }
}

impl<T: Transport> Inner<T> {
    async fn tick(self: &Arc<Self>) -> TickReport {
        let _guard = self.tick_lock.lock().await;

        let state = self.state.get();
        if state != DispatchState::Running {
            return TickReport::Skipped(state);
        }
        lock(&self.stats).ticks += 1;

        if !self.limiter.can_make_request() {
            let wait = self.limiter.backoff_time();
            lock(&self.stats).deferred_ticks += 1;
            if !wait.is_zero() {
                tracing::debug!(wait_ms = wait.as_millis() as u64, "Limiter closed, pausing dispatch");
                self.pause_for(wait);
            }
            return TickReport::Deferred { wait };
        }

        let (mut attempted, mut sent, mut failed) = (0, 0, 0);
        while attempted < self.config.max_batch_size {
            if self.state.get() != DispatchState::Running || !self.limiter.can_make_request() {
                break;
            }
            let Some(message) = self.queue.pop() else {
                break;
            };
            attempted += 1;
            if self.dispatch(message).await {
                sent += 1;
            } else {
                failed += 1;
            }
        }

        if attempted > 0 {
            tracing::debug!(attempted, sent, failed, pending = self.queue.len(), "Tick dispatched batch");
        }
        TickReport::Dispatched { attempted, sent, failed }
    }

    /// Send one message. Returns true if it was delivered.
    async fn dispatch(self: &Arc<Self>, message: Message<T>) -> bool {
        let result = AssertUnwindSafe(self.transport.send(message.payload(), &**message.destination()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                lock(&self.stats).transport_panics += 1;
                tracing::error!(priority = %message.priority(), reason = %reason, "Transport panicked during send");
                Err(TransportError::Transient(format!("transport panicked: {}", reason)))
            });

        match result {
            Ok(()) => {
                self.limiter.record_request();
                lock(&self.stats).sent += 1;
                tracing::debug!(
                    priority = %message.priority(),
                    retry_count = message.retry_count(),
                    "Message delivered"
                );
                self.finish(message, true);
                true
            }
            Err(err) => {
                self.handle_failure(message, err);
                false
            }
        }
    }

    fn handle_failure(self: &Arc<Self>, mut message: Message<T>, err: TransportError) {
        match &err {
            TransportError::RateLimited { retry_after } => {
                let wait = retry_after.unwrap_or(self.config.default_retry_after);
                lock(&self.stats).rate_limited += 1;
                self.limiter.record_rate_limit(wait);
                self.pause_for(wait);
            }
            TransportError::Transient(detail) => {
                lock(&self.stats).transient_errors += 1;
                self.limiter.record_error();
                tracing::warn!(
                    priority = %message.priority(),
                    retry_count = message.retry_count(),
                    error = %detail,
                    "Send failed"
                );
            }
        }

        if message.can_retry() {
            message.increment_retry_count();
            let delay = self.limiter.backoff_time();
            lock(&self.stats).retried += 1;
            tracing::debug!(
                attempt = message.retry_count(),
                delay_ms = delay.as_millis() as u64,
                "Retrying message"
            );
            self.schedule_requeue(message, delay);
        } else {
            tracing::error!(
                priority = %message.priority(),
                retries = message.retry_count(),
                error = %err,
                "Message failed after retries, dropping"
            );
            lock(&self.stats).failed += 1;
            self.finish(message, false);
        }
    }

    fn schedule_requeue(self: &Arc<Self>, message: Message<T>, delay: Duration) {
        if delay.is_zero() {
            self.queue.requeue(message);
            return;
        }
        // Detached so a pending retry survives stop(); it lands back in the
        // queue like any other unprocessed message.
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = inner.upgrade() else {
                // Every dispatcher handle is gone; nothing will send it.
                message.complete(false);
                return;
            };
            inner.queue.requeue(message);
            // Push before checking: a stop() that has not drained yet will
            // see the message, one that already drained is caught here.
            if inner.state.get() == DispatchState::Stopped && inner.config.fail_pending_on_stop {
                inner.fail_pending();
            }
        });
    }

    /// Complete every queued message with `false`.
    fn fail_pending(&self) -> usize {
        let pending = self.queue.drain();
        let count = pending.len();
        for message in pending {
            lock(&self.stats).failed += 1;
            self.finish(message, false);
        }
        if count > 0 {
            tracing::warn!(count, "Failed pending messages on stop");
        }
        count
    }

    /// Pause and arm a one-shot resume after `wait`. A newer pause replaces
    /// any resume timer still pending.
    fn pause_for(self: &Arc<Self>, wait: Duration) {
        self.state.transition(DispatchState::Running, DispatchState::Paused);
        if self.state.get() != DispatchState::Paused {
            return;
        }

        let inner = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.state.transition(DispatchState::Paused, DispatchState::Running) {
                tracing::debug!("Backoff elapsed, dispatch resumed");
            }
        });
        if let Some(previous) = lock(&self.resume_timer).replace(timer) {
            previous.abort();
        }
    }

    fn finish(&self, message: Message<T>, success: bool) {
        let outcome = message.complete(success);
        if outcome == CallbackOutcome::Panicked {
            lock(&self.stats).callback_panics += 1;
        }
    }
}

async fn run_worker<T: Transport>(inner: Weak<Inner<T>>, tick_interval: Duration, mut shutdown: oneshot::Receiver<()>) {
    let mut interval = tokio::time::interval_at(Instant::now() + tick_interval, tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if inner.state.get() == DispatchState::Stopped {
                    break;
                }
                inner.tick().await;
            }
        }
    }

    tracing::debug!("Dispatcher worker exited");
}
