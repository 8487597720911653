//! Rate limiter for outbound sends.
//!
//! The remote API grants a fixed budget of requests per window. The limiter
//! tracks that budget and a count of consecutive errors, and tells the
//! dispatcher whether it may send now and how long to wait if not.
//!
//! Two backoff sources feed `backoff_time()`:
//! - a hard window, set by an explicit rate-limit signal from the transport
//! - a soft exponential backoff driven by repeated generic errors
//!
//! While a hard window is pending it always wins; the error-driven branch is
//! only consulted once the window has elapsed.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Default request budget per window.
pub const MAX_PER_WINDOW: u32 = 50;
/// Default window length.
pub const WINDOW: Duration = Duration::from_millis(1000);
/// Default base unit for error backoff (doubled per consecutive error).
pub const BACKOFF_BASE: Duration = Duration::from_millis(1000);
/// Default ceiling for error backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Rate limit configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Length of one budget window.
    pub window: Duration,
    /// Requests allowed per window.
    pub max_per_window: u32,
    /// Backoff for one consecutive error; doubles with each further error.
    pub backoff_base: Duration,
    /// Upper bound for error-driven backoff.
    pub max_backoff: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: WINDOW,
            max_per_window: MAX_PER_WINDOW,
            backoff_base: BACKOFF_BASE,
            max_backoff: MAX_BACKOFF,
        }
    }
}

impl RateLimitConfig {
    /// Create config with a custom window and budget.
    pub fn new(window: Duration, max_per_window: u32) -> Self {
        Self {
            window,
            max_per_window,
            ..Default::default()
        }
    }

    /// Set the error backoff base and ceiling.
    pub fn with_backoff(mut self, backoff_base: Duration, max_backoff: Duration) -> Self {
        self.backoff_base = backoff_base;
        self.max_backoff = max_backoff;
        self
    }
}

#[derive(Debug)]
struct RateLimitState {
    remaining: u32,
    window_reset_at: Instant,
    consecutive_errors: u32,
    last_request_at: Option<Instant>,
}

impl RateLimitState {
    fn fresh(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            remaining: config.max_per_window,
            window_reset_at: now + config.window,
            consecutive_errors: 0,
            last_request_at: None,
        }
    }
}

/// Point-in-time view of the limiter, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitSnapshot {
    pub remaining: u32,
    pub max_per_window: u32,
    pub time_until_reset_ms: u64,
    pub consecutive_errors: u32,
    pub backoff_ms: u64,
}

/// Shared request budget with backoff escalation.
///
/// All counters live in one mutex-guarded struct so that a window rollover
/// and the read that follows it are a single step for every caller.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<RateLimitState>,
}

impl RateLimiter {
    /// Create a limiter starting with a full budget.
    pub fn new(config: RateLimitConfig) -> Self {
        let state = RateLimitState::fresh(&config, Instant::now());
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, RateLimitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check whether a request may be sent now.
    ///
    /// Rolls the window over first if it is due, which refills the budget
    /// and forgets consecutive errors.
    pub fn can_make_request(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state();

        if now >= state.window_reset_at {
            state.remaining = self.config.max_per_window;
            state.window_reset_at = now + self.config.window;
            state.consecutive_errors = 0;
        }

        state.remaining > 0
    }

    /// Record a successfully dispatched request.
    pub fn record_request(&self) {
        let mut state = self.state();
        state.remaining = state.remaining.saturating_sub(1);
        state.last_request_at = Some(Instant::now());
        state.consecutive_errors = 0;
    }

    /// Record an explicit rate-limit signal: nothing may be sent until
    /// `retry_after` has elapsed.
    pub fn record_rate_limit(&self, retry_after: Duration) {
        let mut state = self.state();
        state.window_reset_at = Instant::now() + retry_after;
        state.remaining = 0;
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);

        tracing::warn!(
            retry_after_ms = retry_after.as_millis() as u64,
            consecutive_errors = state.consecutive_errors,
            "Rate limit hit, holding sends"
        );
    }

    /// Record a generic send failure. Only feeds exponential backoff.
    pub fn record_error(&self) {
        let mut state = self.state();
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
    }

    /// How long the dispatcher should wait before trying again.
    pub fn backoff_time(&self) -> Duration {
        let now = Instant::now();
        let state = self.state();

        if now < state.window_reset_at {
            return state.window_reset_at - now;
        }

        self.error_backoff(state.consecutive_errors)
    }

    fn error_backoff(&self, errors: u32) -> Duration {
        if errors == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(errors);
        self.config.backoff_base.saturating_mul(factor).min(self.config.max_backoff)
    }

    /// Requests left in the current window. Reports a full budget once the
    /// window is due to roll over.
    pub fn remaining_requests(&self) -> u32 {
        let now = Instant::now();
        let state = self.state();
        if now >= state.window_reset_at {
            self.config.max_per_window
        } else {
            state.remaining
        }
    }

    /// Time until the current window rolls over.
    pub fn time_until_reset(&self) -> Duration {
        let state = self.state();
        state.window_reset_at.saturating_duration_since(Instant::now())
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.state().consecutive_errors
    }

    pub fn last_request_at(&self) -> Option<Instant> {
        self.state().last_request_at
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            remaining: self.remaining_requests(),
            max_per_window: self.config.max_per_window,
            time_until_reset_ms: self.time_until_reset().as_millis() as u64,
            consecutive_errors: self.consecutive_errors(),
            backoff_ms: self.backoff_time().as_millis() as u64,
        }
    }

    /// Restore the initial state.
    pub fn reset(&self) {
        let mut state = self.state();
        *state = RateLimitState::fresh(&self.config, Instant::now());
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
