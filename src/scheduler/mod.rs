//! Scheduler module: priority queue, rate limiter, and the dispatcher that
//! ties them together.
//!
//! # Architecture
//!
//! The scheduler uses a polling model:
//! 1. Producers enqueue messages into a shared `DispatchQueue`
//! 2. A background worker ticks the `Dispatcher` on a fixed interval
//! 3. Each tick asks the `RateLimiter` for admission and sends one batch
//! 4. Send outcomes feed back into the limiter and the retry path
//!
//! # Example
//!
//! ```ignore
//! use relayq::scheduler::{Dispatcher, DispatcherConfig};
//! use relayq::transport::MockTransport;
//! use relayq::domain::Priority;
//!
//! let dispatcher = Dispatcher::new(MockTransport::new(), DispatcherConfig::default());
//! dispatcher.start()?;
//! dispatcher.enqueue("hello".to_string(), "general".to_string(), Priority::High);
//! ```

mod dispatcher;
mod queue;
mod rate_limit;
mod state;

pub use dispatcher::{
    DEFAULT_RETRY_AFTER, Dispatcher, DispatcherConfig, MAX_BATCH_SIZE, STOP_GRACE, TICK_INTERVAL,
};
pub use queue::DispatchQueue;
pub use rate_limit::{
    BACKOFF_BASE, MAX_BACKOFF, MAX_PER_WINDOW, RateLimitConfig, RateLimitSnapshot, RateLimiter, WINDOW,
};
pub use state::{DispatchState, DispatchStats, TickReport};
