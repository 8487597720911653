//! Relayq - priority rate-limited dispatch queue for chat bridges
//!
//! Producers enqueue outbound messages at one of four priorities. A single
//! background worker drains them in priority order while staying inside the
//! remote API's request budget, backing off on rate-limit signals and
//! retrying transient failures a bounded number of times.

pub mod config;
pub mod domain;
pub mod error;
pub mod scheduler;
pub mod transport;

pub use domain::{Priority, QueuedMessage};
pub use error::{RelayqError, Result};
pub use scheduler::{DispatchState, DispatchStats, Dispatcher, DispatcherConfig, RateLimitConfig, TickReport};
pub use transport::{Transport, TransportError};
