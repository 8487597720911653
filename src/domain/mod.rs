//! Domain types for relayq
//!
//! - Priority: the four dispatch levels
//! - QueuedMessage: one unit of outbound work with its retry state and
//!   completion callback

pub mod message;
pub mod priority;

pub use message::{CallbackOutcome, CompletionCallback, MAX_RETRIES, QueuedMessage};
pub use priority::Priority;
