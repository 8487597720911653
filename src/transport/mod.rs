//! Transport boundary - delivery of a single message to the remote API
//!
//! The dispatcher never looks at error text. A transport classifies every
//! failure up front as either an explicit rate-limit signal or a generic
//! transient error, and the dispatcher folds that classification into its
//! limiter and retry bookkeeping.

pub mod mock;

use std::time::Duration;

use async_trait::async_trait;

pub use mock::{MockOutcome, MockTransport};

/// Delivers one message to its destination.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Message content handed through unmodified.
    type Payload: Send + Sync + 'static;
    /// Target handle (channel, room, webhook, ...).
    type Destination: Send + Sync + 'static;

    /// Send a single message.
    async fn send(&self, payload: &Self::Payload, destination: &Self::Destination) -> Result<(), TransportError>;
}

/// Failures a transport can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The remote API asked us to slow down.
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Anything else worth retrying.
    #[error("Transient send error: {0}")]
    Transient(String),
}

impl TransportError {
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::RateLimited {
            retry_after: Some(retry_after),
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::Transient(detail.into())
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, TransportError::RateLimited { .. })
    }

    /// Retry-after duration carried by a rate-limit signal, if the remote
    /// side supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after } => *retry_after,
            TransportError::Transient(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_error() {
        let err = TransportError::rate_limited(Duration::from_millis(1500));
        assert!(err.is_rate_limit());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(err.to_string(), "Rate limited, retry after Some(1.5s)");
    }

    #[test]
    fn test_rate_limited_without_hint() {
        let err = TransportError::RateLimited { retry_after: None };
        assert!(err.is_rate_limit());
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_transient_error() {
        let err = TransportError::transient("connection reset");
        assert!(!err.is_rate_limit());
        assert_eq!(err.retry_after(), None);
        assert_eq!(err.to_string(), "Transient send error: connection reset");
    }
}
