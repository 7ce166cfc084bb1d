//! Broker Error Types
//!
//! This module defines the errors a broker transport can report back to the
//! client layer. The client translates them into defined behavior:
//!
//! ## Error Categories
//!
//! ### Absence
//! - `NoResponders`: Nothing is listening on the subject (missing station/stream)
//! - `StreamNotFound`: The backing stream of a consumer is gone
//! - `ConsumerNotFound`: The durable consumer is gone
//!
//! ### Transient
//! - `Timeout`: A bounded wait elapsed without a response
//!
//! ### Lifecycle
//! - `SubscriptionClosed`: The subscription was drained or unsubscribed
//! - `ConnectionClosed`: The broker connection is closed
//!
//! ## Usage
//!
//! ```ignore
//! use stationhouse_broker::{Broker, BrokerError};
//!
//! match broker.publish_to_stream(message, ack_wait).await {
//!     Ok(ack) => println!("stored at {}", ack.sequence),
//!     Err(e) if e.is_no_responders() => println!("station does not exist"),
//!     Err(e) => return Err(e),
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("No responders available for subject '{0}'")]
    NoResponders(String),

    #[error("Broker did not respond within {0:?}")]
    Timeout(Duration),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("consumer not found: {durable} on stream {stream}")]
    ConsumerNotFound { stream: String, durable: String },

    #[error("Subscription on '{0}' is closed")]
    SubscriptionClosed(String),

    #[error("Connection to the broker is closed")]
    ConnectionClosed,

    #[error("Invalid ack token: {0}")]
    InvalidAckToken(String),

    #[error("Broker error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// True when nothing received a publish or request on the subject.
    pub fn is_no_responders(&self) -> bool {
        matches!(self, BrokerError::NoResponders(_))
    }

    /// True when the broker reports a missing consumer or backing stream.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BrokerError::StreamNotFound(_) | BrokerError::ConsumerNotFound { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(BrokerError::NoResponders("a.final".into()).is_no_responders());
        assert!(BrokerError::StreamNotFound("a".into()).is_not_found());
        assert!(BrokerError::ConsumerNotFound {
            stream: "a".into(),
            durable: "g".into()
        }
        .is_not_found());
        assert!(BrokerError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(!BrokerError::ConnectionClosed.is_not_found());
        assert!(!BrokerError::Timeout(Duration::from_secs(1)).is_no_responders());
    }

    #[test]
    fn test_not_found_messages_match_broker_wording() {
        let err = BrokerError::ConsumerNotFound {
            stream: "orders$1".into(),
            durable: "billing".into(),
        };
        assert!(err.to_string().contains("consumer not found"));
        assert!(BrokerError::StreamNotFound("orders".into())
            .to_string()
            .contains("stream not found"));
    }
}
