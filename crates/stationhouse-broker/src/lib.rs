//! StationHouse Broker Seam
//!
//! This crate defines the transport interface the StationHouse client drives.
//! The client never talks to a socket directly; every publish, request, pull
//! and subscription goes through the [`Broker`] trait.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │   Producer   │   │   Consumer   │
//! └──────┬───────┘   └──────┬───────┘
//!        │                  │
//!        ▼                  ▼
//! ┌─────────────────────────────────┐
//! │          Client façade          │
//! └───────────────┬─────────────────┘
//!                 │ Arc<dyn Broker>
//!                 ▼
//! ┌─────────────────────────────────┐
//! │  Broker (this crate)            │ ◄── You are here
//! │  - request / publish            │
//! │  - publish_to_stream (+ack)     │
//! │  - subscribe                    │
//! │  - fetch / consumer_info        │
//! │  - ack / nak / term             │
//! └─────────────────────────────────┘
//! ```
//!
//! ## Implementations
//!
//! - **InMemoryBroker**: in-process broker with streams, durable consumers,
//!   core subscriptions and request responders. Used by the test suites and
//!   for local development.
//!
//! Production transports implement the same trait on top of a real broker
//! connection.
//!
//! ## Subjects
//!
//! A stream captures every subject whose first `.`-separated token equals the
//! stream name, so `orders$2.final` and `orders$2.functions.7` both land in
//! the `orders$2` stream.

pub mod error;
pub mod memory;
pub mod types;

pub use error::{BrokerError, Result};
pub use memory::{InMemoryBroker, Responder};
pub use types::{
    AckToken, ConsumerInfo, Delivery, Headers, OutboundMessage, PublishAck, Subscription,
};

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Broker transport trait.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync`; the client shares one broker
/// across every producer, consumer and background task via `Arc<dyn Broker>`.
///
/// ## Bounded Waits
///
/// Every method that waits on the broker takes (or is bounded by) a timeout.
/// No call may block forever.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Send a request and wait up to `timeout` for a single reply.
    ///
    /// Fails with `NoResponders` when nothing is listening on `subject`.
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Bytes>;

    /// Fire-and-forget publish on a core subject.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Publish into the stream that captures `message.subject` and wait up to
    /// `ack_wait` for the stream acknowledgment.
    ///
    /// Fails with `NoResponders` when no stream captures the subject.
    async fn publish_to_stream(
        &self,
        message: OutboundMessage,
        ack_wait: Duration,
    ) -> Result<PublishAck>;

    /// Open a core subscription on `subject`.
    async fn subscribe(&self, subject: &str) -> Result<Subscription>;

    /// Pull up to `batch` messages for a durable consumer, waiting at most
    /// `max_wait`. Returns an empty vector when nothing arrived in time.
    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        batch: usize,
        max_wait: Duration,
    ) -> Result<Vec<Delivery>>;

    /// Probe a durable consumer; fails with `StreamNotFound` or
    /// `ConsumerNotFound` when either side is gone.
    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<ConsumerInfo>;

    async fn ack(&self, token: &AckToken) -> Result<()>;

    /// Negative ack; the message is redelivered, optionally after `delay`.
    async fn nak(&self, token: &AckToken, delay: Option<Duration>) -> Result<()>;

    /// Terminate delivery; the message is never redelivered.
    async fn term(&self, token: &AckToken) -> Result<()>;
}
