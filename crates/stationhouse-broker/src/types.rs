//! Wire-level types exchanged with the broker.
//!
//! These types describe messages as the broker sees them: a subject, an opaque
//! payload, ordered headers, and (for stream deliveries) an ack token that
//! identifies the delivery for later ack/nak/term calls.

use crate::error::{BrokerError, Result};
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

/// Ordered header map with unique keys.
///
/// Insertion order is preserved. Inserting an existing key replaces the value
/// in place, so the key keeps its original position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, returning the previous value if the key existed.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// A message to be stored in a stream.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,
}

/// Identifies a single stream delivery for ack/nak/term.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckToken {
    pub stream: String,
    pub durable: String,
    pub sequence: u64,
}

/// A message received from the broker, either pulled from a durable
/// consumer or pushed through a core subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,

    /// Stream sequence (0 for core deliveries).
    pub sequence: u64,

    /// How many times this message has been delivered to the consumer.
    pub num_delivered: u64,

    /// Present for stream deliveries; core deliveries have nothing to ack.
    pub ack_token: Option<AckToken>,
}

impl Delivery {
    /// Build a core (non-stream) delivery.
    pub fn core(subject: impl Into<String>, payload: Bytes, headers: Headers) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers,
            sequence: 0,
            num_delivered: 1,
            ack_token: None,
        }
    }
}

/// Broker acknowledgment of a stream publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,

    /// The message id was already seen inside the duplicate window.
    pub duplicate: bool,

    /// Error description reported by the broker, if the publish was rejected.
    pub error: Option<String>,
}

impl PublishAck {
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Durable consumer state reported by a liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub stream: String,
    pub durable: String,
    pub num_pending: u64,
    pub num_ack_pending: u64,
}

/// A core subscription on a single subject.
///
/// Messages are buffered in a channel fed by the broker. Dropping or draining
/// the subscription closes the channel, after which the broker stops routing
/// messages to it.
pub struct Subscription {
    subject: String,
    receiver: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, receiver: mpsc::Receiver<Delivery>) -> Self {
        Self {
            subject: subject.into(),
            receiver,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` when the wait elapsed, and `SubscriptionClosed`
    /// once the subscription was drained or the broker went away.
    pub async fn next_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(delivery)) => Ok(Some(delivery)),
            Ok(None) => Err(BrokerError::SubscriptionClosed(self.subject.clone())),
            Err(_) => Ok(None),
        }
    }

    /// Stop accepting new messages and return whatever is still buffered.
    pub fn drain(&mut self) -> Vec<Delivery> {
        self.receiver.close();
        let mut remaining = Vec::new();
        while let Ok(delivery) = self.receiver.try_recv() {
            remaining.push(delivery);
        }
        remaining
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish()
    }
}
