//! In-memory broker.
//!
//! A single-process implementation of [`Broker`] with just enough broker
//! semantics for the client to be exercised end to end:
//!
//! - **Streams** capture subjects by their first `.`-separated token and
//!   assign 1-based sequences. A `msg-id` header is deduplicated per stream.
//! - **Durable consumers** keep a cursor, a pending (unacked) set and a
//!   redelivery queue fed by `nak`.
//! - **Core subscriptions** receive exact-subject publishes through a bounded
//!   channel; slow subscribers drop messages instead of blocking publishers.
//! - **Responders** answer requests inline. A request on a subject without a
//!   responder fails with `NoResponders`, like a real broker.
//!
//! ## Example
//!
//! ```ignore
//! use stationhouse_broker::{Broker, InMemoryBroker};
//!
//! let broker = InMemoryBroker::new();
//! broker.add_stream("orders");
//! broker.add_consumer("orders", "billing")?;
//! broker.register_responder("$memphis_producer_creations", |_broker, _req| Ok(Bytes::new()));
//! ```

use crate::error::{BrokerError, Result};
use crate::types::{
    AckToken, ConsumerInfo, Delivery, Headers, OutboundMessage, PublishAck, Subscription,
};
use crate::Broker;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// Request handler registered on a subject.
///
/// Responders run inline on the requesting task and receive the broker so
/// they can create or delete streams as a side effect.
pub type Responder = Arc<dyn Fn(&InMemoryBroker, Bytes) -> Result<Bytes> + Send + Sync>;

const SUBSCRIPTION_BUFFER: usize = 1024;
const MESSAGE_ID_HEADER: &str = "msg-id";

/// Upper bound on a single fetch wait slice, so delayed redeliveries become
/// visible without a publish to wake the fetcher.
const FETCH_WAIT_SLICE: Duration = Duration::from_millis(20);

/// In-process broker shared by cloning.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    responders: RwLock<HashMap<String, Responder>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Delivery>>>>,
    streams: Mutex<HashMap<String, StreamState>>,
    core_log: Mutex<Vec<(String, Bytes)>>,
    stream_arrivals: Notify,
    closed: AtomicBool,
}

#[derive(Default)]
struct StreamState {
    messages: Vec<StoredMessage>,
    consumers: HashMap<String, DurableState>,
    seen_ids: HashMap<String, u64>,
}

struct StoredMessage {
    subject: String,
    payload: Bytes,
    headers: Headers,
}

#[derive(Default)]
struct DurableState {
    next_index: usize,
    redeliveries: VecDeque<(u64, Instant)>,
    delivery_counts: HashMap<u64, u64>,
    pending: HashSet<u64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn stream_for_subject(subject: &str) -> &str {
    match subject.find('.') {
        Some(index) => &subject[..index],
        None => subject,
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the responder for `subject`.
    pub fn register_responder<F>(&self, subject: impl Into<String>, responder: F)
    where
        F: Fn(&InMemoryBroker, Bytes) -> Result<Bytes> + Send + Sync + 'static,
    {
        let mut responders = self
            .inner
            .responders
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        responders.insert(subject.into(), Arc::new(responder));
    }

    pub fn remove_responder(&self, subject: &str) {
        let mut responders = self
            .inner
            .responders
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        responders.remove(subject);
    }

    /// Create a stream. Returns `false` if it already existed.
    pub fn add_stream(&self, name: impl Into<String>) -> bool {
        let name = name.into();
        let mut streams = lock(&self.inner.streams);
        if streams.contains_key(&name) {
            return false;
        }
        debug!(stream = %name, "Stream created");
        streams.insert(name, StreamState::default());
        true
    }

    /// Delete a stream and every durable consumer bound to it.
    pub fn delete_stream(&self, name: &str) -> bool {
        let removed = lock(&self.inner.streams).remove(name).is_some();
        if removed {
            debug!(stream = %name, "Stream deleted");
        }
        removed
    }

    pub fn has_stream(&self, name: &str) -> bool {
        lock(&self.inner.streams).contains_key(name)
    }

    /// Create a durable consumer on an existing stream (idempotent).
    pub fn add_consumer(&self, stream: &str, durable: impl Into<String>) -> Result<()> {
        let mut streams = lock(&self.inner.streams);
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;
        state.consumers.entry(durable.into()).or_default();
        Ok(())
    }

    pub fn delete_consumer(&self, stream: &str, durable: &str) -> bool {
        let mut streams = lock(&self.inner.streams);
        streams
            .get_mut(stream)
            .map(|state| state.consumers.remove(durable).is_some())
            .unwrap_or(false)
    }

    /// Snapshot of every message stored in a stream, in sequence order.
    pub fn stream_messages(&self, stream: &str) -> Vec<Delivery> {
        let streams = lock(&self.inner.streams);
        streams
            .get(stream)
            .map(|state| {
                state
                    .messages
                    .iter()
                    .enumerate()
                    .map(|(index, m)| Delivery {
                        subject: m.subject.clone(),
                        payload: m.payload.clone(),
                        headers: m.headers.clone(),
                        sequence: index as u64 + 1,
                        num_delivered: 0,
                        ack_token: None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every payload published on a core subject so far.
    pub fn core_published(&self, subject: &str) -> Vec<Bytes> {
        lock(&self.inner.core_log)
            .iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Close the broker. Subscriptions end and every later call fails with
    /// `ConnectionClosed`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        lock(&self.inner.subscribers).clear();
        self.inner.stream_arrivals.notify_waiters();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(())
    }

    fn take_ready(&self, stream: &str, durable: &str, batch: usize) -> Result<Vec<Delivery>> {
        let mut streams = lock(&self.inner.streams);
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;
        let StreamState {
            messages,
            consumers,
            ..
        } = state;
        let consumer = consumers
            .get_mut(durable)
            .ok_or_else(|| BrokerError::ConsumerNotFound {
                stream: stream.to_string(),
                durable: durable.to_string(),
            })?;

        let now = Instant::now();
        let mut sequences = Vec::new();

        let mut index = 0;
        while index < consumer.redeliveries.len() && sequences.len() < batch {
            if consumer.redeliveries[index].1 <= now {
                if let Some((sequence, _)) = consumer.redeliveries.remove(index) {
                    sequences.push(sequence);
                }
            } else {
                index += 1;
            }
        }

        while sequences.len() < batch && consumer.next_index < messages.len() {
            consumer.next_index += 1;
            sequences.push(consumer.next_index as u64);
        }

        let deliveries = sequences
            .into_iter()
            .map(|sequence| {
                let count = consumer.delivery_counts.entry(sequence).or_insert(0);
                *count += 1;
                consumer.pending.insert(sequence);
                let stored = &messages[(sequence - 1) as usize];
                Delivery {
                    subject: stored.subject.clone(),
                    payload: stored.payload.clone(),
                    headers: stored.headers.clone(),
                    sequence,
                    num_delivered: *count,
                    ack_token: Some(AckToken {
                        stream: stream.to_string(),
                        durable: durable.to_string(),
                        sequence,
                    }),
                }
            })
            .collect();

        Ok(deliveries)
    }

    fn with_consumer<T>(
        &self,
        token: &AckToken,
        f: impl FnOnce(&mut DurableState) -> T,
    ) -> Result<T> {
        let mut streams = lock(&self.inner.streams);
        let state = streams
            .get_mut(&token.stream)
            .ok_or_else(|| BrokerError::StreamNotFound(token.stream.clone()))?;
        let consumer =
            state
                .consumers
                .get_mut(&token.durable)
                .ok_or_else(|| BrokerError::ConsumerNotFound {
                    stream: token.stream.clone(),
                    durable: token.durable.clone(),
                })?;
        Ok(f(consumer))
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn request(&self, subject: &str, payload: Bytes, _timeout: Duration) -> Result<Bytes> {
        self.ensure_open()?;
        let responder = {
            let responders = self
                .inner
                .responders
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            responders.get(subject).cloned()
        };

        match responder {
            Some(responder) => responder(self, payload),
            None => Err(BrokerError::NoResponders(subject.to_string())),
        }
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        lock(&self.inner.core_log).push((subject.to_string(), payload.clone()));

        let senders = {
            let mut subscribers = lock(&self.inner.subscribers);
            match subscribers.get_mut(subject) {
                Some(list) => {
                    list.retain(|sender| !sender.is_closed());
                    list.clone()
                }
                None => Vec::new(),
            }
        };

        for sender in senders {
            let delivery = Delivery::core(subject, payload.clone(), Headers::new());
            if sender.try_send(delivery).is_err() {
                debug!(subject = %subject, "Dropped message for slow subscriber");
            }
        }
        Ok(())
    }

    async fn publish_to_stream(
        &self,
        message: OutboundMessage,
        _ack_wait: Duration,
    ) -> Result<PublishAck> {
        self.ensure_open()?;
        let stream = stream_for_subject(&message.subject).to_string();

        let ack = {
            let mut streams = lock(&self.inner.streams);
            let state = streams
                .get_mut(&stream)
                .ok_or_else(|| BrokerError::NoResponders(message.subject.clone()))?;

            if let Some(id) = message.headers.get(MESSAGE_ID_HEADER) {
                if let Some(&sequence) = state.seen_ids.get(id) {
                    return Ok(PublishAck {
                        stream,
                        sequence,
                        duplicate: true,
                        error: None,
                    });
                }
            }

            state.messages.push(StoredMessage {
                subject: message.subject.clone(),
                payload: message.payload,
                headers: message.headers.clone(),
            });
            let sequence = state.messages.len() as u64;
            if let Some(id) = message.headers.get(MESSAGE_ID_HEADER) {
                state.seen_ids.insert(id.to_string(), sequence);
            }

            PublishAck {
                stream,
                sequence,
                duplicate: false,
                error: None,
            }
        };

        trace!(subject = %message.subject, sequence = ack.sequence, "Stored message");
        self.inner.stream_arrivals.notify_waiters();
        Ok(ack)
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        lock(&self.inner.subscribers)
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(subject, rx))
    }

    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        batch: usize,
        max_wait: Duration,
    ) -> Result<Vec<Delivery>> {
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            self.ensure_open()?;
            // Enabled before checking so a publish in between is not missed.
            let arrival = self.inner.stream_arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let ready = self.take_ready(stream, durable, batch)?;
            if !ready.is_empty() {
                return Ok(ready);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let slice = (deadline - now).min(FETCH_WAIT_SLICE);
            let _ = tokio::time::timeout(slice, arrival).await;
        }
    }

    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<ConsumerInfo> {
        self.ensure_open()?;
        let streams = lock(&self.inner.streams);
        let state = streams
            .get(stream)
            .ok_or_else(|| BrokerError::StreamNotFound(stream.to_string()))?;
        let consumer = state
            .consumers
            .get(durable)
            .ok_or_else(|| BrokerError::ConsumerNotFound {
                stream: stream.to_string(),
                durable: durable.to_string(),
            })?;

        let unread = state.messages.len().saturating_sub(consumer.next_index);
        Ok(ConsumerInfo {
            stream: stream.to_string(),
            durable: durable.to_string(),
            num_pending: (unread + consumer.redeliveries.len()) as u64,
            num_ack_pending: consumer.pending.len() as u64,
        })
    }

    async fn ack(&self, token: &AckToken) -> Result<()> {
        self.ensure_open()?;
        self.with_consumer(token, |consumer| {
            consumer.pending.remove(&token.sequence);
        })
    }

    async fn nak(&self, token: &AckToken, delay: Option<Duration>) -> Result<()> {
        self.ensure_open()?;
        self.with_consumer(token, |consumer| {
            if consumer.pending.remove(&token.sequence) {
                let ready_at = Instant::now() + delay.unwrap_or_default();
                consumer.redeliveries.push_back((token.sequence, ready_at));
            }
        })?;
        self.inner.stream_arrivals.notify_waiters();
        Ok(())
    }

    async fn term(&self, token: &AckToken) -> Result<()> {
        self.ensure_open()?;
        self.with_consumer(token, |consumer| {
            consumer.pending.remove(&token.sequence);
        })
    }
}
