//! Shared fixtures for the integration tests.
//!
//! [`ControlPlane`] answers producer, consumer and station requests on an
//! [`InMemoryBroker`] the way the real control plane would: it creates the
//! backing streams and durables and reports partitions and schemas back.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use stationhouse_broker::{
    AckToken, Broker, BrokerError, ConsumerInfo, Delivery, InMemoryBroker, OutboundMessage,
    PublishAck, Subscription,
};
use stationhouse_client::protocol::{
    internal_name, stream_name, subjects, CreateConsumerRequest, CreateProducerRequest,
    CreateStationRequest,
};
use stationhouse_client::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Default)]
struct StationSetup {
    partitions: Vec<u32>,
    schema: Option<String>,
}

#[derive(Default)]
struct Counters {
    producer_creations: AtomicUsize,
    consumer_creations: AtomicUsize,
}

/// Emulated control plane on top of an in-memory broker.
#[derive(Clone)]
pub struct ControlPlane {
    pub broker: InMemoryBroker,
    stations: Arc<Mutex<HashMap<String, StationSetup>>>,
    counters: Arc<Counters>,
}

impl ControlPlane {
    pub fn new() -> Self {
        let plane = Self {
            broker: InMemoryBroker::new(),
            stations: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        };
        plane.install();
        plane
    }

    /// Declare a station. `partitions` of 0 or 1 means unpartitioned.
    pub fn station(&self, name: &str, partitions: u32) -> &Self {
        self.set(name, partitions, None)
    }

    /// Declare a station with a JSON schema attached.
    pub fn station_with_schema(&self, name: &str, partitions: u32, schema: &str) -> &Self {
        self.set(name, partitions, Some(schema.to_string()))
    }

    fn set(&self, name: &str, partitions: u32, schema: Option<String>) -> &Self {
        let partitions = if partitions > 1 {
            (1..=partitions).collect()
        } else {
            Vec::new()
        };
        self.stations
            .lock()
            .unwrap()
            .insert(internal_name(name), StationSetup { partitions, schema });
        self
    }

    pub fn client(&self) -> Client {
        self.client_on(Arc::new(self.broker.clone()))
    }

    pub fn client_on(&self, broker: Arc<dyn Broker>) -> Client {
        Client::builder()
            .broker(broker)
            .request_timeout(Duration::from_secs(1))
            .build()
            .unwrap()
    }

    pub fn producer_creations(&self) -> usize {
        self.counters.producer_creations.load(Ordering::SeqCst)
    }

    pub fn consumer_creations(&self) -> usize {
        self.counters.consumer_creations.load(Ordering::SeqCst)
    }

    /// Payloads of every message stored in `stream`.
    pub fn stored(&self, stream: &str) -> Vec<Bytes> {
        self.broker
            .stream_messages(stream)
            .into_iter()
            .map(|delivery| delivery.payload)
            .collect()
    }

    fn install(&self) {
        let stations = Arc::clone(&self.stations);
        self.broker
            .register_responder(subjects::STATION_CREATIONS, move |broker, payload| {
                let request: CreateStationRequest = decode(&payload)?;
                let name = internal_name(&request.name);
                let partitions: Vec<u32> = if request.partitions_number > 1 {
                    (1..=request.partitions_number).collect()
                } else {
                    Vec::new()
                };
                ensure_streams(broker, &name, &partitions);
                stations.lock().unwrap().entry(name).or_insert(StationSetup {
                    partitions,
                    schema: None,
                });
                Ok(Bytes::new())
            });

        let stations = Arc::clone(&self.stations);
        let counters = Arc::clone(&self.counters);
        self.broker
            .register_responder(subjects::PRODUCER_CREATIONS, move |broker, payload| {
                counters.producer_creations.fetch_add(1, Ordering::SeqCst);
                let request: CreateProducerRequest = decode(&payload)?;
                let name = internal_name(&request.station_name);
                let setup = lookup(&stations, &name);
                ensure_streams(broker, &name, &setup.partitions);

                let mut response = json!({
                    "error": "",
                    "schemaverse_to_dls": true,
                    "send_notification": false,
                    "station_version": 2,
                    "partitions_update": { "partitions_list": setup.partitions },
                });
                if let Some(schema) = &setup.schema {
                    response["schema_update"] = json!({
                        "schema_name": format!("{}-schema", name),
                        "type": "json",
                        "active_version": {
                            "version_number": 1,
                            "schema_content": schema,
                        },
                    });
                }
                Ok(Bytes::from(response.to_string()))
            });

        let stations = Arc::clone(&self.stations);
        let counters = Arc::clone(&self.counters);
        self.broker
            .register_responder(subjects::CONSUMER_CREATIONS, move |broker, payload| {
                counters.consumer_creations.fetch_add(1, Ordering::SeqCst);
                let request: CreateConsumerRequest = decode(&payload)?;
                let name = internal_name(&request.station_name);
                let durable = internal_name(&request.consumers_group);
                let setup = lookup(&stations, &name);
                for stream in ensure_streams(broker, &name, &setup.partitions) {
                    broker.add_consumer(&stream, durable.clone())?;
                }

                if setup.partitions.is_empty() {
                    return Ok(Bytes::new());
                }
                let response = json!({
                    "error": "",
                    "partitions_update": { "partitions_list": setup.partitions },
                });
                Ok(Bytes::from(response.to_string()))
            });

        for subject in [
            subjects::PRODUCER_DESTRUCTIONS,
            subjects::CONSUMER_DESTRUCTIONS,
            subjects::STATION_DESTRUCTIONS,
        ] {
            self.broker.register_responder(subject, |_, _| Ok(Bytes::new()));
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> stationhouse_broker::Result<T> {
    serde_json::from_slice(payload).map_err(|e| BrokerError::Internal(e.to_string()))
}

fn lookup(stations: &Mutex<HashMap<String, StationSetup>>, name: &str) -> StationSetup {
    stations
        .lock()
        .unwrap()
        .entry(name.to_string())
        .or_default()
        .clone()
}

fn ensure_streams(broker: &InMemoryBroker, station: &str, partitions: &[u32]) -> Vec<String> {
    let streams: Vec<String> = if partitions.is_empty() {
        vec![stream_name(station, None)]
    } else {
        partitions
            .iter()
            .map(|p| stream_name(station, Some(*p)))
            .collect()
    };
    for stream in &streams {
        broker.add_stream(stream.clone());
    }
    streams
}

/// Broker wrapper that counts pulls and stream publishes. Stream publishes
/// can be switched to answer "no responders".
pub struct CountingBroker {
    inner: InMemoryBroker,
    fetches: AtomicUsize,
    stream_publishes: AtomicUsize,
    refuse_stream_publishes: AtomicBool,
}

impl CountingBroker {
    pub fn new(inner: InMemoryBroker) -> Self {
        Self {
            inner,
            fetches: AtomicUsize::new(0),
            stream_publishes: AtomicUsize::new(0),
            refuse_stream_publishes: AtomicBool::new(false),
        }
    }

    pub fn refuse_stream_publishes(&self, refuse: bool) {
        self.refuse_stream_publishes.store(refuse, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn stream_publishes(&self) -> usize {
        self.stream_publishes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for CountingBroker {
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> stationhouse_broker::Result<Bytes> {
        self.inner.request(subject, payload, timeout).await
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> stationhouse_broker::Result<()> {
        self.inner.publish(subject, payload).await
    }

    async fn publish_to_stream(
        &self,
        message: OutboundMessage,
        ack_wait: Duration,
    ) -> stationhouse_broker::Result<PublishAck> {
        self.stream_publishes.fetch_add(1, Ordering::SeqCst);
        if self.refuse_stream_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::NoResponders(message.subject));
        }
        self.inner.publish_to_stream(message, ack_wait).await
    }

    async fn subscribe(&self, subject: &str) -> stationhouse_broker::Result<Subscription> {
        self.inner.subscribe(subject).await
    }

    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        batch: usize,
        max_wait: Duration,
    ) -> stationhouse_broker::Result<Vec<Delivery>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(stream, durable, batch, max_wait).await
    }

    async fn consumer_info(
        &self,
        stream: &str,
        durable: &str,
    ) -> stationhouse_broker::Result<ConsumerInfo> {
        self.inner.consumer_info(stream, durable).await
    }

    async fn ack(&self, token: &AckToken) -> stationhouse_broker::Result<()> {
        self.inner.ack(token).await
    }

    async fn nak(&self, token: &AckToken, delay: Option<Duration>) -> stationhouse_broker::Result<()> {
        self.inner.nak(token, delay).await
    }

    async fn term(&self, token: &AckToken) -> stationhouse_broker::Result<()> {
        self.inner.term(token).await
    }
}

/// Poll `check` every 10ms for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
