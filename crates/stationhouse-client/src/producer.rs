//! Producer API for sending messages to StationHouse stations.
//!
//! A [`Producer`] is registered with the control plane once per target
//! station. Registration returns the station's partitions, its attached
//! schema (if any) and the per-partition function routing table; all three
//! are cached on the per-station producer and refreshed when the producer is
//! recreated.
//!
//! ## Publish protocol
//!
//! Every [`Producer::produce`] call runs the same steps per station:
//!
//! 1. Reject a partition key combined with a partition number, an empty
//!    message id, and caller headers that are blank or use the reserved
//!    `$memphis` prefix. Nothing is sent.
//! 2. Validate the payload against the station's cached schema. A rejected
//!    payload is copied to the schema dead-letter subject (when the station
//!    has that enabled), an operator notification is raised (when enabled),
//!    and the validation error is returned.
//! 3. Pick the partition: explicit number, then key hash, then round-robin.
//! 4. Build the subject (`<stream>.final`, or `<stream>.functions.<id>` when
//!    the partition feeds a function chain) and the headers (system headers
//!    first, then the message id, then caller headers).
//! 5. Publish. With `async_ack` the publish runs on a spawned task and the
//!    call returns at once. Otherwise the ack is awaited; if nothing received
//!    the publish the producer is recreated, which recreates the station, and
//!    the publish is retried exactly once.
//!
//! ## Examples
//!
//! ```ignore
//! let producer = client
//!     .create_producer(ProducerOptions::new("orders", "checkout"))
//!     .await?;
//!
//! producer
//!     .produce(
//!         Bytes::from_static(b"{\"id\":1}"),
//!         ProduceOptions::default()
//!             .partition_key("customer-42")
//!             .message_id("order-1")
//!             .async_ack(false),
//!     )
//!     .await?;
//!
//! producer.destroy().await?;
//! ```

use crate::client::Client;
use crate::error::{ClientError, Result};
use crate::protocol::{
    headers, hex_upper, internal_name, stream_name, subjects, versions, CreateProducerRequest,
    CreateProducerResponse, DestroyProducerRequest, DlsPayload, ProducerDetails,
    SchemaverseDlsMessage,
};
use crate::resolver::PartitionSet;
use crate::schema::SchemaDefinition;
use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use stationhouse_broker::{Headers, OutboundMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const PRODUCER_TYPE: &str = "application";
const SCHEMA_FAIL_TITLE: &str = "Schema validation has failed";
const SCHEMA_FAIL_TYPE: &str = "schema_validation_fail_alert";

/// Options for [`Client::create_producer`].
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    /// Target stations. More than one makes a fan-out producer.
    pub stations: Vec<String>,
    pub producer_name: String,
    /// Append `_` and 8 random alphanumerics to the producer name.
    pub generate_unique_suffix: bool,
}

impl ProducerOptions {
    pub fn new(station: impl Into<String>, producer_name: impl Into<String>) -> Self {
        Self {
            stations: vec![station.into()],
            producer_name: producer_name.into(),
            generate_unique_suffix: false,
        }
    }

    /// A producer that writes every message to each of `stations` in order.
    pub fn multi<I, S>(stations: I, producer_name: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stations: stations.into_iter().map(Into::into).collect(),
            producer_name: producer_name.into(),
            generate_unique_suffix: false,
        }
    }

    pub fn unique_suffix(mut self, enabled: bool) -> Self {
        self.generate_unique_suffix = enabled;
        self
    }
}

/// Per-call publish options.
///
/// ## Defaults
///
/// - `ack_wait`: 15s
/// - `async_ack`: `true` (return once the publish is dispatched)
/// - no message id, no partition selector, no headers
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    pub headers: Headers,
    pub ack_wait: Duration,
    /// Idempotency key sent as the `msg-id` header. `Some("")` is rejected.
    pub message_id: Option<String>,
    pub async_ack: bool,
    pub partition_key: Option<String>,
    pub partition_number: Option<u32>,
}

impl Default for ProduceOptions {
    fn default() -> Self {
        Self {
            headers: Headers::new(),
            ack_wait: Duration::from_secs(15),
            message_id: None,
            async_ack: true,
            partition_key: None,
            partition_number: None,
        }
    }
}

impl ProduceOptions {
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn async_ack(mut self, enabled: bool) -> Self {
        self.async_ack = enabled;
        self
    }

    pub fn partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn partition_number(mut self, partition: u32) -> Self {
        self.partition_number = Some(partition);
        self
    }

    /// Checks that need no station state. Run once before any fan-out.
    fn check(&self) -> Result<()> {
        let has_key = self
            .partition_key
            .as_deref()
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false);
        if has_key && self.partition_number.is_some() {
            return Err(ClientError::AmbiguousPartitionSelector);
        }
        if matches!(self.message_id.as_deref(), Some("")) {
            return Err(ClientError::EmptyMessageId);
        }
        validate_headers(&self.headers)
    }
}

fn validate_headers(caller: &Headers) -> Result<()> {
    for (key, _) in caller.iter() {
        if key.trim().is_empty() {
            return Err(ClientError::InvalidHeader(
                "header keys cannot be empty".to_string(),
            ));
        }
        if key.starts_with(headers::RESERVED_PREFIX) {
            return Err(ClientError::InvalidHeader(format!(
                "'{}' uses the reserved '{}' prefix",
                key,
                headers::RESERVED_PREFIX
            )));
        }
    }
    Ok(())
}

pub(crate) fn unique_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Routing state returned by producer registration.
#[derive(Debug)]
struct Routing {
    partitions: PartitionSet,
    /// Partition number to the id of the first function in its chain.
    first_functions: HashMap<u32, u64>,
}

impl Routing {
    fn from_response(response: &CreateProducerResponse) -> Self {
        let partitions = response
            .partitions_update
            .as_ref()
            .map(|update| update.partitions_list.clone())
            .unwrap_or_default();
        Self {
            partitions: PartitionSet::new(partitions),
            first_functions: response.station_partitions_first_functions.clone(),
        }
    }
}

/// A producer bound to a single station.
pub struct StationProducer {
    client: Client,
    station: String,
    internal_station: String,
    name: String,
    routing: RwLock<Arc<Routing>>,
    listener_attached: AtomicBool,
}

impl StationProducer {
    fn new(client: Client, station: &str, name: &str) -> Self {
        Self {
            client,
            station: station.to_string(),
            internal_station: internal_name(station),
            name: name.to_string(),
            routing: RwLock::new(Arc::new(Routing {
                partitions: PartitionSet::unpartitioned(),
                first_functions: HashMap::new(),
            })),
            listener_attached: AtomicBool::new(false),
        }
    }

    pub fn station(&self) -> &str {
        &self.station
    }

    pub fn internal_station(&self) -> &str {
        &self.internal_station
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Partitions the station reported at the last registration.
    pub fn partitions(&self) -> Vec<u32> {
        self.routing().partitions.partitions().to_vec()
    }

    fn routing(&self) -> Arc<Routing> {
        Arc::clone(
            &self
                .routing
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Register with the control plane and refresh the cached routing,
    /// station flags and schema.
    ///
    /// The schema listener is attached only when `attach_listener` is set
    /// and the station came back with a schema.
    async fn register(&self, attach_listener: bool) -> Result<()> {
        let request = CreateProducerRequest {
            name: self.name.clone(),
            station_name: self.station.clone(),
            connection_id: self.client.connection_id().to_string(),
            producer_type: PRODUCER_TYPE.to_string(),
            req_version: versions::PRODUCER_CREATE,
            username: self.client.username().to_string(),
            account_id: self.client.config().account_id,
        };

        let reply = self
            .client
            .request(subjects::PRODUCER_CREATIONS, &request)
            .await?;
        let response: CreateProducerResponse =
            serde_json::from_slice(&reply).unwrap_or_else(|_| CreateProducerResponse {
                error: String::from_utf8_lossy(&reply).into_owned(),
                ..Default::default()
            });
        if !response.error.is_empty() {
            return Err(ClientError::ControlPlane(response.error));
        }

        let routing = Routing::from_response(&response);
        debug!(
            station = %self.station,
            partitions = ?routing.partitions.partitions(),
            station_version = response.station_version,
            "Producer routing updated"
        );
        *self
            .routing
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(routing);

        self.client
            .set_schemaverse_to_dls(&self.internal_station, response.schemaverse_to_dls);
        self.client.set_send_notification(response.send_notification);

        let schema = match &response.schema_update {
            Some(init) => SchemaDefinition::from_init(init)?,
            None => None,
        };
        if let Some(schema) = schema {
            debug!(station = %self.station, schema = %schema.name, version = schema.version, "Schema attached");
            self.client.inner.schemas.insert(&self.internal_station, schema);

            if attach_listener && !self.listener_attached.swap(true, Ordering::SeqCst) {
                let inner = &self.client.inner;
                if let Err(e) = inner
                    .schema_listeners
                    .attach(&inner.broker, &inner.schemas, &self.internal_station, &inner.shutdown)
                    .await
                {
                    self.listener_attached.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Publish one message to this station. See the module docs for the
    /// protocol.
    pub async fn produce(&self, payload: Bytes, options: &ProduceOptions) -> Result<()> {
        options.check()?;

        if let Err(e) = self.client.validate_payload(&self.internal_station, &payload) {
            if let ClientError::SchemaValidation { reason, .. } = &e {
                self.report_schema_failure(&payload, &options.headers, reason)
                    .await;
            }
            return Err(e);
        }

        let message = self.build_message(payload.clone(), options)?;

        if options.async_ack {
            self.dispatch(message, options.ack_wait);
            return Ok(());
        }

        match self.publish_and_wait(message, options.ack_wait).await {
            Err(e) if e.is_no_responders() => {
                warn!(
                    station = %self.station,
                    producer = %self.name,
                    "No responders for publish, recreating producer and retrying once"
                );
                self.register(false).await?;
                let message = self.build_message(payload, options)?;
                self.publish_and_wait(message, options.ack_wait).await
            }
            other => other,
        }
    }

    fn build_message(&self, payload: Bytes, options: &ProduceOptions) -> Result<OutboundMessage> {
        let routing = self.routing();
        let partition = routing.partitions.select(
            &self.station,
            options.partition_key.as_deref(),
            options.partition_number,
        )?;

        let stream = stream_name(&self.internal_station, partition);
        let subject = match partition.and_then(|p| routing.first_functions.get(&p)) {
            Some(function_id) => format!("{}.functions.{}", stream, function_id),
            None => format!("{}.final", stream),
        };

        let mut message_headers = Headers::new();
        message_headers.insert(headers::PRODUCED_BY, self.name.as_str());
        message_headers.insert(headers::CONNECTION_ID, self.client.connection_id());
        if let Some(id) = &options.message_id {
            message_headers.insert(headers::MESSAGE_ID, id.as_str());
        }
        for (key, value) in options.headers.iter() {
            message_headers.insert(key, value);
        }

        debug!(station = %self.station, subject = %subject, partition = ?partition, "Routing message");
        Ok(OutboundMessage {
            subject,
            payload,
            headers: message_headers,
        })
    }

    async fn publish_and_wait(&self, message: OutboundMessage, ack_wait: Duration) -> Result<()> {
        let broker = &self.client.inner.broker;
        let ack = match tokio::time::timeout(ack_wait, broker.publish_to_stream(message, ack_wait)).await {
            Ok(result) => result?,
            Err(_) => return Err(stationhouse_broker::BrokerError::Timeout(ack_wait).into()),
        };
        if let Some(description) = ack.error {
            return Err(ClientError::PublishAck(description));
        }
        if ack.duplicate {
            debug!(station = %self.station, sequence = ack.sequence, "Duplicate message id");
        }
        Ok(())
    }

    /// Fire the publish on a background task; failures are only logged.
    fn dispatch(&self, message: OutboundMessage, ack_wait: Duration) {
        let broker = Arc::clone(&self.client.inner.broker);
        let station = self.station.clone();
        tokio::spawn(async move {
            let subject = message.subject.clone();
            match tokio::time::timeout(ack_wait, broker.publish_to_stream(message, ack_wait)).await {
                Ok(Ok(ack)) => {
                    if let Some(description) = ack.error {
                        warn!(station = %station, subject = %subject, error = %description, "Async publish rejected");
                    }
                }
                Ok(Err(e)) => {
                    warn!(station = %station, subject = %subject, error = %e, "Async publish failed");
                }
                Err(_) => {
                    warn!(station = %station, subject = %subject, ack_wait = ?ack_wait, "Async publish timed out");
                }
            }
        });
    }

    async fn report_schema_failure(&self, payload: &[u8], caller_headers: &Headers, reason: &str) {
        if self.client.is_schemaverse_to_dls_enabled(&self.internal_station) {
            let mut dls_headers: HashMap<String, String> = caller_headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            dls_headers.insert(
                headers::CONNECTION_ID.to_string(),
                self.client.connection_id().to_string(),
            );
            dls_headers.insert(headers::PRODUCED_BY.to_string(), self.name.clone());

            let body = SchemaverseDlsMessage {
                station_name: self.internal_station.clone(),
                producer: ProducerDetails {
                    name: self.name.clone(),
                    connection_id: self.client.connection_id().to_string(),
                },
                message: DlsPayload {
                    data: hex_upper(payload),
                    headers: dls_headers,
                },
                validation_error: reason.to_string(),
            };
            let published = match serde_json::to_vec(&body) {
                Ok(body) => self
                    .client
                    .inner
                    .broker
                    .publish(subjects::SCHEMAVERSE_DLS, Bytes::from(body))
                    .await
                    .map_err(ClientError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = published {
                warn!(station = %self.station, error = %e, "Failed to dead-letter rejected message");
            }
        }

        if self.client.is_send_notification_enabled() {
            let msg = format!(
                "Schema validation has failed for station {} and producer {}. Error: {}",
                self.internal_station, self.name, reason
            );
            let code = String::from_utf8_lossy(payload);
            if let Err(e) = self
                .client
                .send_notification(SCHEMA_FAIL_TITLE, &msg, &code, SCHEMA_FAIL_TYPE)
                .await
            {
                warn!(station = %self.station, error = %e, "Failed to send schema failure notification");
            }
        }
    }

    /// Deregister this producer and release its schema listener reference.
    pub async fn destroy(&self) -> Result<()> {
        let request = DestroyProducerRequest {
            name: self.name.clone(),
            station_name: self.station.clone(),
            username: self.client.username().to_string(),
            connection_id: self.client.connection_id().to_string(),
            req_version: versions::PRODUCER_DESTROY,
            account_id: self.client.config().account_id,
        };

        let reply = self
            .client
            .request(subjects::PRODUCER_DESTRUCTIONS, &request)
            .await
            .map_err(|e| ClientError::wrap_destroy_producer(&self.station, e))?;
        if !reply.is_empty() {
            return Err(ClientError::wrap_destroy_producer(
                &self.station,
                ClientError::ControlPlane(String::from_utf8_lossy(&reply).into_owned()),
            ));
        }

        if self.listener_attached.swap(false, Ordering::SeqCst) {
            self.client
                .inner
                .schema_listeners
                .detach(&self.internal_station)
                .await;
        }
        info!(station = %self.station, producer = %self.name, "Producer destroyed");
        Ok(())
    }
}

/// A producer dropped without [`StationProducer::destroy`] still releases its
/// schema listener reference. The control plane is not told.
impl Drop for StationProducer {
    fn drop(&mut self) {
        if !self.listener_attached.swap(false, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(station = %self.station, "No runtime, schema listener left attached");
            return;
        };
        let client = self.client.clone();
        let station = self.internal_station.clone();
        runtime.spawn(async move {
            let remaining = client.inner.schema_listeners.detach(&station).await;
            debug!(station = %station, remaining, "Dropped producer released schema listener");
        });
    }
}

impl std::fmt::Debug for StationProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StationProducer")
            .field("station", &self.station)
            .field("name", &self.name)
            .field("partitions", &self.partitions())
            .finish()
    }
}

/// Producer over one or more stations.
#[derive(Debug)]
pub struct Producer {
    name: String,
    targets: Vec<StationProducer>,
}

impl Producer {
    pub(crate) async fn create(client: Client, options: ProducerOptions) -> Result<Self> {
        let station_label = options.stations.join(",");
        if options.stations.is_empty() {
            return Err(ClientError::wrap_create_producer(
                &station_label,
                ClientError::ConfigError("at least one station is required".to_string()),
            ));
        }
        if options.producer_name.trim().is_empty() {
            return Err(ClientError::wrap_create_producer(
                &station_label,
                ClientError::ConfigError("producer name cannot be empty".to_string()),
            ));
        }

        let name = if options.generate_unique_suffix {
            format!("{}_{}", options.producer_name, unique_suffix())
        } else {
            options.producer_name.clone()
        };

        let mut targets: Vec<StationProducer> = Vec::with_capacity(options.stations.len());
        for station in &options.stations {
            let target = StationProducer::new(client.clone(), station, &name);
            if let Err(e) = target.register(true).await {
                for created in &targets {
                    if let Err(cleanup) = created.destroy().await {
                        warn!(station = %created.station, error = %cleanup, "Failed to roll back producer");
                    }
                }
                return Err(ClientError::wrap_create_producer(station, e));
            }
            info!(
                station = %station,
                producer = %name,
                partitions = target.routing().partitions.len(),
                "Producer created"
            );
            targets.push(target);
        }

        Ok(Self { name, targets })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stations(&self) -> Vec<&str> {
        self.targets.iter().map(StationProducer::station).collect()
    }

    pub fn targets(&self) -> &[StationProducer] {
        &self.targets
    }

    pub fn is_multi_station(&self) -> bool {
        self.targets.len() > 1
    }

    /// Publish `payload` to every target station in order.
    ///
    /// Stops at the first station that fails; stations before it keep the
    /// message.
    pub async fn produce(&self, payload: impl Into<Bytes>, options: ProduceOptions) -> Result<()> {
        options.check()?;
        let payload = payload.into();
        for target in &self.targets {
            target.produce(payload.clone(), &options).await?;
        }
        Ok(())
    }

    /// Serialize `value` as JSON and publish it.
    pub async fn produce_json<T: Serialize>(&self, value: &T, options: ProduceOptions) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.produce(payload, options).await
    }

    /// Destroy every per-station producer. Stops at the first failure.
    pub async fn destroy(&self) -> Result<()> {
        for target in &self.targets {
            target.destroy().await?;
        }
        Ok(())
    }
}
