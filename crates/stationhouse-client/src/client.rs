//! Client façade.
//!
//! The [`Client`] owns the broker handle and everything shared between the
//! producers and consumers it creates: the schema cache and listener
//! registry, the prefetch cache, per-station flags and consumer-group
//! reference counts. Cloning a `Client` is cheap and every clone shares the
//! same state.
//!
//! ## Background work
//!
//! Nothing runs until asked for. [`Client::start`] starts the SDK-updates
//! listener; producers start schema listeners as they are created; consumers
//! start their loops through `start`/`consume`. [`Client::close`] cancels all
//! of it through one root [`CancellationToken`].

use crate::consumer::{Consumer, ConsumerOptions};
use crate::error::{ClientError, Result};
use crate::prefetch::PrefetchCache;
use crate::producer::{Producer, ProducerOptions};
use crate::protocol::{
    internal_name, sdk_update_types, subjects, Notification, SdkClientsUpdate,
};
use crate::retry::{retry_with_jittered_backoff, RetryPolicy};
use crate::schema::{SchemaCache, SchemaDefinition, SchemaType, SchemaValidator, ValidatorRegistry};
use crate::schema_listener::SchemaListenerRegistry;
use crate::station::{Station, StationOptions};
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use stationhouse_broker::{Broker, BrokerError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SDK_UPDATES_POLL: Duration = Duration::from_secs(1);

/// Settings fixed at build time.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub username: String,
    pub connection_id: String,
    /// Sent with every control-plane request.
    pub account_id: u32,
    /// Bound on a single control-plane request attempt.
    pub request_timeout: Duration,
    /// Applied to control-plane requests that time out.
    pub retry_policy: RetryPolicy,
    /// Capacity of each consumer event channel.
    pub event_channel_capacity: usize,
}

pub(crate) struct ClientInner {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) config: ClientConfig,
    pub(crate) schemas: Arc<SchemaCache>,
    pub(crate) validators: ValidatorRegistry,
    pub(crate) schema_listeners: SchemaListenerRegistry,
    pub(crate) prefetch: Arc<PrefetchCache>,
    pub(crate) shutdown: CancellationToken,
    schemaverse_to_dls: DashMap<String, bool>,
    send_notification: AtomicBool,
    consumer_groups: DashMap<(String, String), usize>,
    sdk_listener: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn apply_sdk_update(&self, update: SdkClientsUpdate) {
        let station = internal_name(&update.station_name);
        match update.update_type.as_str() {
            sdk_update_types::SEND_NOTIFICATION => {
                self.send_notification.store(update.update, Ordering::SeqCst);
            }
            sdk_update_types::SCHEMAVERSE_TO_DLS => {
                self.schemaverse_to_dls.insert(station, update.update);
            }
            sdk_update_types::REMOVE_STATION => self.remove_station_state(&station),
            other => debug!(update_type = %other, "Ignoring unknown SDK update"),
        }
    }

    fn remove_station_state(&self, station: &str) {
        self.schemas.remove(station);
        self.schemaverse_to_dls.remove(station);
        self.prefetch.remove_station(station);
        debug!(station = %station, "Cleared cached station state");
    }
}

/// Handle to a broker connection and its shared client state.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.config.connection_id
    }

    pub fn username(&self) -> &str {
        &self.inner.config.username
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    pub fn prefetch_cache(&self) -> &PrefetchCache {
        &self.inner.prefetch
    }

    pub fn schema_listeners(&self) -> &SchemaListenerRegistry {
        &self.inner.schema_listeners
    }

    /// The cached schema of a station, if one is attached.
    pub fn schema(&self, station: &str) -> Option<Arc<SchemaDefinition>> {
        self.inner.schemas.get(&internal_name(station))
    }

    pub fn is_send_notification_enabled(&self) -> bool {
        self.inner.send_notification.load(Ordering::SeqCst)
    }

    pub fn is_schemaverse_to_dls_enabled(&self, station: &str) -> bool {
        self.inner
            .schemaverse_to_dls
            .get(&internal_name(station))
            .map(|flag| *flag)
            .unwrap_or(false)
    }

    /// Live consumers of a (station, group) pair created through this client.
    pub fn consumer_group_refs(&self, station: &str, group: &str) -> usize {
        self.inner
            .consumer_groups
            .get(&(internal_name(station), internal_name(group)))
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Start the SDK-updates listener. Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        self.ensure_open()?;
        let mut slot = self.inner.sdk_listener.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let mut subscription = self
            .inner
            .broker
            .subscribe(subjects::SDK_CLIENTS_UPDATES)
            .await?;
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let cancel = self.inner.shutdown.child_token();

        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = subscription.next_timeout(SDK_UPDATES_POLL) => match next {
                        Ok(Some(delivery)) => {
                            let Some(inner) = weak.upgrade() else { break };
                            match serde_json::from_slice::<SdkClientsUpdate>(&delivery.payload) {
                                Ok(update) => inner.apply_sdk_update(update),
                                Err(e) => warn!(error = %e, "Malformed SDK update"),
                            }
                        }
                        Ok(None) => {
                            if weak.strong_count() == 0 {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "SDK updates subscription ended");
                            break;
                        }
                    }
                }
            }
            subscription.drain();
            debug!("SDK updates listener stopped");
        }));

        info!(connection_id = %self.connection_id(), "Client started");
        Ok(())
    }

    /// Cancel every background task owned by this client and the producers
    /// and consumers created from it.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.schema_listeners.shutdown().await;

        let handle = self.inner.sdk_listener.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "SDK updates listener ended abnormally");
            }
        }
        info!(connection_id = %self.connection_id(), "Client closed");
    }

    pub async fn create_station(&self, options: StationOptions) -> Result<Station> {
        self.ensure_open()?;
        Station::create(self.clone(), options).await
    }

    pub async fn create_producer(&self, options: ProducerOptions) -> Result<Producer> {
        self.ensure_open()?;
        Producer::create(self.clone(), options).await
    }

    pub async fn create_consumer(&self, options: ConsumerOptions) -> Result<Consumer> {
        self.ensure_open()?;
        Consumer::create(self.clone(), options).await
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Broker(BrokerError::ConnectionClosed));
        }
        Ok(())
    }

    /// Send a JSON control-plane request, retrying attempts that time out.
    pub(crate) async fn request<T: Serialize>(&self, subject: &str, body: &T) -> Result<Bytes> {
        self.ensure_open()?;
        let payload = Bytes::from(serde_json::to_vec(body)?);
        let timeout = self.inner.config.request_timeout;
        let broker = &self.inner.broker;

        let reply = retry_with_jittered_backoff(&self.inner.config.retry_policy, || {
            let payload = payload.clone();
            async move {
                match tokio::time::timeout(timeout, broker.request(subject, payload, timeout)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(BrokerError::Timeout(timeout)),
                }
            }
        })
        .await?;
        Ok(reply)
    }

    /// Check a payload against the station's cached schema.
    ///
    /// Stations without a schema, and schema types without a registered
    /// validator, accept everything.
    pub(crate) fn validate_payload(&self, station: &str, payload: &[u8]) -> Result<()> {
        let Some(schema) = self.inner.schemas.get(station) else {
            return Ok(());
        };
        let Some(validator) = self.inner.validators.get(schema.schema_type) else {
            debug!(
                station = %station,
                schema_type = %schema.schema_type,
                "No validator registered, skipping validation"
            );
            return Ok(());
        };
        validator
            .validate(&schema, payload)
            .map_err(|reason| ClientError::SchemaValidation {
                station: station.to_string(),
                reason,
            })
    }

    pub(crate) fn set_send_notification(&self, enabled: bool) {
        self.inner.send_notification.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn set_schemaverse_to_dls(&self, station: &str, enabled: bool) {
        self.inner
            .schemaverse_to_dls
            .insert(station.to_string(), enabled);
    }

    pub(crate) async fn send_notification(
        &self,
        title: &str,
        msg: &str,
        code: &str,
        notification_type: &str,
    ) -> Result<()> {
        let body = serde_json::to_vec(&Notification {
            title: title.to_string(),
            msg: msg.to_string(),
            notification_type: notification_type.to_string(),
            code: code.to_string(),
        })?;
        self.inner
            .broker
            .publish(subjects::NOTIFICATIONS, Bytes::from(body))
            .await?;
        Ok(())
    }

    pub(crate) fn acquire_consumer_group(&self, station: &str, group: &str) -> usize {
        let mut count = self
            .inner
            .consumer_groups
            .entry((station.to_string(), group.to_string()))
            .or_insert(0);
        *count += 1;
        *count
    }

    /// Release one consumer of the group. The group's prefetch entry is
    /// dropped with its last consumer.
    pub(crate) fn release_consumer_group(&self, station: &str, group: &str) -> usize {
        let key = (station.to_string(), group.to_string());
        let remaining = self
            .inner
            .consumer_groups
            .get_mut(&key)
            .map(|mut count| {
                *count = count.saturating_sub(1);
                *count
            })
            .unwrap_or(0);

        if remaining == 0 {
            self.inner.consumer_groups.remove_if(&key, |_, count| *count == 0);
            let dropped = self.inner.prefetch.remove(station, group);
            debug!(station = %station, group = %group, dropped, "Released consumer group");
        }
        remaining
    }

    pub(crate) fn remove_station_state(&self, station: &str) {
        self.inner.remove_station_state(station);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection_id", &self.inner.config.connection_id)
            .field("username", &self.inner.config.username)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builder for [`Client`].
///
/// ## Defaults
///
/// - `username`: `"root"`
/// - `connection_id`: random UUID v4
/// - `account_id`: 1
/// - `request_timeout`: 5s
/// - `request_retries`: 5 (timeouts only)
/// - `retry_backoff`: 100ms
/// - `event_channel_capacity`: 1024
/// - validators: JSON
///
/// ```ignore
/// let client = Client::builder()
///     .broker(Arc::new(broker))
///     .username("svc-orders")
///     .build()?;
/// client.start().await?;
/// ```
pub struct ClientBuilder {
    broker: Option<Arc<dyn Broker>>,
    username: String,
    connection_id: Option<String>,
    account_id: u32,
    request_timeout: Duration,
    request_retries: usize,
    retry_backoff: Duration,
    event_channel_capacity: usize,
    validators: ValidatorRegistry,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            broker: None,
            username: "root".to_string(),
            connection_id: None,
            account_id: 1,
            request_timeout: Duration::from_secs(5),
            request_retries: 5,
            retry_backoff: Duration::from_millis(100),
            event_channel_capacity: 1024,
            validators: ValidatorRegistry::new(),
        }
    }

    /// Set the broker transport (required).
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn account_id(mut self, account_id: u32) -> Self {
        self.account_id = account_id;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn request_retries(mut self, retries: usize) -> Self {
        self.request_retries = retries;
        self
    }

    /// Base backoff between timed-out control-plane attempts.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Register (or replace) the validator for a schema type.
    pub fn validator(mut self, schema_type: SchemaType, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validators.register(schema_type, validator);
        self
    }

    pub fn build(self) -> Result<Client> {
        let broker = self
            .broker
            .ok_or_else(|| ClientError::ConfigError("broker is required".to_string()))?;
        if self.request_timeout.is_zero() {
            return Err(ClientError::ConfigError(
                "request_timeout must be greater than zero".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(ClientError::ConfigError(
                "event_channel_capacity must be greater than zero".to_string(),
            ));
        }

        let config = ClientConfig {
            username: self.username,
            connection_id: self
                .connection_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            account_id: self.account_id,
            request_timeout: self.request_timeout,
            retry_policy: RetryPolicy {
                max_retries: self.request_retries,
                initial_backoff: self.retry_backoff,
                max_backoff: Duration::from_secs(5),
                backoff_multiplier: 2.0,
            },
            event_channel_capacity: self.event_channel_capacity,
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                broker,
                config,
                schemas: Arc::new(SchemaCache::new()),
                validators: self.validators,
                schema_listeners: SchemaListenerRegistry::new(),
                prefetch: Arc::new(PrefetchCache::new()),
                shutdown: CancellationToken::new(),
                schemaverse_to_dls: DashMap::new(),
                send_notification: AtomicBool::new(false),
                consumer_groups: DashMap::new(),
                sdk_listener: Mutex::new(None),
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
