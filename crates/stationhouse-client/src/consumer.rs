//! Consumer API for reading messages from StationHouse stations.
//!
//! A [`Consumer`] owns one durable-consumer context per station partition
//! (a single context at key 1 for unpartitioned stations) and serves reads
//! from three sources, in order:
//!
//! ```text
//!  fetch() ──► dead-letter buffer ──► prefetch cache ──► broker pull
//!                   ▲                       ▲
//!                   │ DLS loop              │ prefetch task
//!      $memphis_dls_<station>.<group>    broker pull
//! ```
//!
//! ## Background work
//!
//! Nothing runs at construction. [`Consumer::start`] starts the liveness
//! loop, which probes every context on `ping_interval` and marks contexts
//! whose consumer or stream is gone as unreachable. [`Consumer::consume`]
//! starts the poll loop and the DLS loop. Every loop stops on
//! [`Consumer::stop`], [`Consumer::destroy`], [`Client::close`] or the
//! caller's cancellation token.
//!
//! ## Events
//!
//! Poll results, poll errors and unreachable-station errors arrive on the
//! receiver returned by [`Consumer::message_events`]. DLS messages arrive on
//! [`Consumer::dls_events`] once that receiver has been taken; until then
//! they are parked in the dead-letter buffer and served by `fetch`.
//!
//! [`Client::close`]: crate::Client::close

use crate::client::Client;
use crate::dls::DeadLetterBuffer;
use crate::error::{ClientError, Result};
use crate::message::StationMessage;
use crate::protocol::{
    dls_subject, internal_name, stream_name, subjects, versions, CreateConsumerRequest,
    CreateConsumerResponse, DestroyConsumerRequest, DLS_PARTITION, MAX_BATCH_SIZE,
};
use crate::producer::unique_suffix;
use crate::resolver::PartitionSet;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CONSUMER_TYPE: &str = "application";

/// Context key used for stations without partitions.
const UNPARTITIONED_KEY: u32 = 1;

const MIN_BATCH_WAIT: Duration = Duration::from_secs(1);

/// Options for [`Client::create_consumer`].
///
/// ## Defaults
///
/// - `consumer_group`: the consumer name
/// - `batch_size`: 10
/// - `batch_max_time_to_wait`: 5s (anything below 1s is raised to 1s)
/// - `pull_interval`: 1s
/// - `max_ack_time`: 30s
/// - `max_msg_deliveries`: 2
/// - `start_consume_from_sequence`: 1
/// - `last_messages`: -1 (disabled)
/// - `ping_interval`: 30s
/// - `dls_buffer_capacity`: 10,000
///
/// [`Client::create_consumer`]: crate::Client::create_consumer
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub station: String,
    pub consumer_name: String,
    pub consumer_group: Option<String>,
    /// Append `_` and 8 random alphanumerics to the consumer name. The
    /// default group stays the unsuffixed name.
    pub generate_unique_suffix: bool,
    pub batch_size: usize,
    pub batch_max_time_to_wait: Duration,
    pub pull_interval: Duration,
    pub max_ack_time: Duration,
    pub max_msg_deliveries: u32,
    pub start_consume_from_sequence: u64,
    pub last_messages: i64,
    pub ping_interval: Duration,
    pub dls_buffer_capacity: usize,
}

impl ConsumerOptions {
    pub fn new(station: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        Self {
            station: station.into(),
            consumer_name: consumer_name.into(),
            consumer_group: None,
            generate_unique_suffix: false,
            batch_size: 10,
            batch_max_time_to_wait: Duration::from_secs(5),
            pull_interval: Duration::from_secs(1),
            max_ack_time: Duration::from_secs(30),
            max_msg_deliveries: 2,
            start_consume_from_sequence: 1,
            last_messages: -1,
            ping_interval: Duration::from_secs(30),
            dls_buffer_capacity: crate::dls::DEFAULT_DLS_BUFFER_CAPACITY,
        }
    }

    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    pub fn unique_suffix(mut self, enabled: bool) -> Self {
        self.generate_unique_suffix = enabled;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn batch_max_time_to_wait(mut self, wait: Duration) -> Self {
        self.batch_max_time_to_wait = wait;
        self
    }

    pub fn pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = interval;
        self
    }

    pub fn max_ack_time(mut self, max_ack_time: Duration) -> Self {
        self.max_ack_time = max_ack_time;
        self
    }

    pub fn max_msg_deliveries(mut self, deliveries: u32) -> Self {
        self.max_msg_deliveries = deliveries;
        self
    }

    pub fn start_consume_from_sequence(mut self, sequence: u64) -> Self {
        self.start_consume_from_sequence = sequence;
        self
    }

    pub fn last_messages(mut self, last_messages: i64) -> Self {
        self.last_messages = last_messages;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn dls_buffer_capacity(mut self, capacity: usize) -> Self {
        self.dls_buffer_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.station.trim().is_empty() {
            return Err(ClientError::InvalidConsumerOptions(
                "station name cannot be empty".to_string(),
            ));
        }
        if self.consumer_name.trim().is_empty() {
            return Err(ClientError::InvalidConsumerOptions(
                "consumer name cannot be empty".to_string(),
            ));
        }
        check_batch_size(self.batch_size)?;
        if self.start_consume_from_sequence == 0 {
            return Err(ClientError::InvalidConsumerOptions(
                "start_consume_from_sequence must be greater than 0".to_string(),
            ));
        }
        if self.last_messages < -1 {
            return Err(ClientError::InvalidConsumerOptions(
                "last_messages can not be less than -1".to_string(),
            ));
        }
        if self.start_consume_from_sequence > 1 && self.last_messages > -1 {
            return Err(ClientError::InvalidConsumerOptions(
                "start_consume_from_sequence and last_messages can not be set together"
                    .to_string(),
            ));
        }
        if self.pull_interval.is_zero() || self.ping_interval.is_zero() {
            return Err(ClientError::InvalidConsumerOptions(
                "pull_interval and ping_interval must be greater than zero".to_string(),
            ));
        }
        if self.dls_buffer_capacity == 0 {
            return Err(ClientError::InvalidConsumerOptions(
                "dls_buffer_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_batch_size(size: usize) -> Result<()> {
    if size == 0 || size > MAX_BATCH_SIZE {
        return Err(ClientError::InvalidBatchSize {
            size,
            max: MAX_BATCH_SIZE,
        });
    }
    Ok(())
}

/// Options for [`Consumer::fetch`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub batch_size: usize,
    /// Refill the prefetch cache in the background after this fetch.
    pub prefetch: bool,
    pub partition_key: Option<String>,
    pub partition_number: Option<u32>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            prefetch: false,
            partition_key: None,
            partition_number: None,
        }
    }
}

impl FetchOptions {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Default::default()
        }
    }

    pub fn prefetch(mut self, enabled: bool) -> Self {
        self.prefetch = enabled;
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
}

/// Partition selection for [`Consumer::consume`].
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub partition_key: Option<String>,
    pub partition_number: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Active,
    Stopped,
    Disposed,
}

impl ConsumerState {
    fn as_u8(self) -> u8 {
        match self {
            ConsumerState::Active => 0,
            ConsumerState::Stopped => 1,
            ConsumerState::Disposed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsumerState::Active,
            1 => ConsumerState::Stopped,
            _ => ConsumerState::Disposed,
        }
    }
}

/// The durable consumer behind one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionContext {
    pub stream: String,
    pub durable: String,
    pub partition: u32,
}

/// Delivered on the consumer's event channels.
///
/// Either `messages` is non-empty or `error` is set.
#[derive(Debug)]
pub struct ConsumerEvent {
    pub messages: Vec<StationMessage>,
    pub context: Option<PartitionContext>,
    pub error: Option<ClientError>,
}

impl ConsumerEvent {
    fn messages(messages: Vec<StationMessage>, context: Option<PartitionContext>) -> Self {
        Self {
            messages,
            context,
            error: None,
        }
    }

    fn failure(error: ClientError, context: Option<PartitionContext>) -> Self {
        Self {
            messages: Vec::new(),
            context,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

struct ContextSlot {
    context: PartitionContext,
    reachable: AtomicBool,
}

struct ConsumerInner {
    client: Client,
    name: String,
    group: String,
    station: String,
    internal_station: String,
    internal_group: String,
    options: ConsumerOptions,
    partitions: PartitionSet,
    contexts: BTreeMap<u32, ContextSlot>,
    state: AtomicU8,
    dls_buffer: DeadLetterBuffer,
    dls_listener: AtomicBool,
    /// Token of the live DLS loop; cancelled once that loop has exited.
    dls_loop: Mutex<Option<CancellationToken>>,
    liveness_running: AtomicBool,
    message_tx: mpsc::Sender<ConsumerEvent>,
    dls_tx: mpsc::Sender<ConsumerEvent>,
    message_rx: Mutex<Option<mpsc::Receiver<ConsumerEvent>>>,
    dls_rx: Mutex<Option<mpsc::Receiver<ConsumerEvent>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerInner {
    fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn is_active(&self) -> bool {
        self.state() == ConsumerState::Active
    }

    /// Move Active to Stopped; other states are left alone.
    fn mark_stopped(&self) -> bool {
        self.state
            .compare_exchange(
                ConsumerState::Active.as_u8(),
                ConsumerState::Stopped.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.state() == ConsumerState::Disposed {
            return Err(ClientError::ConsumerDisposed(self.name.clone()));
        }
        Ok(())
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn has_reachable_context(&self) -> bool {
        self.contexts
            .values()
            .any(|slot| slot.reachable.load(Ordering::SeqCst))
    }

    /// Pick the context for a read. Explicit number, then key, then
    /// round-robin; unpartitioned stations always use key 1.
    ///
    /// Round-robin skips unreachable contexts. An unreachable slot is only
    /// returned when it was named explicitly or nothing is reachable.
    fn resolve(&self, key: Option<&str>, number: Option<u32>) -> Result<&ContextSlot> {
        let explicit = number.is_some() || key.is_some_and(|k| !k.trim().is_empty());
        let attempts = if explicit { 1 } else { self.contexts.len().max(1) };

        let mut fallback = None;
        for _ in 0..attempts {
            let partition = self
                .partitions
                .select(&self.station, key, number)?
                .unwrap_or(UNPARTITIONED_KEY);
            let slot = self
                .contexts
                .get(&partition)
                .ok_or_else(|| ClientError::InvalidPartition {
                    partition,
                    station: self.station.clone(),
                })?;
            if slot.reachable.load(Ordering::SeqCst) {
                return Ok(slot);
            }
            if fallback.is_none() {
                fallback = Some(slot);
            }
        }
        fallback.ok_or_else(|| ClientError::StationUnreachable(self.station.clone()))
    }

    fn any_context(&self) -> Option<PartitionContext> {
        self.resolve(None, None).ok().map(|slot| slot.context.clone())
    }

    fn wrap(&self, delivery: stationhouse_broker::Delivery, partition: i32) -> StationMessage {
        StationMessage::new(
            delivery,
            Arc::clone(&self.client.inner.broker),
            &self.internal_station,
            &self.group,
            self.options.max_ack_time,
            partition,
        )
    }

    /// Bounded pull from one context.
    async fn pull(&self, slot: &ContextSlot, batch: usize) -> Result<Vec<StationMessage>> {
        if !slot.reachable.load(Ordering::SeqCst) {
            return Err(ClientError::StationUnreachable(self.station.clone()));
        }
        let context = &slot.context;
        let deliveries = self
            .client
            .inner
            .broker
            .fetch(
                &context.stream,
                &context.durable,
                batch,
                self.options.batch_max_time_to_wait,
            )
            .await?;
        debug!(
            station = %self.station,
            partition = context.partition,
            count = deliveries.len(),
            "Pulled messages"
        );
        Ok(deliveries
            .into_iter()
            .map(|delivery| self.wrap(delivery, context.partition as i32))
            .collect())
    }

    async fn fetch(self: &Arc<Self>, options: &FetchOptions) -> Result<Vec<StationMessage>> {
        self.ensure_not_disposed()?;
        check_batch_size(options.batch_size)?;
        let batch = options.batch_size;
        let slot = self.resolve(options.partition_key.as_deref(), options.partition_number)?;

        let mut messages = self.dls_buffer.drain(batch);
        if messages.len() == batch {
            return Ok(messages);
        }

        let prefetched = self.client.inner.prefetch.take(
            &self.internal_station,
            &self.internal_group,
            batch - messages.len(),
        );
        messages.extend(prefetched);

        if options.prefetch {
            self.spawn_prefetch(slot.context.partition, batch);
        }

        if !messages.is_empty() {
            return Ok(messages);
        }
        self.pull(slot, batch).await
    }

    fn spawn_prefetch(self: &Arc<Self>, partition: u32, batch: usize) {
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let Some(slot) = inner.contexts.get(&partition) else {
                return;
            };
            tokio::select! {
                _ = inner.cancel.cancelled() => {}
                result = inner.pull(slot, batch) => match result {
                    Ok(messages) => {
                        let count = messages.len();
                        inner.client.inner.prefetch.extend(
                            &inner.internal_station,
                            &inner.internal_group,
                            messages,
                        );
                        debug!(station = %inner.station, partition, count, "Prefetched messages");
                    }
                    Err(e) => warn!(station = %inner.station, partition, error = %e, "Prefetch failed"),
                }
            }
        });
        self.track(handle);
    }

    async fn poll_once(&self, options: &ConsumeOptions) {
        let slot = match self.resolve(options.partition_key.as_deref(), options.partition_number) {
            Ok(slot) => slot,
            Err(e) => {
                self.emit(&self.message_tx, ConsumerEvent::failure(e, None)).await;
                return;
            }
        };
        if !slot.reachable.load(Ordering::SeqCst) {
            return;
        }

        match self.pull(slot, self.options.batch_size).await {
            Ok(messages) if messages.is_empty() => {}
            Ok(messages) => {
                let event = ConsumerEvent::messages(messages, Some(slot.context.clone()));
                self.emit(&self.message_tx, event).await;
            }
            Err(e) => {
                error!(
                    station = %self.station,
                    partition = slot.context.partition,
                    error = %e,
                    "Poll failed"
                );
                let event = ConsumerEvent::failure(e, Some(slot.context.clone()));
                self.emit(&self.message_tx, event).await;
            }
        }
    }

    async fn emit(&self, channel: &mpsc::Sender<ConsumerEvent>, event: ConsumerEvent) {
        if channel.send(event).await.is_err() {
            debug!(station = %self.station, "Event receiver dropped");
        }
    }

    async fn run_poll_loop(self: Arc<Self>, options: ConsumeOptions, caller: CancellationToken) {
        debug!(station = %self.station, consumer = %self.name, "Poll loop started");
        loop {
            if !self.is_active() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = caller.cancelled() => break,
                _ = self.poll_once(&options) => {}
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = caller.cancelled() => break,
                _ = tokio::time::sleep(self.options.pull_interval) => {}
            }
        }
        debug!(station = %self.station, consumer = %self.name, "Poll loop stopped");
    }

    async fn run_dls_loop(self: Arc<Self>, token: CancellationToken) {
        let subject = dls_subject(&self.internal_station, &self.internal_group);
        let mut subscription = match self.client.inner.broker.subscribe(&subject).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(station = %self.station, subject = %subject, error = %e, "DLS subscription failed");
                let event = ConsumerEvent::failure(e.into(), self.any_context());
                self.emit(&self.dls_tx, event).await;
                token.cancel();
                return;
            }
        };
        debug!(station = %self.station, subject = %subject, "DLS loop started");

        loop {
            if !self.is_active() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = token.cancelled() => break,
                next = subscription.next_timeout(self.options.pull_interval) => match next {
                    Ok(Some(delivery)) => {
                        let message = self.wrap(delivery, DLS_PARTITION);
                        if self.dls_listener.load(Ordering::SeqCst) {
                            let event = ConsumerEvent::messages(vec![message], self.any_context());
                            self.emit(&self.dls_tx, event).await;
                        } else {
                            self.dls_buffer.push(message);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(station = %self.station, error = %e, "DLS subscription ended");
                        let event = ConsumerEvent::failure(e.into(), self.any_context());
                        self.emit(&self.dls_tx, event).await;
                        break;
                    }
                }
            }
        }

        for delivery in subscription.drain() {
            self.dls_buffer.push(self.wrap(delivery, DLS_PARTITION));
        }
        token.cancel();
        debug!(station = %self.station, subject = %subject, "DLS loop stopped");
    }

    async fn probe(&self, slot: &ContextSlot) {
        let context = &slot.context;
        let timeout = self.client.config().request_timeout;
        let probe = self
            .client
            .inner
            .broker
            .consumer_info(&context.stream, &context.durable);

        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.is_not_found() => {
                if !slot.reachable.swap(false, Ordering::SeqCst) {
                    return;
                }
                warn!(
                    station = %self.station,
                    partition = context.partition,
                    error = %e,
                    "Consumer context unreachable"
                );
                let event = ConsumerEvent::failure(
                    ClientError::StationUnreachable(self.station.clone()),
                    Some(context.clone()),
                );
                self.emit(&self.message_tx, event).await;

                if !self.has_reachable_context() && self.mark_stopped() {
                    info!(station = %self.station, consumer = %self.name, "No reachable partitions left, consumer stopped");
                }
            }
            Ok(Err(e)) => {
                debug!(station = %self.station, partition = context.partition, error = %e, "Liveness probe failed");
            }
            Err(_) => {
                debug!(station = %self.station, partition = context.partition, "Liveness probe timed out");
            }
        }
    }

    async fn run_liveness_loop(self: Arc<Self>) {
        debug!(station = %self.station, consumer = %self.name, "Liveness loop started");
        loop {
            for slot in self.contexts.values() {
                if !slot.reachable.load(Ordering::SeqCst) {
                    continue;
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = self.probe(slot) => {}
                }
            }
            if !self.has_reachable_context() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.ping_interval) => {}
            }
        }
        debug!(station = %self.station, consumer = %self.name, "Liveness loop stopped");
    }
}

/// A consumer of one station on behalf of a consumer group.
///
/// ## Example
///
/// ```ignore
/// let consumer = client
///     .create_consumer(ConsumerOptions::new("orders", "billing-1").consumer_group("billing"))
///     .await?;
/// consumer.start()?;
///
/// for message in consumer.fetch(FetchOptions::new(50).prefetch(true)).await? {
///     handle(message.payload());
///     message.ack().await?;
/// }
///
/// consumer.destroy().await?;
/// ```
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    pub(crate) async fn create(client: Client, options: ConsumerOptions) -> Result<Self> {
        let station = options.station.clone();
        let wrap = |e: ClientError| ClientError::wrap_create_consumer(&station, e);
        options.validate().map_err(wrap)?;

        let mut options = options;
        if options.batch_max_time_to_wait < MIN_BATCH_WAIT {
            options.batch_max_time_to_wait = MIN_BATCH_WAIT;
        }
        let group = options
            .consumer_group
            .clone()
            .filter(|g| !g.trim().is_empty())
            .unwrap_or_else(|| options.consumer_name.clone());
        let name = if options.generate_unique_suffix {
            format!("{}_{}", options.consumer_name, unique_suffix())
        } else {
            options.consumer_name.clone()
        };

        let request = CreateConsumerRequest {
            name: name.clone(),
            station_name: station.clone(),
            connection_id: client.connection_id().to_string(),
            consumer_type: CONSUMER_TYPE.to_string(),
            consumers_group: group.clone(),
            max_ack_time_ms: options.max_ack_time.as_millis() as u64,
            max_msg_deliveries: options.max_msg_deliveries,
            start_consume_from_sequence: options.start_consume_from_sequence,
            last_messages: options.last_messages,
            req_version: versions::CONSUMER_CREATE,
            username: client.username().to_string(),
            account_id: client.config().account_id,
        };
        let reply = client
            .request(subjects::CONSUMER_CREATIONS, &request)
            .await
            .map_err(wrap)?;
        let response = CreateConsumerResponse::parse(&reply);
        if !response.error.is_empty() {
            return Err(wrap(ClientError::ControlPlane(response.error)));
        }

        let partitions = response
            .partitions_update
            .map(|update| update.partitions_list)
            .unwrap_or_default();
        let internal_station = internal_name(&station);
        let internal_group = internal_name(&group);

        let mut contexts = BTreeMap::new();
        if partitions.is_empty() {
            contexts.insert(
                UNPARTITIONED_KEY,
                slot(stream_name(&internal_station, None), &internal_group, UNPARTITIONED_KEY),
            );
        }
        for &partition in &partitions {
            contexts.insert(
                partition,
                slot(stream_name(&internal_station, Some(partition)), &internal_group, partition),
            );
        }

        let capacity = client.config().event_channel_capacity;
        let (message_tx, message_rx) = mpsc::channel(capacity);
        let (dls_tx, dls_rx) = mpsc::channel(capacity);
        let cancel = client.inner.shutdown.child_token();
        let refs = client.acquire_consumer_group(&internal_station, &internal_group);

        info!(
            station = %station,
            consumer = %name,
            group = %group,
            partitions = ?partitions,
            group_refs = refs,
            "Consumer created"
        );

        Ok(Self {
            inner: Arc::new(ConsumerInner {
                dls_buffer: DeadLetterBuffer::new(options.dls_buffer_capacity),
                client,
                name,
                group,
                station,
                internal_station,
                internal_group,
                options,
                partitions: PartitionSet::new(partitions),
                contexts,
                state: AtomicU8::new(ConsumerState::Active.as_u8()),
                dls_listener: AtomicBool::new(false),
                dls_loop: Mutex::new(None),
                liveness_running: AtomicBool::new(false),
                message_tx,
                dls_tx,
                message_rx: Mutex::new(Some(message_rx)),
                dls_rx: Mutex::new(Some(dls_rx)),
                cancel,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn consumer_group(&self) -> &str {
        &self.inner.group
    }

    pub fn station(&self) -> &str {
        &self.inner.station
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ConsumerState {
        self.inner.state()
    }

    pub fn partitions(&self) -> &[u32] {
        self.inner.partitions.partitions()
    }

    pub fn contexts(&self) -> Vec<PartitionContext> {
        self.inner
            .contexts
            .values()
            .map(|slot| slot.context.clone())
            .collect()
    }

    /// False once a liveness probe found the partition's consumer or stream
    /// gone. Unknown partitions are reported unreachable.
    pub fn is_reachable(&self, partition: u32) -> bool {
        self.inner
            .contexts
            .get(&partition)
            .map(|slot| slot.reachable.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Messages parked in the dead-letter buffer.
    pub fn dls_buffered(&self) -> usize {
        self.inner.dls_buffer.len()
    }

    /// Take the receiver for poll results and liveness errors. Returns
    /// `None` after the first call.
    pub fn message_events(&self) -> Option<mpsc::Receiver<ConsumerEvent>> {
        self.inner
            .message_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    /// Take the receiver for DLS messages. From then on DLS messages are
    /// delivered here instead of being parked in the dead-letter buffer.
    pub fn dls_events(&self) -> Option<mpsc::Receiver<ConsumerEvent>> {
        let receiver = self
            .inner
            .dls_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if receiver.is_some() {
            self.inner.dls_listener.store(true, Ordering::SeqCst);
        }
        receiver
    }

    /// Read up to `batch_size` messages.
    ///
    /// The dead-letter buffer is drained first; if it fills the batch the
    /// broker is not touched. The prefetch cache fills the remainder. A
    /// direct pull, bounded by `batch_max_time_to_wait`, happens only when
    /// both were empty.
    pub async fn fetch(&self, options: FetchOptions) -> Result<Vec<StationMessage>> {
        self.inner.fetch(&options).await
    }

    /// Shorthand for [`fetch`](Self::fetch) with round-robin partitions.
    pub async fn fetch_batch(&self, batch_size: usize, prefetch: bool) -> Result<Vec<StationMessage>> {
        self.fetch(FetchOptions::new(batch_size).prefetch(prefetch)).await
    }

    /// Start the liveness loop. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        self.inner.ensure_not_disposed()?;
        if self.inner.liveness_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let handle = tokio::spawn(Arc::clone(&self.inner).run_liveness_loop());
        self.inner.track(handle);
        Ok(())
    }

    /// Start the poll loop and, if it is not already running, the DLS loop.
    ///
    /// Both loops end when `cancel` fires, the consumer stops or is
    /// destroyed, or the client closes. Partition selector misuse is
    /// reported here rather than on every poll.
    pub fn consume(&self, options: ConsumeOptions, cancel: CancellationToken) -> Result<()> {
        self.inner.ensure_not_disposed()?;
        if !self.inner.is_active() {
            return Err(ClientError::ConsumerStopped(self.inner.name.clone()));
        }
        self.inner
            .resolve(options.partition_key.as_deref(), options.partition_number)?;

        let poll = tokio::spawn(Arc::clone(&self.inner).run_poll_loop(options, cancel.clone()));
        self.inner.track(poll);

        {
            let mut dls_loop = self.inner.dls_loop.lock().unwrap_or_else(|p| p.into_inner());
            if dls_loop.as_ref().map_or(true, CancellationToken::is_cancelled) {
                let token = cancel.child_token();
                *dls_loop = Some(token.clone());
                let dls = tokio::spawn(Arc::clone(&self.inner).run_dls_loop(token));
                self.inner.track(dls);
            }
        }
        info!(station = %self.inner.station, consumer = %self.inner.name, "Consuming");
        Ok(())
    }

    /// Stop the poll and DLS loops. Fetch keeps working.
    pub fn stop(&self) {
        if self.inner.mark_stopped() {
            info!(station = %self.inner.station, consumer = %self.inner.name, "Consumer stopped");
        }
    }

    /// Stop every loop, deregister the consumer and release its group.
    ///
    /// Cancellation is not reverted if the deregistration fails.
    pub async fn destroy(&self) -> Result<()> {
        let inner = &self.inner;
        let wrap = |e: ClientError| ClientError::wrap_destroy_consumer(&inner.station, e);

        let previous = inner
            .state
            .swap(ConsumerState::Disposed.as_u8(), Ordering::SeqCst);
        if ConsumerState::from_u8(previous) == ConsumerState::Disposed {
            return Err(wrap(ClientError::ConsumerDisposed(inner.name.clone())));
        }

        inner.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = inner.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.drain(..).collect()
        };
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(station = %inner.station, error = %e, "Consumer task ended abnormally");
            }
        }

        let request = DestroyConsumerRequest {
            name: inner.name.clone(),
            station_name: inner.station.clone(),
            username: inner.client.username().to_string(),
            connection_id: inner.client.connection_id().to_string(),
            req_version: versions::CONSUMER_DESTROY,
            account_id: inner.client.config().account_id,
        };
        let reply = inner
            .client
            .request(subjects::CONSUMER_DESTRUCTIONS, &request)
            .await;
        inner
            .client
            .release_consumer_group(&inner.internal_station, &inner.internal_group);

        let reply = reply.map_err(wrap)?;
        if !reply.is_empty() {
            return Err(wrap(ClientError::ControlPlane(
                String::from_utf8_lossy(&reply).into_owned(),
            )));
        }
        info!(station = %inner.station, consumer = %inner.name, "Consumer destroyed");
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.inner.name)
            .field("group", &self.inner.group)
            .field("station", &self.inner.station)
            .field("partitions", &self.inner.partitions.partitions())
            .field("state", &self.inner.state())
            .finish()
    }
}

fn slot(stream: String, durable: &str, partition: u32) -> ContextSlot {
    ContextSlot {
        context: PartitionContext {
            stream,
            durable: durable.to_string(),
            partition,
        },
        reachable: AtomicBool::new(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use stationhouse_broker::{Broker, BrokerError, Headers, InMemoryBroker, OutboundMessage};

    /// Control plane that creates the backing streams and durables for
    /// `partitions` (or the bare station stream when empty).
    fn control_plane(memory: &InMemoryBroker, partitions: Vec<u32>) {
        memory.register_responder(subjects::CONSUMER_CREATIONS, move |broker, payload| {
            let request: CreateConsumerRequest = serde_json::from_slice(&payload)
                .map_err(|e| BrokerError::Internal(e.to_string()))?;
            let station = internal_name(&request.station_name);
            let durable = internal_name(&request.consumers_group);
            let streams: Vec<String> = if partitions.is_empty() {
                vec![station]
            } else {
                partitions
                    .iter()
                    .map(|p| stream_name(&station, Some(*p)))
                    .collect()
            };
            for stream in streams {
                broker.add_stream(stream.clone());
                broker.add_consumer(&stream, durable.clone())?;
            }
            if partitions.is_empty() {
                return Ok(Bytes::new());
            }
            Ok(Bytes::from(format!(
                r#"{{"error":"","partitions_update":{{"partitions_list":{:?}}}}}"#,
                partitions
            )))
        });
        memory.register_responder(subjects::CONSUMER_DESTRUCTIONS, |_, _| Ok(Bytes::new()));
    }

    fn client_on(memory: &InMemoryBroker) -> Client {
        Client::builder()
            .broker(Arc::new(memory.clone()))
            .build()
            .unwrap()
    }

    async fn store(memory: &InMemoryBroker, stream: &str, count: usize) {
        for i in 0..count {
            memory
                .publish_to_stream(
                    OutboundMessage {
                        subject: format!("{}.final", stream),
                        payload: Bytes::from(format!("m{}", i)),
                        headers: Headers::new(),
                    },
                    Duration::from_secs(1),
                )
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_option_validation() {
        let base = ConsumerOptions::new("orders", "c1");
        assert!(base.validate().is_ok());

        assert!(matches!(
            base.clone().start_consume_from_sequence(0).validate(),
            Err(ClientError::InvalidConsumerOptions(_))
        ));
        assert!(base.clone().last_messages(-2).validate().is_err());
        assert!(base
            .clone()
            .start_consume_from_sequence(5)
            .last_messages(3)
            .validate()
            .is_err());
        assert!(base
            .clone()
            .start_consume_from_sequence(5)
            .last_messages(-1)
            .validate()
            .is_ok());
        assert!(matches!(
            base.clone().batch_size(0).validate(),
            Err(ClientError::InvalidBatchSize { .. })
        ));
        assert!(base.clone().batch_size(MAX_BATCH_SIZE + 1).validate().is_err());
    }

    #[tokio::test]
    async fn test_unpartitioned_context_uses_key_one() {
        let memory = InMemoryBroker::new();
        control_plane(&memory, vec![]);
        let consumer = client_on(&memory)
            .create_consumer(ConsumerOptions::new("Orders", "c1").consumer_group("Billing"))
            .await
            .unwrap();

        assert_eq!(
            consumer.contexts(),
            vec![PartitionContext {
                stream: "orders".into(),
                durable: "billing".into(),
                partition: 1,
            }]
        );
        assert!(consumer.is_reachable(1));
        assert_eq!(consumer.options().batch_max_time_to_wait, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_batch_wait_is_clamped() {
        let memory = InMemoryBroker::new();
        control_plane(&memory, vec![]);
        let consumer = client_on(&memory)
            .create_consumer(
                ConsumerOptions::new("orders", "c1").batch_max_time_to_wait(Duration::from_millis(10)),
            )
            .await
            .unwrap();
        assert_eq!(consumer.options().batch_max_time_to_wait, MIN_BATCH_WAIT);
    }

    #[tokio::test]
    async fn test_fetch_pulls_from_broker() {
        let memory = InMemoryBroker::new();
        control_plane(&memory, vec![]);
        let consumer = client_on(&memory)
            .create_consumer(ConsumerOptions::new("orders", "c1"))
            .await
            .unwrap();
        store(&memory, "orders", 3).await;

        let messages = consumer.fetch_batch(2, false).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].partition(), 1);
        assert_eq!(messages[0].consumer_group(), "c1");
        messages[0].ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_rejects_bad_batch_and_selectors() {
        let memory = InMemoryBroker::new();
        control_plane(&memory, vec![1, 2]);
        let consumer = client_on(&memory)
            .create_consumer(ConsumerOptions::new("orders", "c1"))
            .await
            .unwrap();

        assert!(matches!(
            consumer.fetch(FetchOptions::new(0)).await,
            Err(ClientError::InvalidBatchSize { size: 0, .. })
        ));
        assert!(matches!(
            consumer.fetch(FetchOptions::new(MAX_BATCH_SIZE + 1)).await,
            Err(ClientError::InvalidBatchSize { .. })
        ));
        assert!(matches!(
            consumer
                .fetch(FetchOptions::new(1).partition_key("k").partition_number(1))
                .await,
            Err(ClientError::AmbiguousPartitionSelector)
        ));
        assert!(matches!(
            consumer.fetch(FetchOptions::new(1).partition_number(3)).await,
            Err(ClientError::InvalidPartition { partition: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_prefetch_serves_next_fetch() {
        let memory = InMemoryBroker::new();
        control_plane(&memory, vec![]);
        let client = client_on(&memory);
        let consumer = client
            .create_consumer(ConsumerOptions::new("orders", "c1"))
            .await
            .unwrap();
        store(&memory, "orders", 4).await;

        let first = consumer.fetch(FetchOptions::new(2).prefetch(true)).await.unwrap();
        assert_eq!(first.len(), 2);

        let mut parked = 0;
        for _ in 0..100 {
            parked = client.prefetch_cache().len("orders", "c1");
            if parked == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(parked, 2);

        let second = consumer.fetch(FetchOptions::new(5)).await.unwrap();
        let payloads: Vec<&[u8]> = second.iter().map(|m| m.payload().as_ref()).collect();
        assert_eq!(payloads, vec![b"m2".as_ref(), b"m3".as_ref()]);
    }

    #[tokio::test]
    async fn test_dls_messages_are_buffered_then_fetched() {
        let memory = InMemoryBroker::new();
        control_plane(&memory, vec![]);
        let consumer = client_on(&memory)
            .create_consumer(ConsumerOptions::new("orders", "c1").pull_interval(Duration::from_millis(20)))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        consumer.consume(ConsumeOptions::default(), cancel.clone()).unwrap();

        // Give the DLS loop time to subscribe.
        tokio::time::sleep(Duration::from_millis(50)).await;
        memory
            .publish("$memphis_dls_orders.c1", Bytes::from_static(b"dead"))
            .await
            .unwrap();

        let mut buffered = 0;
        for _ in 0..100 {
            buffered = consumer.dls_buffered();
            if buffered == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(buffered, 1);

        let messages = consumer.fetch_batch(1, false).await.unwrap();
        assert!(messages[0].is_from_dls());
        cancel.cancel();
        consumer.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_is_terminal() {
        let memory = InMemoryBroker::new();
        control_plane(&memory, vec![]);
        let client = client_on(&memory);
        let consumer = client
            .create_consumer(ConsumerOptions::new("orders", "c1"))
            .await
            .unwrap();
        consumer.start().unwrap();
        assert_eq!(client.consumer_group_refs("orders", "c1"), 1);

        consumer.destroy().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Disposed);
        assert_eq!(client.consumer_group_refs("orders", "c1"), 0);
        assert!(matches!(
            consumer.fetch_batch(1, false).await,
            Err(ClientError::ConsumerDisposed(_))
        ));
        assert!(matches!(
            consumer.destroy().await,
            Err(ClientError::DestroyConsumer { .. })
        ));
    }

    #[tokio::test]
    async fn test_consume_after_stop_is_rejected() {
        let memory = InMemoryBroker::new();
        control_plane(&memory, vec![]);
        let consumer = client_on(&memory)
            .create_consumer(ConsumerOptions::new("orders", "c1"))
            .await
            .unwrap();

        consumer.stop();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert!(matches!(
            consumer.consume(ConsumeOptions::default(), CancellationToken::new()),
            Err(ClientError::ConsumerStopped(_))
        ));
    }
}
