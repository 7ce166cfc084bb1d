//! Error types for StationHouse client operations.
//!
//! Errors are grouped by how the caller is expected to react to them.
//!
//! ## Error Handling Strategy
//!
//! - **Caller misuse** (rejected before any I/O): `AmbiguousPartitionSelector`,
//!   `EmptyMessageId`, `InvalidBatchSize`, `InvalidPartition`, `InvalidHeader`,
//!   `InvalidConsumerOptions`, `ConfigError`
//! - **Validation**: `SchemaValidation`, `UnsupportedSchemaType`
//! - **Broker**: `Broker`, `PublishAck`, `ControlPlane`
//! - **Liveness**: `StationUnreachable` (delivered through consumer events)
//! - **Lifecycle**: `CreateProducer`, `CreateConsumer`, `CreateStation`,
//!   `DestroyProducer`, `DestroyConsumer`, `DestroyStation` wrap the
//!   underlying cause, which stays reachable through `source()`
//!
//! ## Examples
//!
//! ```ignore
//! use stationhouse_client::ClientError;
//!
//! match producer.produce(payload, ProduceOptions::default()).await {
//!     Ok(()) => {}
//!     Err(ClientError::SchemaValidation { station, reason }) => {
//!         eprintln!("rejected by schema on {}: {}", station, reason);
//!     }
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use stationhouse_broker::BrokerError;
use thiserror::Error;

/// Convenience type alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Both a partition key and a partition number were supplied.
    #[error("PartitionKey and PartitionNumber can not be set at the same time")]
    AmbiguousPartitionSelector,

    /// A message id was supplied but is the empty string.
    #[error("Message ID cannot be empty")]
    EmptyMessageId,

    /// Batch size outside `1..=max`.
    #[error("Batch size {size} is out of range (must be between 1 and {max})")]
    InvalidBatchSize { size: usize, max: usize },

    /// Explicit partition number that the station does not have.
    #[error("Partition {partition} does not exist for station '{station}'")]
    InvalidPartition { partition: u32, station: String },

    /// Caller header with an empty key or a reserved prefix.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid consumer options: {0}")]
    InvalidConsumerOptions(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Payload rejected by the station's schema.
    ///
    /// The message was dead-lettered (when enabled for the station) and never
    /// reached the station itself.
    #[error("Schema validation has failed for station '{station}': {reason}")]
    SchemaValidation { station: String, reason: String },

    #[error("Unsupported schema type '{0}', the supported schema types are: json, graphql, protobuf, avro")]
    UnsupportedSchemaType(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The broker stored nothing and reported this description instead.
    #[error("Publish was not acknowledged: {0}")]
    PublishAck(String),

    /// The control plane answered a request with an error.
    #[error("Control plane error: {0}")]
    ControlPlane(String),

    /// The durable consumer or its backing stream no longer exists.
    #[error("Station unreachable: {0}")]
    StationUnreachable(String),

    #[error("Failed to create producer for station '{station}'")]
    CreateProducer {
        station: String,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Failed to create consumer for station '{station}'")]
    CreateConsumer {
        station: String,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Failed to create station '{station}'")]
    CreateStation {
        station: String,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Failed to destroy producer on station '{station}'")]
    DestroyProducer {
        station: String,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Failed to destroy consumer on station '{station}'")]
    DestroyConsumer {
        station: String,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Failed to destroy station '{station}'")]
    DestroyStation {
        station: String,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Unable to ack message")]
    Ack(#[source] BrokerError),

    #[error("Unable to nack message")]
    Nack(#[source] BrokerError),

    #[error("Unable to dead letter message")]
    DeadLetter(#[source] BrokerError),

    #[error("Unable to delay DLS message")]
    CannotDelayDlsMessage,

    #[error("Unable to add subscription of schema updates for station '{station}'")]
    SchemaUpdateSubscriptionFailed {
        station: String,
        #[source]
        source: BrokerError,
    },

    #[error("Consumer '{0}' has been destroyed")]
    ConsumerDisposed(String),

    /// Stopped explicitly or because none of its partitions is reachable.
    #[error("Consumer '{0}' is stopped")]
    ConsumerStopped(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// True for errors raised before any I/O because the call itself was
    /// malformed.
    pub fn is_caller_misuse(&self) -> bool {
        matches!(
            self,
            ClientError::AmbiguousPartitionSelector
                | ClientError::EmptyMessageId
                | ClientError::InvalidBatchSize { .. }
                | ClientError::InvalidPartition { .. }
                | ClientError::InvalidHeader(_)
                | ClientError::InvalidConsumerOptions(_)
                | ClientError::ConfigError(_)
        )
    }

    /// True when the broker reported that nothing received a publish, which
    /// means the target station or its stream is missing.
    pub fn is_no_responders(&self) -> bool {
        matches!(self, ClientError::Broker(e) if e.is_no_responders())
    }

    pub(crate) fn wrap_create_producer(station: &str, source: ClientError) -> Self {
        ClientError::CreateProducer {
            station: station.to_string(),
            source: Box::new(source),
        }
    }

    pub(crate) fn wrap_create_consumer(station: &str, source: ClientError) -> Self {
        ClientError::CreateConsumer {
            station: station.to_string(),
            source: Box::new(source),
        }
    }

    pub(crate) fn wrap_destroy_producer(station: &str, source: ClientError) -> Self {
        ClientError::DestroyProducer {
            station: station.to_string(),
            source: Box::new(source),
        }
    }

    pub(crate) fn wrap_destroy_consumer(station: &str, source: ClientError) -> Self {
        ClientError::DestroyConsumer {
            station: station.to_string(),
            source: Box::new(source),
        }
    }
}
