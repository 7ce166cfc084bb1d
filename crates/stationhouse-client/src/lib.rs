//! StationHouse Client - Producer and Consumer APIs
//!
//! This crate provides producers and consumers for StationHouse stations on
//! top of a [`Broker`](stationhouse_broker::Broker) transport. It handles
//! control-plane registration, partition routing, schema validation with
//! dead-lettering, prefetching and consumer liveness.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Producer   │   │   Consumer   │   │   Station    │
//! │ route+schema │   │ DLS+prefetch │   │ create/drop  │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        └──────────────────┼──────────────────┘
//!                           ▼
//!              ┌─────────────────────────┐
//!              │         Client          │
//!              │ schemas, flags, caches  │
//!              │ broadcast listeners     │
//!              └────────────┬────────────┘
//!                           ▼
//!                    Arc<dyn Broker>
//! ```
//!
//! # Examples
//!
//! ## Producer
//!
//! ```ignore
//! use stationhouse_client::{Client, ProduceOptions, ProducerOptions};
//!
//! let client = Client::builder().broker(broker).build()?;
//! client.start().await?;
//!
//! let producer = client
//!     .create_producer(ProducerOptions::new("orders", "checkout"))
//!     .await?;
//! producer
//!     .produce(b"order data".to_vec(), ProduceOptions::default().partition_key("user123"))
//!     .await?;
//! ```
//!
//! ## Consumer
//!
//! ```ignore
//! use stationhouse_client::{ConsumeOptions, ConsumerOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! let consumer = client
//!     .create_consumer(ConsumerOptions::new("orders", "analytics-1").consumer_group("analytics"))
//!     .await?;
//! let mut events = consumer.message_events().expect("first call");
//! consumer.start()?;
//! consumer.consume(ConsumeOptions::default(), CancellationToken::new())?;
//!
//! while let Some(event) = events.recv().await {
//!     for message in event.messages {
//!         println!("Received: {:?}", message);
//!         message.ack().await?;
//!     }
//! }
//! ```

pub mod client;
pub mod consumer;
pub mod dls;
pub mod error;
pub mod message;
pub mod prefetch;
pub mod producer;
pub mod protocol;
pub mod resolver;
pub mod retry;
pub mod schema;
pub mod schema_listener;
pub mod station;

pub use client::{Client, ClientBuilder, ClientConfig};
pub use consumer::{
    ConsumeOptions, Consumer, ConsumerEvent, ConsumerOptions, ConsumerState, FetchOptions,
    PartitionContext,
};
pub use dls::DeadLetterBuffer;
pub use error::{ClientError, Result};
pub use message::StationMessage;
pub use prefetch::PrefetchCache;
pub use producer::{ProduceOptions, Producer, ProducerOptions, StationProducer};
pub use resolver::{PartitionResolver, PartitionSet};
pub use retry::{retry_with_jittered_backoff, RetryPolicy};
pub use schema::{JsonValidator, SchemaDefinition, SchemaType, SchemaValidator};
pub use station::{RetentionType, Station, StationOptions, StorageType};
