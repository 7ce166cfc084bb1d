//! Station management.

use crate::client::Client;
use crate::error::{ClientError, Result};
use crate::protocol::{
    internal_name, subjects, CreateStationRequest, DestroyStationRequest, DlsConfiguration,
};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionType {
    MaxMessageAgeSeconds,
    Messages,
    Bytes,
    AckBased,
}

impl RetentionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionType::MaxMessageAgeSeconds => "message_age_sec",
            RetentionType::Messages => "messages",
            RetentionType::Bytes => "bytes",
            RetentionType::AckBased => "ack_based",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Disk,
    Memory,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Disk => "file",
            StorageType::Memory => "memory",
        }
    }
}

/// Options for [`Client::create_station`].
///
/// Defaults: 7 days of age-based retention on disk, one replica, a two
/// minute idempotency window, poison and schema dead-lettering enabled,
/// one partition.
#[derive(Debug, Clone)]
pub struct StationOptions {
    pub name: String,
    pub retention_type: RetentionType,
    pub retention_value: u64,
    pub storage_type: StorageType,
    pub replicas: u32,
    pub idempotency_window: Duration,
    /// Schema to attach on creation; empty for none.
    pub schema_name: String,
    pub send_poison_msg_to_dls: bool,
    pub send_schema_failed_msg_to_dls: bool,
    pub tiered_storage_enabled: bool,
    pub partitions_number: u32,
}

impl StationOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retention_type: RetentionType::MaxMessageAgeSeconds,
            retention_value: 604_800,
            storage_type: StorageType::Disk,
            replicas: 1,
            idempotency_window: Duration::from_secs(120),
            schema_name: String::new(),
            send_poison_msg_to_dls: true,
            send_schema_failed_msg_to_dls: true,
            tiered_storage_enabled: false,
            partitions_number: 1,
        }
    }

    pub fn partitions(mut self, partitions_number: u32) -> Self {
        self.partitions_number = partitions_number;
        self
    }

    pub fn schema(mut self, schema_name: impl Into<String>) -> Self {
        self.schema_name = schema_name.into();
        self
    }

    pub fn retention(mut self, retention_type: RetentionType, value: u64) -> Self {
        self.retention_type = retention_type;
        self.retention_value = value;
        self
    }

    pub fn storage(mut self, storage_type: StorageType) -> Self {
        self.storage_type = storage_type;
        self
    }
}

/// Handle to a station created through the client.
#[derive(Debug, Clone)]
pub struct Station {
    client: Client,
    name: String,
    internal_name: String,
}

impl Station {
    pub(crate) async fn create(client: Client, options: StationOptions) -> Result<Self> {
        let wrap = |source: ClientError| ClientError::CreateStation {
            station: options.name.clone(),
            source: Box::new(source),
        };

        if options.partitions_number == 0 {
            return Err(wrap(ClientError::ConfigError(
                "partitions_number must be at least 1".to_string(),
            )));
        }

        let request = CreateStationRequest {
            name: options.name.clone(),
            retention_type: options.retention_type.as_str().to_string(),
            retention_value: options.retention_value,
            storage_type: options.storage_type.as_str().to_string(),
            replicas: options.replicas,
            idempotency_window_in_ms: options.idempotency_window.as_millis() as u64,
            schema_name: options.schema_name.clone(),
            dls_configuration: DlsConfiguration {
                poison: options.send_poison_msg_to_dls,
                schemaverse: options.send_schema_failed_msg_to_dls,
            },
            username: client.username().to_string(),
            tiered_storage_enabled: options.tiered_storage_enabled,
            partitions_number: options.partitions_number,
            account_id: client.config().account_id,
        };

        let reply = client
            .request(subjects::STATION_CREATIONS, &request)
            .await
            .map_err(wrap)?;
        let error = String::from_utf8_lossy(&reply);
        if !error.is_empty() && !error.contains("already exist") {
            return Err(wrap(ClientError::ControlPlane(error.into_owned())));
        }

        info!(station = %options.name, partitions = options.partitions_number, "Station created");
        Ok(Self {
            internal_name: internal_name(&options.name),
            name: options.name,
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn internal_name(&self) -> &str {
        &self.internal_name
    }

    /// Destroy the station and drop every cache entry the client holds for it.
    pub async fn destroy(&self) -> Result<()> {
        let wrap = |source: ClientError| ClientError::DestroyStation {
            station: self.name.clone(),
            source: Box::new(source),
        };

        let request = DestroyStationRequest {
            station_name: self.name.clone(),
            username: self.client.username().to_string(),
            account_id: self.client.config().account_id,
        };
        let reply = self
            .client
            .request(subjects::STATION_DESTRUCTIONS, &request)
            .await
            .map_err(wrap)?;
        if !reply.is_empty() {
            return Err(wrap(ClientError::ControlPlane(
                String::from_utf8_lossy(&reply).into_owned(),
            )));
        }

        self.client.remove_station_state(&self.internal_name);
        info!(station = %self.name, "Station destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use stationhouse_broker::InMemoryBroker;
    use std::sync::Arc;

    fn client_on(memory: &InMemoryBroker) -> Client {
        Client::builder()
            .broker(Arc::new(memory.clone()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_already_exists_is_success() {
        let memory = InMemoryBroker::new();
        memory.register_responder(subjects::STATION_CREATIONS, |_, _| {
            Ok(Bytes::from_static(b"Station orders already exists"))
        });

        let station = client_on(&memory)
            .create_station(StationOptions::new("Orders"))
            .await
            .unwrap();
        assert_eq!(station.name(), "Orders");
        assert_eq!(station.internal_name(), "orders");
    }

    #[tokio::test]
    async fn test_create_error_is_wrapped() {
        let memory = InMemoryBroker::new();
        memory.register_responder(subjects::STATION_CREATIONS, |_, _| {
            Ok(Bytes::from_static(b"invalid retention"))
        });

        let err = client_on(&memory)
            .create_station(StationOptions::new("orders"))
            .await
            .unwrap_err();
        match err {
            ClientError::CreateStation { station, source } => {
                assert_eq!(station, "orders");
                assert!(matches!(*source, ClientError::ControlPlane(ref m) if m == "invalid retention"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_partitions_rejected() {
        let memory = InMemoryBroker::new();
        let err = client_on(&memory)
            .create_station(StationOptions::new("orders").partitions(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::CreateStation { .. }));
    }

    #[tokio::test]
    async fn test_destroy_sends_request() {
        let memory = InMemoryBroker::new();
        memory.register_responder(subjects::STATION_CREATIONS, |_, _| Ok(Bytes::new()));
        memory.register_responder(subjects::STATION_DESTRUCTIONS, |_, payload| {
            let request: DestroyStationRequest = serde_json::from_slice(&payload)
                .map_err(|e| stationhouse_broker::BrokerError::Internal(e.to_string()))?;
            assert_eq!(request.station_name, "orders");
            Ok(Bytes::new())
        });

        let station = client_on(&memory)
            .create_station(StationOptions::new("orders"))
            .await
            .unwrap();
        station.destroy().await.unwrap();
    }
}
