//! Control-plane wire contract.
//!
//! Subject names, header names and the JSON bodies exchanged with the
//! station control plane. Field names are part of the wire format and must
//! not change.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod subjects {
    pub const PRODUCER_CREATIONS: &str = "$memphis_producer_creations";
    pub const PRODUCER_DESTRUCTIONS: &str = "$memphis_producer_destructions";
    pub const CONSUMER_CREATIONS: &str = "$memphis_consumer_creations";
    pub const CONSUMER_DESTRUCTIONS: &str = "$memphis_consumer_destructions";
    pub const STATION_CREATIONS: &str = "$memphis_station_creations";
    pub const STATION_DESTRUCTIONS: &str = "$memphis_station_destructions";
    pub const NOTIFICATIONS: &str = "$memphis_notifications";
    pub const SCHEMA_UPDATES_PREFIX: &str = "$memphis_schema_updates_";
    pub const SDK_CLIENTS_UPDATES: &str = "$memphis_sdk_clients_updates";
    pub const SCHEMAVERSE_DLS: &str = "$memphis_schemaverse_dls";
    pub const NACKED_DLS: &str = "$memphis_nacked_dls";
    pub const PM_ACKS: &str = "$memphis_pm_acks";
    pub const DLS_PREFIX: &str = "$memphis_dls_";
}

pub mod headers {
    pub const MESSAGE_ID: &str = "msg-id";
    pub const PRODUCED_BY: &str = "$memphis_producedBy";
    pub const CONNECTION_ID: &str = "$memphis_connectionId";
    pub const PM_ID: &str = "$memphis_pm_id";

    /// Caller headers may not use this prefix.
    pub const RESERVED_PREFIX: &str = "$memphis";
}

pub mod versions {
    pub const PRODUCER_CREATE: u32 = 4;
    pub const PRODUCER_DESTROY: u32 = 1;
    pub const CONSUMER_CREATE: u32 = 4;
    pub const CONSUMER_DESTROY: u32 = 1;
}

/// Largest batch a single fetch may request.
pub const MAX_BATCH_SIZE: usize = 5000;

/// Partition number carried by messages that came off the dead-letter
/// subscription rather than a real partition.
pub const DLS_PARTITION: i32 = -1;

/// Normalized station or group name used on the wire.
pub fn internal_name(name: &str) -> String {
    name.to_lowercase().replace('.', "#")
}

/// Stream name backing one partition (or the whole unpartitioned station).
pub fn stream_name(internal_station: &str, partition: Option<u32>) -> String {
    match partition {
        Some(p) => format!("{}${}", internal_station, p),
        None => internal_station.to_string(),
    }
}

pub fn schema_updates_subject(internal_station: &str) -> String {
    format!("{}{}", subjects::SCHEMA_UPDATES_PREFIX, internal_station)
}

pub fn dls_subject(internal_station: &str, internal_group: &str) -> String {
    format!("{}{}.{}", subjects::DLS_PREFIX, internal_station, internal_group)
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProducerRequest {
    pub name: String,
    pub station_name: String,
    pub connection_id: String,
    pub producer_type: String,
    pub req_version: u32,
    pub username: String,
    pub account_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyProducerRequest {
    pub name: String,
    pub station_name: String,
    pub username: String,
    pub connection_id: String,
    pub req_version: u32,
    pub account_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConsumerRequest {
    pub name: String,
    pub station_name: String,
    pub connection_id: String,
    pub consumer_type: String,
    pub consumers_group: String,
    pub max_ack_time_ms: u64,
    pub max_msg_deliveries: u32,
    pub start_consume_from_sequence: u64,
    pub last_messages: i64,
    pub req_version: u32,
    pub username: String,
    pub account_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyConsumerRequest {
    pub name: String,
    pub station_name: String,
    pub username: String,
    pub connection_id: String,
    pub req_version: u32,
    pub account_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlsConfiguration {
    pub poison: bool,
    pub schemaverse: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStationRequest {
    pub name: String,
    pub retention_type: String,
    pub retention_value: u64,
    pub storage_type: String,
    pub replicas: u32,
    pub idempotency_window_in_ms: u64,
    pub schema_name: String,
    pub dls_configuration: DlsConfiguration,
    pub username: String,
    pub tiered_storage_enabled: bool,
    pub partitions_number: u32,
    pub account_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyStationRequest {
    pub station_name: String,
    pub username: String,
    pub account_id: u32,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionsUpdate {
    #[serde(default)]
    pub partitions_list: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaVersion {
    #[serde(default)]
    pub version_number: i32,
    #[serde(default)]
    pub descriptor: String,
    #[serde(default)]
    pub schema_content: String,
    #[serde(default)]
    pub message_struct_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaUpdateInit {
    #[serde(default)]
    pub schema_name: String,
    #[serde(rename = "type", default)]
    pub schema_type: String,
    #[serde(default)]
    pub active_version: SchemaVersion,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateProducerResponse {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub schema_update: Option<SchemaUpdateInit>,
    #[serde(default)]
    pub partitions_update: Option<PartitionsUpdate>,
    #[serde(default)]
    pub schemaverse_to_dls: bool,
    #[serde(default)]
    pub send_notification: bool,
    #[serde(default)]
    pub station_version: i32,
    /// Partition number → id of the first function in that partition's chain.
    #[serde(default)]
    pub station_partitions_first_functions: HashMap<u32, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateConsumerResponse {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub partitions_update: Option<PartitionsUpdate>,
}

impl CreateConsumerResponse {
    /// An empty body is success without partitions; a body that is not JSON
    /// is an error string.
    pub fn parse(body: &[u8]) -> Self {
        if body.is_empty() {
            return Self::default();
        }
        serde_json::from_slice(body).unwrap_or_else(|_| Self {
            error: String::from_utf8_lossy(body).into_owned(),
            partitions_update: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Broadcasts and side-channel publishes
// ---------------------------------------------------------------------------

pub mod schema_update_types {
    pub const INIT: i32 = 1;
    pub const DROP: i32 = 2;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaUpdate {
    pub update_type: i32,
    #[serde(default)]
    pub init: SchemaUpdateInit,
}

pub mod sdk_update_types {
    pub const SEND_NOTIFICATION: &str = "send_notification";
    pub const SCHEMAVERSE_TO_DLS: &str = "schemaverse_to_dls";
    pub const REMOVE_STATION: &str = "remove_station";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkClientsUpdate {
    #[serde(rename = "type")]
    pub update_type: String,
    #[serde(default)]
    pub station_name: String,
    #[serde(default)]
    pub update: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub msg: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerDetails {
    pub name: String,
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlsPayload {
    /// Upper-case hex of the rejected payload.
    pub data: String,
    pub headers: HashMap<String, String>,
}

/// Copy of a message rejected by schema validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaverseDlsMessage {
    pub station_name: String,
    pub producer: ProducerDetails,
    pub message: DlsPayload,
    pub validation_error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmAck {
    pub id: String,
    pub cg_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NackedDlsMessage {
    pub id: String,
    pub station_name: String,
    pub cg_name: String,
    pub partition: i32,
    pub error: String,
}

pub(crate) fn hex_upper(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02X}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_name() {
        assert_eq!(internal_name("Orders.EU"), "orders#eu");
        assert_eq!(internal_name("plain"), "plain");
    }

    #[test]
    fn test_subject_builders() {
        assert_eq!(stream_name("orders", Some(3)), "orders$3");
        assert_eq!(stream_name("orders", None), "orders");
        assert_eq!(schema_updates_subject("orders"), "$memphis_schema_updates_orders");
        assert_eq!(dls_subject("orders", "billing"), "$memphis_dls_orders.billing");
    }

    #[test]
    fn test_producer_response_tolerates_missing_fields() {
        let body = br#"{"error":"","partitions_update":{"partitions_list":[1,2]},
            "station_partitions_first_functions":{"2":17}}"#;
        let resp: CreateProducerResponse = serde_json::from_slice(body).unwrap();

        assert!(resp.error.is_empty());
        assert!(resp.schema_update.is_none());
        assert_eq!(resp.partitions_update.unwrap().partitions_list, vec![1, 2]);
        assert_eq!(resp.station_partitions_first_functions.get(&2), Some(&17));
    }

    #[test]
    fn test_consumer_response_forms() {
        assert!(CreateConsumerResponse::parse(b"").error.is_empty());

        let json = CreateConsumerResponse::parse(br#"{"error":"","partitions_update":{"partitions_list":[1]}}"#);
        assert_eq!(json.partitions_update.unwrap().partitions_list, vec![1]);

        let plain = CreateConsumerResponse::parse(b"station does not exist");
        assert_eq!(plain.error, "station does not exist");
    }

    #[test]
    fn test_schema_update_type_field_name() {
        let update: SchemaUpdate = serde_json::from_str(
            r#"{"update_type":1,"init":{"schema_name":"s","type":"json","active_version":{"version_number":2,"schema_content":"{}"}}}"#,
        )
        .unwrap();
        assert_eq!(update.init.schema_type, "json");
        assert_eq!(update.init.active_version.version_number, 2);
    }

    #[test]
    fn test_hex_upper() {
        assert_eq!(hex_upper(&[0x00, 0xab, 0x7f]), "00AB7F");
    }
}
