//! Schema cache and validators.
//!
//! The cache holds the latest schema known for each station (keyed by
//! internal station name). Producers read it before every publish and pass
//! the payload to the validator registered for the schema's type. Parsing
//! the schema formats themselves is left to the validators; only a JSON
//! validator ships by default.

use crate::error::{ClientError, Result};
use crate::protocol::SchemaUpdateInit;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaType {
    Json,
    GraphQl,
    Protobuf,
    Avro,
}

impl SchemaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaType::Json => "json",
            SchemaType::GraphQl => "graphql",
            SchemaType::Protobuf => "protobuf",
            SchemaType::Avro => "avro",
        }
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchemaType {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(SchemaType::Json),
            "graphql" => Ok(SchemaType::GraphQl),
            "protobuf" => Ok(SchemaType::Protobuf),
            "avro" => Ok(SchemaType::Avro),
            other => Err(ClientError::UnsupportedSchemaType(other.to_string())),
        }
    }
}

/// The active version of a station's schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDefinition {
    pub name: String,
    pub schema_type: SchemaType,
    pub version: i32,
    pub content: String,
    pub descriptor: String,
    pub message_struct_name: String,
}

impl SchemaDefinition {
    /// Build from the control-plane form. Returns `Ok(None)` when no schema
    /// is attached (empty name).
    pub fn from_init(init: &SchemaUpdateInit) -> Result<Option<Self>> {
        if init.schema_name.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self {
            name: init.schema_name.clone(),
            schema_type: init.schema_type.parse()?,
            version: init.active_version.version_number,
            content: init.active_version.schema_content.clone(),
            descriptor: init.active_version.descriptor.clone(),
            message_struct_name: init.active_version.message_struct_name.clone(),
        }))
    }
}

/// Latest schema per internal station name.
///
/// Replacement swaps the whole `Arc`, so readers see either the old or the
/// new definition, never a mix.
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: DashMap<String, Arc<SchemaDefinition>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, station: &str) -> Option<Arc<SchemaDefinition>> {
        self.entries.get(station).map(|entry| Arc::clone(entry.value()))
    }

    pub fn insert(&self, station: &str, schema: SchemaDefinition) {
        self.entries.insert(station.to_string(), Arc::new(schema));
    }

    pub fn remove(&self, station: &str) -> bool {
        self.entries.remove(station).is_some()
    }

    pub fn contains(&self, station: &str) -> bool {
        self.entries.contains_key(station)
    }
}

/// Validates a payload against a schema definition.
///
/// Returns a human-readable reason on rejection.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, schema: &SchemaDefinition, payload: &[u8]) -> std::result::Result<(), String>;
}

/// JSON validator.
///
/// Checks that the payload is well-formed JSON. When the schema content is a
/// JSON Schema object it also enforces the top-level `type: "object"` and
/// `required` keywords.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonValidator;

impl SchemaValidator for JsonValidator {
    fn validate(&self, schema: &SchemaDefinition, payload: &[u8]) -> std::result::Result<(), String> {
        let document: Value =
            serde_json::from_slice(payload).map_err(|e| format!("invalid JSON: {}", e))?;

        let rules = match serde_json::from_str::<Value>(&schema.content) {
            Ok(rules) if rules.is_object() => rules,
            _ => return Ok(()),
        };

        if rules.get("type").and_then(Value::as_str) == Some("object") && !document.is_object() {
            return Err("expected a JSON object".to_string());
        }

        if let (Some(required), Some(object)) = (
            rules.get("required").and_then(Value::as_array),
            document.as_object(),
        ) {
            for field in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(field) {
                    return Err(format!("missing required property '{}'", field));
                }
            }
        }

        Ok(())
    }
}

/// Validators by schema type.
#[derive(Clone)]
pub struct ValidatorRegistry {
    validators: HashMap<SchemaType, Arc<dyn SchemaValidator>>,
}

impl ValidatorRegistry {
    /// A registry with only the JSON validator.
    pub fn new() -> Self {
        let mut validators: HashMap<SchemaType, Arc<dyn SchemaValidator>> = HashMap::new();
        validators.insert(SchemaType::Json, Arc::new(JsonValidator));
        Self { validators }
    }

    pub fn register(&mut self, schema_type: SchemaType, validator: Arc<dyn SchemaValidator>) {
        self.validators.insert(schema_type, validator);
    }

    pub fn get(&self, schema_type: SchemaType) -> Option<&Arc<dyn SchemaValidator>> {
        self.validators.get(&schema_type)
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.validators.keys().map(SchemaType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("ValidatorRegistry").field("types", &types).finish()
    }
}
