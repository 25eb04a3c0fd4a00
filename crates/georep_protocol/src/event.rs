//! Replication events.

use crate::error::{ProtocolError, ProtocolResult};
use ciborium::value::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Type of replication event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A resource was created on the primary.
    Created,
    /// A resource was updated on the primary, or a resync was requested.
    Updated,
    /// A resource was deleted on the primary.
    Deleted,
    /// The primary finished computing a checksum for a resource.
    ChecksumSucceeded,
}

impl EventType {
    /// Returns the wire name of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Updated => "updated",
            EventType::Deleted => "deleted",
            EventType::ChecksumSucceeded => "checksum_succeeded",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "created" => Some(EventType::Created),
            "updated" => Some(EventType::Updated),
            "deleted" => Some(EventType::Deleted),
            "checksum_succeeded" => Some(EventType::ChecksumSucceeded),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque event parameters.
///
/// Deleted events carry the denormalized locators a secondary needs to
/// remove local artifacts after the primary's row is gone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventParams(BTreeMap<String, String>);

impl EventParams {
    /// Creates an empty parameter map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts a parameter.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the parameter with the given key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns the number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over parameters in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// An event published by the primary and consumed by every secondary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationEvent {
    /// What happened.
    pub event_type: EventType,
    /// Name of the replicator strategy that handles this event.
    pub resource_kind: String,
    /// Primary key of the resource on the primary.
    pub model_record_id: i64,
    /// Event-specific parameters.
    pub params: EventParams,
}

impl ReplicationEvent {
    /// Creates an event with no parameters.
    pub fn new(event_type: EventType, resource_kind: impl Into<String>, model_record_id: i64) -> Self {
        Self {
            event_type,
            resource_kind: resource_kind.into(),
            model_record_id,
            params: EventParams::new(),
        }
    }

    /// Creates a `created` event.
    pub fn created(resource_kind: impl Into<String>, model_record_id: i64) -> Self {
        Self::new(EventType::Created, resource_kind, model_record_id)
    }

    /// Creates an `updated` event.
    pub fn updated(resource_kind: impl Into<String>, model_record_id: i64) -> Self {
        Self::new(EventType::Updated, resource_kind, model_record_id)
    }

    /// Creates a `deleted` event carrying the given locator parameters.
    pub fn deleted(resource_kind: impl Into<String>, model_record_id: i64, params: EventParams) -> Self {
        Self {
            params,
            ..Self::new(EventType::Deleted, resource_kind, model_record_id)
        }
    }

    /// Creates a `checksum_succeeded` event.
    pub fn checksum_succeeded(resource_kind: impl Into<String>, model_record_id: i64) -> Self {
        Self::new(EventType::ChecksumSucceeded, resource_kind, model_record_id)
    }

    /// Sets the parameters, builder style.
    #[must_use]
    pub fn with_params(mut self, params: EventParams) -> Self {
        self.params = params;
        self
    }

    /// Encodes to CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if CBOR serialization fails.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let params = self
            .params
            .iter()
            .map(|(k, v)| (Value::Text(k.to_string()), Value::Text(v.to_string())))
            .collect();

        let pairs = vec![
            (
                Value::Text("event_type".into()),
                Value::Text(self.event_type.as_str().into()),
            ),
            (
                Value::Text("resource_kind".into()),
                Value::Text(self.resource_kind.clone()),
            ),
            (
                Value::Text("model_record_id".into()),
                Value::Integer(self.model_record_id.into()),
            ),
            (Value::Text("params".into()), Value::Map(params)),
        ];

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&Value::Map(pairs), &mut bytes)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes from CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not valid CBOR or do not describe
    /// an event.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value: Value =
            ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        let map = value
            .as_map()
            .ok_or_else(|| ProtocolError::invalid_structure("expected map for event"))?;

        let get_field = |name: &str| {
            map.iter()
                .find(|(k, _)| k.as_text() == Some(name))
                .map(|(_, v)| v)
        };

        let type_name = get_field("event_type")
            .and_then(Value::as_text)
            .ok_or_else(|| ProtocolError::invalid_structure("missing event_type"))?;
        let event_type = EventType::from_name(type_name)
            .ok_or_else(|| ProtocolError::UnknownEventType(type_name.to_string()))?;

        let resource_kind = get_field("resource_kind")
            .and_then(Value::as_text)
            .ok_or_else(|| ProtocolError::invalid_structure("missing resource_kind"))?
            .to_string();

        let model_record_id = get_field("model_record_id")
            .and_then(Value::as_integer)
            .and_then(|i| i64::try_from(i).ok())
            .ok_or_else(|| ProtocolError::invalid_structure("missing model_record_id"))?;

        let mut params = EventParams::new();
        if let Some(entries) = get_field("params").and_then(Value::as_map) {
            for (k, v) in entries {
                match (k.as_text(), v.as_text()) {
                    (Some(k), Some(v)) => params.insert(k, v),
                    _ => return Err(ProtocolError::invalid_structure("params must map text to text")),
                }
            }
        }

        Ok(Self {
            event_type,
            resource_kind,
            model_record_id,
            params,
        })
    }
}
