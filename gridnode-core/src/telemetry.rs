//! Telemetry records.
//!
//! A record is a flat JSON object: `ts`, the metric keys in schema order,
//! the state key and the rated keys. Encoding never fails; non-finite floats
//! are written as `null`.

use crate::metrics::{MetricKind, MetricValue};
use crate::profile::NodeProfile;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Telemetry JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Telemetry record is not a JSON object")]
    NotAnObject,
    #[error("Telemetry record is missing field {0}")]
    MissingField(String),
    #[error("Telemetry field {field} is not a {expected}")]
    FieldType { field: String, expected: &'static str },
}

/// Immutable snapshot published on every tick
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub timestamp: String,
    pub node_id: String,
    pub metrics: Vec<(&'static str, MetricValue)>,
    pub state_key: &'static str,
    pub state: String,
    pub rated: Vec<(&'static str, MetricValue)>,
}

impl Serialize for TelemetryRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2 + self.metrics.len() + self.rated.len()))?;
        map.serialize_entry("ts", &self.timestamp)?;
        for (key, value) in &self.metrics {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry(self.state_key, &self.state)?;
        for (key, value) in &self.rated {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl TelemetryRecord {
    pub fn encode(&self) -> String {
        // map keys are strings and values are plain scalars, serde_json cannot fail here
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn metric(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.iter().find(|(key, _)| *key == name).map(|(_, value)| value)
    }

    /// Parses a record published by a node built from `profile`
    pub fn decode(profile: &NodeProfile, text: &str) -> Result<Self, TelemetryError> {
        let value: Value = serde_json::from_str(text)?;
        let object = value.as_object().ok_or(TelemetryError::NotAnObject)?;

        let timestamp = string_field(object, "ts")?;
        let state = string_field(object, profile.state_key)?;

        let metrics = profile
            .metric_schema
            .iter()
            .map(|spec| Ok((spec.name, typed_field(object, spec.name, spec.kind())?)))
            .collect::<Result<Vec<_>, TelemetryError>>()?;

        let rated = profile
            .rated_fields
            .iter()
            .map(|field| Ok((field.key, typed_field(object, field.key, field.value.kind())?)))
            .collect::<Result<Vec<_>, TelemetryError>>()?;

        Ok(Self {
            timestamp,
            node_id: profile.node_id.clone(),
            metrics,
            state_key: profile.state_key,
            state,
            rated,
        })
    }
}

fn lookup<'a>(object: &'a Map<String, Value>, key: &str) -> Result<&'a Value, TelemetryError> {
    object.get(key).ok_or_else(|| TelemetryError::MissingField(key.to_string()))
}

fn string_field(object: &Map<String, Value>, key: &str) -> Result<String, TelemetryError> {
    lookup(object, key)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| wrong_type(key, "string"))
}

fn typed_field(object: &Map<String, Value>, key: &str, kind: MetricKind) -> Result<MetricValue, TelemetryError> {
    let value = lookup(object, key)?;
    match kind {
        MetricKind::Int => value.as_i64().map(MetricValue::Int).ok_or_else(|| wrong_type(key, "integer")),
        MetricKind::Float => match value {
            Value::Null => Ok(MetricValue::Float(f64::NAN)),
            other => other.as_f64().map(MetricValue::Float).ok_or_else(|| wrong_type(key, "number")),
        },
        MetricKind::Bool => value.as_bool().map(MetricValue::Bool).ok_or_else(|| wrong_type(key, "boolean")),
        MetricKind::Text => value
            .as_str()
            .map(|s| MetricValue::Text(s.to_string()))
            .ok_or_else(|| wrong_type(key, "string")),
    }
}

fn wrong_type(field: &str, expected: &'static str) -> TelemetryError {
    TelemetryError::FieldType { field: field.to_string(), expected }
}
