//! Metric values held by a live node.

use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Storage class of a metric, fixed by the node profile's schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Int,
    Float,
    Bool,
    Text,
}

/// One metric value
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Int(_) => MetricKind::Int,
            MetricValue::Float(_) => MetricKind::Float,
            MetricValue::Bool(_) => MetricKind::Bool,
            MetricValue::Text(_) => MetricKind::Text,
        }
    }

    /// Numeric view used by threshold predicates. Text reads as 0.
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Int(v) => *v as f64,
            MetricValue::Float(v) => *v,
            MetricValue::Bool(v) => f64::from(u8::from(*v)),
            MetricValue::Text(_) => 0.0,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            MetricValue::Bool(v) => *v,
            other => other.as_f64() != 0.0,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetricValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Converts to `kind`, truncating floats the way an `(int)` cast does
    pub fn coerce(self, kind: MetricKind) -> MetricValue {
        match (kind, self) {
            (MetricKind::Int, MetricValue::Int(v)) => MetricValue::Int(v),
            (MetricKind::Int, MetricValue::Float(v)) => MetricValue::Int(v as i64),
            (MetricKind::Float, MetricValue::Float(v)) => MetricValue::Float(v),
            (MetricKind::Bool, MetricValue::Bool(v)) => MetricValue::Bool(v),
            (MetricKind::Text, MetricValue::Text(v)) => MetricValue::Text(v),
            (MetricKind::Text, other) => MetricValue::Text(other.to_string()),
            (MetricKind::Int, other) => MetricValue::Int(other.as_f64() as i64),
            (MetricKind::Float, other) => MetricValue::Float(other.as_f64()),
            (MetricKind::Bool, other) => MetricValue::Bool(other.as_bool()),
        }
    }
}

impl Serialize for MetricValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MetricValue::Int(v) => serializer.serialize_i64(*v),
            MetricValue::Float(v) => serializer.serialize_f64(*v),
            MetricValue::Bool(v) => serializer.serialize_bool(*v),
            MetricValue::Text(v) => serializer.serialize_str(v),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
            MetricValue::Bool(v) => write!(f, "{}", v),
            MetricValue::Text(v) => f.write_str(v),
        }
    }
}

/// Declared metric: name (also its telemetry key) and start value
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSpec {
    pub name: &'static str,
    pub default: MetricValue,
}

impl MetricSpec {
    pub fn int(name: &'static str, default: i64) -> Self {
        Self { name, default: MetricValue::Int(default) }
    }

    pub fn float(name: &'static str, default: f64) -> Self {
        Self { name, default: MetricValue::Float(default) }
    }

    pub fn flag(name: &'static str, default: bool) -> Self {
        Self { name, default: MetricValue::Bool(default) }
    }

    pub fn text(name: &'static str, default: &str) -> Self {
        Self { name, default: MetricValue::Text(default.to_string()) }
    }

    pub fn kind(&self) -> MetricKind {
        self.default.kind()
    }
}

/// Live metrics of one node.
///
/// Built from a schema; every declared field stays present for the node's
/// lifetime and writes to undeclared names are refused.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeMetrics {
    values: HashMap<&'static str, MetricValue>,
}

impl NodeMetrics {
    pub fn from_schema(schema: &[MetricSpec]) -> Self {
        let values = schema
            .iter()
            .map(|spec| (spec.name, spec.default.clone()))
            .collect();
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.values.get(name)
    }

    /// Numeric reading, 0 for unknown names
    pub fn number(&self, name: &str) -> f64 {
        self.get(name).map(MetricValue::as_f64).unwrap_or(0.0)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.get(name).map(MetricValue::as_bool).unwrap_or(false)
    }

    pub fn text(&self, name: &str) -> &str {
        self.get(name).and_then(MetricValue::as_text).unwrap_or("")
    }

    /// Writes a declared metric, keeping its declared kind.
    /// Returns false when `name` is not part of the schema.
    pub fn set(&mut self, name: &str, value: MetricValue) -> bool {
        match self.values.get_mut(name) {
            Some(slot) => {
                let kind = slot.kind();
                *slot = value.coerce(kind);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
