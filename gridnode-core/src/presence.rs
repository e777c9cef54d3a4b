//! Presence records and per-node topic layout.
//!
//! The OFFLINE record is registered with the broker as the connection's last
//! will; the ONLINE record overwrites it after every successful connect. Both
//! are retained on the node's status topic.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Presence {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ts: Option<String>,
    pub node: String,
    pub status: Presence,
}

impl PresenceRecord {
    /// Last-will payload; the broker sends it long after we are gone, so no timestamp
    pub fn offline(node_id: &str) -> Self {
        Self { ts: None, node: node_id.to_string(), status: Presence::Offline }
    }

    pub fn online(node_id: &str, timestamp: String) -> Self {
        Self { ts: Some(timestamp), node: node_id.to_string(), status: Presence::Online }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// MQTT topics used by one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Inbound commands
    pub control: String,
    /// Telemetry and retained presence
    pub status: String,
    /// Bare prefix, target of the relay heartbeat
    pub relay: String,
}

impl Topics {
    pub fn new(prefix: &str, node_id: &str) -> Self {
        Self {
            control: format!("{}/{}/control", prefix, node_id),
            status: format!("{}/{}/status", prefix, node_id),
            relay: prefix.to_string(),
        }
    }
}
