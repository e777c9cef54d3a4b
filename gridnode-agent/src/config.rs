//! Agent configuration
//!
//! Read from a TOML file whose path comes from `GRIDNODE_CONFIG`
//! (default `gridnode.toml`). A missing file means defaults: one
//! distribution board talking to the site broker.

use crate::supervisor::RetryPolicy;
use anyhow::{Context, Result};
use gridnode_core::{DisplayGeometry, NodeKind, NodeProfile};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const CONFIG_ENV: &str = "GRIDNODE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "gridnode.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub topic_prefix: String,
    pub mqtt: MqttConfig,
    pub link: LinkConfig,
    pub clock: ClockConfig,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub connect_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub restart_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub utc_offset_secs: i32,
    pub dst_offset_secs: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub publish_interval_ms: Option<u64>,
    #[serde(default)]
    pub display: Option<DisplayGeometry>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "winter-river".to_string(),
            mqtt: MqttConfig::default(),
            link: LinkConfig::default(),
            clock: ClockConfig::default(),
            nodes: vec![NodeConfig {
                id: "dist_a".to_string(),
                kind: NodeKind::Distribution,
                publish_interval_ms: None,
                display: None,
            }],
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "192.168.4.1".to_string(),
            port: 1883,
            keep_alive_secs: 15,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 20,
            max_attempts: 10,
            backoff_ms: 2000,
            restart_delay_secs: 30,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        // PST with daylight saving
        Self {
            utc_offset_secs: -28800,
            dst_offset_secs: 3600,
        }
    }
}

impl AgentConfig {
    /// Loads from `$GRIDNODE_CONFIG`, or `gridnode.toml` in the working directory
    pub async fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load_from(Path::new(&path)).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            anyhow::bail!("No nodes configured");
        }
        if self.topic_prefix.is_empty() {
            anyhow::bail!("topic_prefix must not be empty");
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() || node.id.contains(['/', '+', '#']) {
                anyhow::bail!("Invalid node id '{}'", node.id);
            }
            if !seen.insert(node.id.as_str()) {
                anyhow::bail!("Duplicate node id '{}'", node.id);
            }
            if node.publish_interval_ms == Some(0) {
                anyhow::bail!("Node '{}': publish_interval_ms must be positive", node.id);
            }
        }
        Ok(())
    }

    /// One shared profile per configured node
    pub fn profiles(&self) -> Vec<Arc<NodeProfile>> {
        self.nodes
            .iter()
            .map(|node| {
                let mut profile = NodeProfile::for_kind(node.kind, node.id.clone());
                if let Some(ms) = node.publish_interval_ms {
                    profile = profile.with_publish_interval(Duration::from_millis(ms));
                }
                if let Some(geometry) = node.display {
                    profile = profile.with_display(geometry);
                }
                Arc::new(profile)
            })
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.link.max_attempts,
            backoff: Duration::from_millis(self.link.backoff_ms),
            restart_delay: Duration::from_secs(self.link.restart_delay_secs),
        }
    }
}
