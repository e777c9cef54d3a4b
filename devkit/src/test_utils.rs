/*!
Test harness for node runtimes

Wraps the mock client with the node's profile so published telemetry can be
decoded back into typed records and asserted on.
*/

use crate::mqtt_stub::MockMqttClient;
use anyhow::Result;
use gridnode_core::{DisplayFrame, DisplaySink, MetricValue, NodeProfile, PresenceRecord, TelemetryRecord, Topics};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_PREFIX: &str = "winter-river";

pub struct NodeHarness {
    pub mqtt_client: MockMqttClient,
    pub display: RecordingDisplay,
    profile: Arc<NodeProfile>,
    topics: Topics,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl NodeHarness {
    pub fn new(profile: NodeProfile) -> Self {
        env_logger::try_init().ok();

        let topics = Topics::new(DEFAULT_PREFIX, &profile.node_id);
        Self {
            mqtt_client: MockMqttClient::new(),
            display: RecordingDisplay::default(),
            profile: Arc::new(profile),
            topics,
            expectations: Vec::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.topics = Topics::new(prefix, &self.profile.node_id);
        self
    }

    pub fn profile(&self) -> Arc<NodeProfile> {
        Arc::clone(&self.profile)
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Sends a control message on the node's control topic
    pub async fn send_command(&self, text: &str) -> Result<()> {
        self.mqtt_client
            .simulate_incoming(self.topics.control.clone(), text.as_bytes().to_vec())
            .await
    }

    /// Every telemetry record published so far, oldest first.
    /// Retained messages on the status topic are presence records and are skipped.
    pub fn status_records(&self) -> Result<Vec<TelemetryRecord>> {
        self.mqtt_client
            .find_messages_by_topic(&self.topics.status)
            .iter()
            .filter(|msg| !msg.retain)
            .map(|msg| Ok(TelemetryRecord::decode(&self.profile, &msg.text())?))
            .collect()
    }

    pub fn presence_records(&self) -> Result<Vec<PresenceRecord>> {
        self.mqtt_client
            .find_messages_by_topic(&self.topics.status)
            .iter()
            .filter(|msg| msg.retain)
            .map(|msg| Ok(serde_json::from_slice(&msg.payload)?))
            .collect()
    }

    pub fn last_record(&self) -> Result<TelemetryRecord> {
        self.status_records()?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("No telemetry published on {}", self.topics.status))
    }

    /// Polls until a telemetry record shows up
    pub async fn wait_for_record(&self, timeout_ms: u64) -> Result<Option<TelemetryRecord>> {
        let start = tokio::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(record) = self.status_records()?.pop() {
                return Ok(Some(record));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        log::warn!("Timeout waiting for telemetry on {}", self.topics.status);
        Ok(None)
    }

    pub fn assert_state(&self, expected: &str) -> Result<()> {
        let record = self.last_record()?;
        if record.state != expected {
            anyhow::bail!("State mismatch: expected {}, got {}", expected, record.state);
        }
        Ok(())
    }

    pub fn assert_metric(&self, name: &str, expected: &MetricValue) -> Result<()> {
        let record = self.last_record()?;
        match record.metric(name) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!("Metric '{}' mismatch: expected {:?}, got {:?}", name, expected, actual),
            None => anyhow::bail!("Metric '{}' not in telemetry", name),
        }
    }

    /// Expects exactly `count` messages on `topic`
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual_count = self.mqtt_client.find_messages_by_topic(&expectation.topic).len();
            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual_count
                );
            }
        }
        Ok(())
    }

    pub fn get_stats(&self) -> TestStats {
        let messages = self.mqtt_client.get_published_messages();
        let mut topic_counts = HashMap::new();
        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }

        TestStats {
            total_messages: messages.len(),
            topic_counts,
            frames: self.display.frames().len(),
        }
    }

    pub fn reset(&mut self) {
        self.mqtt_client.clear();
        self.display.clear();
        self.expectations.clear();
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub frames: usize,
}

/// Display sink that keeps every frame it is shown
#[derive(Debug, Clone, Default)]
pub struct RecordingDisplay {
    frames: Arc<Mutex<Vec<DisplayFrame>>>,
}

impl RecordingDisplay {
    pub fn frames(&self) -> Vec<DisplayFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn last_frame(&self) -> Option<DisplayFrame> {
        self.frames.lock().unwrap().last().cloned()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

impl DisplaySink for RecordingDisplay {
    fn show(&mut self, frame: &DisplayFrame) {
        self.frames.lock().unwrap().push(frame.clone());
    }
}
