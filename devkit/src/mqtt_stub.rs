/*!
Mock MQTT client for broker-free runtime tests

Records every publish made through the `Publisher` or `SessionRequests`
traits, records subscriptions, and feeds simulated control messages to the
runtime's inbound channel.
*/

use anyhow::Result;
use async_trait::async_trait;
use gridnode_core::{LinkError, Publisher, Qos, SessionRequests};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

impl MockMessage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Stands in for the rumqttc-backed publisher
#[derive(Clone)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    message_sender: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
    offline: Arc<AtomicBool>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            message_sender: Arc::new(Mutex::new(None)),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Channel the runtime reads control payloads from
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.message_sender.lock().unwrap() = Some(sender);
        receiver
    }

    /// Drops the inbound sender so the runtime sees the link go away
    pub fn close_inbound(&self) {
        self.message_sender.lock().unwrap().take();
    }

    /// While offline every publish and subscribe fails with `LinkError::Disconnected`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn record(&self, topic: &str, qos: Qos, retain: bool, payload: Vec<u8>) -> Result<(), LinkError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LinkError::Disconnected);
        }

        log::debug!("[MOCK] Published to {}: {} bytes", topic, payload.len());
        self.published_messages.lock().unwrap().push(MockMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    /// Delivers a control payload as if the broker had forwarded it
    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let topic = topic.into();
        if let Some(sender) = self.message_sender.lock().unwrap().as_ref() {
            sender
                .send(payload.into())
                .map_err(|e| anyhow::anyhow!("Send error: {}", e))?;
        }

        log::info!("[MOCK] Simulated incoming: {}", topic);
        Ok(())
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parses the last message on a topic as JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }
}

impl Default for MockMqttClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for MockMqttClient {
    async fn publish(&self, topic: &str, qos: Qos, retain: bool, payload: Vec<u8>) -> Result<(), LinkError> {
        self.record(topic, qos, retain, payload)
    }
}

impl SessionRequests for MockMqttClient {
    fn queue_publish(&self, topic: &str, qos: Qos, retain: bool, payload: Vec<u8>) -> Result<(), LinkError> {
        self.record(topic, qos, retain, payload)
    }

    fn queue_subscribe(&self, topic: &str, _qos: Qos) -> Result<(), LinkError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LinkError::Disconnected);
        }

        log::info!("[MOCK] Subscribed to {}", topic);
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }
}
