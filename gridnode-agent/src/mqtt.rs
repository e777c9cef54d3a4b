//! rumqttc adapter: one connection per node.
//!
//! The connection registers the OFFLINE presence record as its last will.
//! Every ConnAck owes the broker a retained ONLINE record followed by the
//! control subscription; both are retried on later events until queued.
//! Control payloads are forwarded to the node runtime in arrival order.

use crate::config::{LinkConfig, MqttConfig};
use crate::supervisor::{LinkState, LinkSupervisor, RetryDecision, RetryPolicy};
use async_trait::async_trait;
use gridnode_core::{Clock, LinkError, PresenceRecord, Publisher, Qos, SessionRequests, Topics};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Incoming, LastWill, MqttOptions, NetworkOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Pending requests between the client handles and the event loop
const REQUEST_CAPACITY: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum LinkFailure {
    #[error("Gave up on broker {broker} after {attempts} attempts: {last_error}")]
    GaveUp {
        broker: String,
        attempts: u32,
        last_error: String,
    },
}

pub fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

/// Connection options for one node: client id is the node id
pub fn build_options(mqtt: &MqttConfig, node_id: &str, topics: &Topics) -> MqttOptions {
    let mut options = MqttOptions::new(node_id, &mqtt.host, mqtt.port);
    options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_secs));
    options.set_clean_session(true);
    options.set_last_will(LastWill::new(
        &topics.status,
        PresenceRecord::offline(node_id).to_payload(),
        QoS::AtLeastOnce,
        true,
    ));
    options
}

/// Outbound half handed to the node runtime
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, qos: Qos, retain: bool, payload: Vec<u8>) -> Result<(), LinkError> {
        self.client
            .publish(topic, to_mqtt_qos(qos), retain, payload)
            .await
            .map_err(|e| LinkError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// `try_*` only queue the request; the event loop sends it on its next poll
impl SessionRequests for MqttPublisher {
    fn queue_publish(&self, topic: &str, qos: Qos, retain: bool, payload: Vec<u8>) -> Result<(), LinkError> {
        self.client
            .try_publish(topic, to_mqtt_qos(qos), retain, payload)
            .map_err(|e| LinkError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn queue_subscribe(&self, topic: &str, qos: Qos) -> Result<(), LinkError> {
        self.client
            .try_subscribe(topic, to_mqtt_qos(qos))
            .map_err(|e| LinkError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum AnnounceStage {
    #[default]
    Idle,
    Online,
    Subscribe,
}

/// Presence work owed once per session: the retained ONLINE record, then the
/// control subscription. A step that cannot be queued stays pending and is
/// retried from where it stopped.
#[derive(Debug, Default)]
pub struct Announcement {
    stage: AnnounceStage,
    failures: u32,
}

impl Announcement {
    /// Called on every ConnAck
    pub fn begin(&mut self) {
        self.stage = AnnounceStage::Online;
        self.failures = 0;
    }

    /// Called when the session is lost; the next ConnAck starts over
    pub fn cancel(&mut self) {
        self.stage = AnnounceStage::Idle;
    }

    pub fn is_pending(&self) -> bool {
        self.stage != AnnounceStage::Idle
    }

    /// Failed attempts in the current session
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Queues whatever is still owed. Returns `Ok(true)` once the
    /// subscription has been queued by this call.
    pub fn flush<S: SessionRequests + ?Sized>(
        &mut self,
        session: &S,
        node_id: &str,
        topics: &Topics,
        clock: &dyn Clock,
    ) -> Result<bool, LinkError> {
        let result = self.advance(session, node_id, topics, clock);
        if result.is_err() {
            self.failures += 1;
        }
        result
    }

    fn advance<S: SessionRequests + ?Sized>(
        &mut self,
        session: &S,
        node_id: &str,
        topics: &Topics,
        clock: &dyn Clock,
    ) -> Result<bool, LinkError> {
        if self.stage == AnnounceStage::Online {
            let online = PresenceRecord::online(node_id, clock.timestamp());
            session.queue_publish(&topics.status, Qos::AtLeastOnce, true, online.to_payload())?;
            self.stage = AnnounceStage::Subscribe;
        }
        if self.stage == AnnounceStage::Subscribe {
            session.queue_subscribe(&topics.control, Qos::AtLeastOnce)?;
            self.stage = AnnounceStage::Idle;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Drives the rumqttc event loop under a `LinkSupervisor`
pub struct MqttLink {
    session: MqttPublisher,
    eventloop: EventLoop,
    node_id: String,
    broker: String,
    topics: Topics,
    clock: Arc<dyn Clock>,
    supervisor: LinkSupervisor,
    announcement: Announcement,
    state_tx: watch::Sender<LinkState>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// Builds the connection for one node. Nothing touches the network until
/// `MqttLink::run` is polled.
pub fn connect(
    mqtt: &MqttConfig,
    link: &LinkConfig,
    policy: RetryPolicy,
    topics: Topics,
    node_id: &str,
    clock: Arc<dyn Clock>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
) -> (MqttPublisher, MqttLink, watch::Receiver<LinkState>) {
    let options = build_options(mqtt, node_id, &topics);
    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

    let mut network = NetworkOptions::new();
    network.set_connection_timeout(link.connect_timeout_secs);
    eventloop.set_network_options(network);

    let supervisor = LinkSupervisor::new(policy);
    let (state_tx, state_rx) = watch::channel(supervisor.state());

    let publisher = MqttPublisher { client };
    let link = MqttLink {
        session: publisher.clone(),
        eventloop,
        node_id: node_id.to_string(),
        broker: format!("{}:{}", mqtt.host, mqtt.port),
        topics,
        clock,
        supervisor,
        announcement: Announcement::default(),
        state_tx,
        inbound,
    };
    (publisher, link, state_rx)
}

impl MqttLink {
    /// Runs until the retry budget is exhausted, or until the runtime drops
    /// its inbound receiver.
    pub async fn run(mut self) -> Result<(), LinkFailure> {
        info!(node = %self.node_id, "Connecting to {}", self.broker);

        loop {
            let event = match self.eventloop.poll().await {
                Ok(event) => event,
                Err(e) => {
                    self.on_error(e).await?;
                    continue;
                }
            };

            match event {
                Event::Incoming(Incoming::ConnAck(_)) => self.on_connected(),
                Event::Incoming(Incoming::Publish(publish)) if publish.topic == self.topics.control => {
                    if self.inbound.send(publish.payload.to_vec()).is_err() {
                        info!(node = %self.node_id, "Runtime stopped, closing link");
                        return Ok(());
                    }
                }
                Event::Incoming(Incoming::Publish(publish)) => {
                    debug!(node = %self.node_id, "Ignoring message on {}", publish.topic);
                }
                _ => {}
            }
            self.announce();
        }
    }

    fn on_connected(&mut self) {
        self.supervisor.on_connected();
        self.state_tx.send_replace(LinkState::Connected);
        self.announcement.begin();
        info!(node = %self.node_id, "Connected to {}", self.broker);
    }

    fn announce(&mut self) {
        if !self.announcement.is_pending() {
            return;
        }
        match self
            .announcement
            .flush(&self.session, &self.node_id, &self.topics, self.clock.as_ref())
        {
            Ok(true) => info!(node = %self.node_id, "Announced ONLINE, subscribed to {}", self.topics.control),
            Ok(false) => {}
            Err(e) => warn!(
                node = %self.node_id,
                attempt = self.announcement.failures(),
                "Presence not queued, retrying on next event: {}",
                e
            ),
        }
    }

    async fn on_error(&mut self, e: ConnectionError) -> Result<(), LinkFailure> {
        self.announcement.cancel();
        let decision = self.supervisor.on_failure();
        self.state_tx.send_replace(self.supervisor.state());

        match decision {
            RetryDecision::Retry(backoff) => {
                warn!(
                    node = %self.node_id,
                    attempt = self.supervisor.failures(),
                    "MQTT connection error: {}, retrying in {:?}",
                    e,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                Ok(())
            }
            RetryDecision::GiveUp => {
                error!(node = %self.node_id, "MQTT connection failed for good: {}", e);
                Err(LinkFailure::GaveUp {
                    broker: self.broker.clone(),
                    attempts: self.supervisor.failures(),
                    last_error: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridnode_core::{FixedClock, Presence};
    use gridnode_devkit::MockMqttClient;

    fn topics() -> Topics {
        Topics::new("winter-river", "sw_a")
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_mqtt_qos(Qos::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_mqtt_qos(Qos::AtLeastOnce), QoS::AtLeastOnce);
    }

    #[test]
    fn test_options_carry_offline_will() {
        let options = build_options(&MqttConfig::default(), "sw_a", &topics());

        assert_eq!(options.client_id(), "sw_a");
        assert_eq!(options.broker_address(), ("192.168.4.1".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(15));

        let will = options.last_will().expect("last will registered");
        assert_eq!(will.message.as_ref(), br#"{"node":"sw_a","status":"OFFLINE"}"#.as_slice());
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }

    #[test]
    fn test_announcement_sends_online_before_subscribing() {
        let client = MockMqttClient::new();
        let clock = FixedClock::new("08:15:00");
        let mut announcement = Announcement::default();
        assert!(!announcement.is_pending());

        announcement.begin();
        assert!(announcement.flush(&client, "sw_a", &topics(), &clock).unwrap());
        assert!(!announcement.is_pending());

        let messages = client.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "winter-river/sw_a/status");
        assert_eq!(messages[0].qos, Qos::AtLeastOnce);
        assert!(messages[0].retain);
        let record: PresenceRecord = client
            .get_last_json_message("winter-river/sw_a/status")
            .unwrap()
            .unwrap();
        assert_eq!(record, PresenceRecord::online("sw_a", "08:15:00".into()));
        assert_eq!(record.status, Presence::Online);
        assert_eq!(client.get_subscriptions(), vec!["winter-river/sw_a/control"]);

        // nothing owed until the next ConnAck
        assert!(!announcement.flush(&client, "sw_a", &topics(), &clock).unwrap());
        assert_eq!(client.get_published_messages().len(), 1);

        announcement.begin();
        announcement.flush(&client, "sw_a", &topics(), &clock).unwrap();
        assert_eq!(client.find_messages_by_topic("winter-river/sw_a/status").len(), 2);
        assert_eq!(client.get_subscriptions().len(), 2);
    }

    #[test]
    fn test_announcement_retried_until_queued() {
        let client = MockMqttClient::new();
        let clock = FixedClock::unsynced();
        let mut announcement = Announcement::default();
        client.set_offline(true);

        announcement.begin();
        assert!(announcement.flush(&client, "sw_a", &topics(), &clock).is_err());
        assert!(announcement.flush(&client, "sw_a", &topics(), &clock).is_err());
        assert!(announcement.is_pending());
        assert_eq!(announcement.failures(), 2);
        assert!(client.get_published_messages().is_empty());
        assert!(client.get_subscriptions().is_empty());

        client.set_offline(false);
        assert!(announcement.flush(&client, "sw_a", &topics(), &clock).unwrap());
        assert_eq!(client.get_published_messages().len(), 1);
        assert_eq!(client.get_subscriptions(), vec!["winter-river/sw_a/control"]);

        // a lost session drops what was owed
        announcement.begin();
        announcement.cancel();
        assert!(!announcement.is_pending());
    }

    #[tokio::test]
    async fn test_full_request_queue_is_reported() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_publisher, link, _state) = connect(
            &MqttConfig::default(),
            &LinkConfig::default(),
            RetryPolicy::default(),
            topics(),
            "sw_a",
            Arc::new(FixedClock::unsynced()),
            tx,
        );

        // the event loop is never polled, so nothing drains the queue
        for _ in 0..REQUEST_CAPACITY {
            link.session.queue_publish("winter-river/sw_a/status", Qos::AtLeastOnce, true, Vec::new()).unwrap();
        }
        let err = link.session.queue_subscribe("winter-river/sw_a/control", Qos::AtLeastOnce).unwrap_err();
        assert!(matches!(err, LinkError::Subscribe { ref topic, .. } if topic == "winter-river/sw_a/control"));

        let mut announcement = Announcement::default();
        announcement.begin();
        let clock = FixedClock::unsynced();
        assert!(announcement.flush(&link.session, "sw_a", &link.topics, &clock).is_err());
        assert!(announcement.is_pending());
    }

    #[tokio::test]
    async fn test_connect_starts_in_connecting_state() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_publisher, link, state) = connect(
            &MqttConfig::default(),
            &LinkConfig::default(),
            RetryPolicy::default(),
            topics(),
            "sw_a",
            Arc::new(FixedClock::unsynced()),
            tx,
        );

        assert_eq!(*state.borrow(), LinkState::Connecting { attempt: 1 });
        assert_eq!(link.topics.control, "winter-river/sw_a/control");
        assert_eq!(link.broker, "192.168.4.1:1883");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_when_broker_unreachable() {
        let mqtt = MqttConfig {
            host: "127.0.0.1".into(),
            port: 1,
            keep_alive_secs: 5,
        };
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: Duration::from_millis(10),
            restart_delay: Duration::from_millis(10),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_publisher, link, state) = connect(
            &mqtt,
            &LinkConfig { connect_timeout_secs: 1, ..LinkConfig::default() },
            policy,
            topics(),
            "sw_a",
            Arc::new(FixedClock::unsynced()),
            tx,
        );

        let err = link.run().await.unwrap_err();
        assert!(matches!(err, LinkFailure::GaveUp { attempts: 2, .. }));
        assert_eq!(*state.borrow(), LinkState::Failed);
    }
}
