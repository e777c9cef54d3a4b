//! Node runtime loop.
//!
//! One task per node owns the `NodeContext`. Inbound commands are applied in
//! arrival order and always ahead of a pending telemetry tick; the tick then
//! refreshes the display and publishes a fresh record.

use crate::supervisor::LinkState;
use gridnode_core::{
    Clock, DisplayFrame, DisplaySink, LinkError, LinkStatus, NodeContext, Publisher, Qos, Topics, Transition,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub commands_received: u64,
    pub commands_ignored: u64,
    pub records_published: u64,
    pub publish_failures: u64,
    /// Display refreshes so far; the status line shows the count before this one
    pub frames_shown: u64,
}

pub struct NodeRuntime<P, C, D> {
    node: NodeContext,
    topics: Topics,
    publisher: P,
    clock: C,
    display: D,
    link_state: Option<watch::Receiver<LinkState>>,
    stats: RuntimeStats,
}

impl<P: Publisher, C: Clock, D: DisplaySink> NodeRuntime<P, C, D> {
    pub fn new(node: NodeContext, topics: Topics, publisher: P, clock: C, display: D) -> Self {
        Self {
            node,
            topics,
            publisher,
            clock,
            display,
            link_state: None,
            stats: RuntimeStats::default(),
        }
    }

    /// Publishes only while the watched link reports `Connected`
    pub fn with_link_state(mut self, link_state: watch::Receiver<LinkState>) -> Self {
        self.link_state = Some(link_state);
        self
    }

    pub fn node(&self) -> &NodeContext {
        &self.node
    }

    pub fn stats(&self) -> RuntimeStats {
        self.stats
    }

    fn link_connected(&self) -> bool {
        self.link_state
            .as_ref()
            .map_or(true, |state| state.borrow().is_connected())
    }

    /// Applies one control payload. Unknown verbs are logged and dropped.
    pub fn handle_command(&mut self, payload: &[u8]) -> Option<Transition> {
        let text = String::from_utf8_lossy(payload);
        self.stats.commands_received += 1;
        debug!(node = %self.node.profile().node_id, "Received: {}", text);

        let Some(transition) = self.node.handle_message(&text) else {
            self.stats.commands_ignored += 1;
            debug!(node = %self.node.profile().node_id, "Ignored command: {}", text);
            return None;
        };

        if transition.changed() {
            info!(
                node = %self.node.profile().node_id,
                verb = transition.verb,
                "State {} -> {}",
                transition.previous,
                transition.state
            );
        }
        Some(transition)
    }

    /// Refreshes the display, then publishes telemetry if the link is up
    pub async fn publish_tick(&mut self) -> Result<(), LinkError> {
        let connected = self.link_connected();
        let frame = DisplayFrame::render(
            &self.node,
            LinkStatus {
                connected,
                messages: self.stats.frames_shown,
            },
        );
        self.display.show(&frame);
        self.stats.frames_shown += 1;

        if !connected {
            debug!(node = %self.node.profile().node_id, "Link down, skipping telemetry");
            return Ok(());
        }

        let payload = self.node.snapshot(self.clock.timestamp()).encode();
        self.publisher
            .publish(&self.topics.status, Qos::AtMostOnce, false, payload.clone().into_bytes())
            .await?;
        self.stats.records_published += 1;
        debug!(node = %self.node.profile().node_id, "Published: {}", payload);

        if self.node.profile().relay_heartbeat {
            let heartbeat = format!("MQTT Relay Successful: {}", self.node.profile().node_id);
            self.publisher
                .publish(&self.topics.relay, Qos::AtMostOnce, false, heartbeat.into_bytes())
                .await?;
        }
        Ok(())
    }

    /// Runs until the inbound channel closes
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<Vec<u8>>) -> RuntimeStats {
        let period = self.node.profile().publish_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            node = %self.node.profile().node_id,
            kind = %self.node.profile().kind,
            "Node runtime started, publishing every {:?}",
            period
        );

        loop {
            tokio::select! {
                biased;

                message = inbound.recv() => {
                    match message {
                        Some(payload) => {
                            self.handle_command(&payload);
                        }
                        None => {
                            info!(node = %self.node.profile().node_id, "Inbound channel closed, stopping");
                            return self.stats;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.publish_tick().await {
                        self.stats.publish_failures += 1;
                        warn!(node = %self.node.profile().node_id, "Failed to publish telemetry: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridnode_core::{FixedClock, MetricValue, NodeProfile};
    use gridnode_devkit::{MockMqttClient, NodeHarness, RecordingDisplay};
    use std::time::Duration;

    type TestRuntime = NodeRuntime<MockMqttClient, FixedClock, RecordingDisplay>;

    fn runtime(harness: &NodeHarness) -> TestRuntime {
        NodeRuntime::new(
            NodeContext::new(harness.profile()),
            harness.topics().clone(),
            harness.mqtt_client.clone(),
            FixedClock::new("12:00:00"),
            harness.display.clone(),
        )
    }

    #[tokio::test]
    async fn test_commands_then_tick() {
        let harness = NodeHarness::new(NodeProfile::generator("gen_a".into()));
        let mut rt = runtime(&harness);

        let transition = rt.handle_command(b"RPM:1600").unwrap();
        assert_eq!(transition.state, "RUNNING");
        assert!(rt.handle_command(b"VOLT:12").is_none());
        rt.handle_command(b"FUEL:3");

        rt.publish_tick().await.unwrap();

        let record = harness.last_record().unwrap();
        assert_eq!(record.timestamp, "12:00:00");
        assert_eq!(record.state, "FAULT");
        assert_eq!(record.metric("rpm"), Some(&MetricValue::Int(1600)));
        assert_eq!(record.metric("output_v"), Some(&MetricValue::Float(480.0)));

        let message = &harness.mqtt_client.find_messages_by_topic("winter-river/gen_a/status")[0];
        assert_eq!(message.qos, Qos::AtMostOnce);
        assert!(!message.retain);

        assert_eq!(
            rt.stats(),
            RuntimeStats {
                commands_received: 3,
                commands_ignored: 1,
                records_published: 1,
                publish_failures: 0,
                frames_shown: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_non_utf8_payload_is_ignored() {
        let harness = NodeHarness::new(NodeProfile::ups("ups_a".into()));
        let mut rt = runtime(&harness);
        assert!(rt.handle_command(&[0xff, 0xfe, b':', b'1']).is_none());
        assert_eq!(rt.node().state(), "NORMAL");
    }

    #[tokio::test]
    async fn test_pdu_relays_heartbeat() {
        let mut harness = NodeHarness::new(NodeProfile::pdu("pdu_a".into()));
        harness
            .expect_messages("winter-river/pdu_a/status", 2)
            .expect_messages("winter-river", 2);
        let mut rt = runtime(&harness);

        rt.publish_tick().await.unwrap();
        rt.publish_tick().await.unwrap();

        harness.verify_expectations().unwrap();
        let relay = harness.mqtt_client.find_messages_by_topic("winter-river");
        assert_eq!(relay[0].text(), "MQTT Relay Successful: pdu_a");
        assert_eq!(
            harness.display.last_frame().unwrap().lines,
            vec!["pdu_a [NORMAL]", "480V 0%"]
        );
    }

    #[tokio::test]
    async fn test_link_down_skips_publish_but_updates_display() {
        let harness = NodeHarness::new(NodeProfile::transformer("trf_a".into()));
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting { attempt: 2 });
        let mut rt = runtime(&harness).with_link_state(state_rx);

        rt.handle_command(b"LOAD:80");
        rt.publish_tick().await.unwrap();
        assert!(harness.mqtt_client.get_published_messages().is_empty());
        let frame = harness.display.last_frame().unwrap();
        assert_eq!(frame.lines[0], "trf_a [WARNING]");
        assert_eq!(frame.lines.last().unwrap(), "MQTT:DISC Msgs:0");

        state_tx.send_replace(LinkState::Connected);
        rt.publish_tick().await.unwrap();
        harness.assert_state("WARNING").unwrap();
        harness.assert_metric("power_kva", &MetricValue::Float(400.0)).unwrap();
    }

    #[tokio::test]
    async fn test_status_line_counts_refreshes_not_commands() {
        let harness = NodeHarness::new(NodeProfile::switchgear("sw_a".into()));
        let mut rt = runtime(&harness);

        for _ in 0..3 {
            rt.publish_tick().await.unwrap();
        }
        rt.handle_command(b"LOAD:50");
        rt.handle_command(b"LOAD:60");
        rt.publish_tick().await.unwrap();

        let frame = harness.display.last_frame().unwrap();
        assert_eq!(frame.lines.last().unwrap(), "MQTT:OK Msgs:3");
        assert_eq!(rt.stats().frames_shown, 4);
        assert_eq!(rt.stats().commands_received, 2);
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let harness = NodeHarness::new(NodeProfile::server_rack("srv_a".into()));
        let mut rt = runtime(&harness);
        harness.mqtt_client.set_offline(true);

        let err = rt.publish_tick().await.unwrap_err();
        assert!(matches!(err, LinkError::Disconnected));
        assert_eq!(rt.stats().records_published, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_on_fast_cadence() {
        let harness = NodeHarness::new(NodeProfile::pdu("pdu_a".into()));
        let inbound = harness.mqtt_client.setup_receiver();
        let started = Instant::now();
        let task = tokio::spawn(runtime(&harness).run(inbound));

        assert!(harness.wait_for_record(500).await.unwrap().is_none());

        harness.send_command("LOAD:72").await.unwrap();
        let record = harness.wait_for_record(1_000).await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert_eq!(record.metric("load_pct"), Some(&MetricValue::Int(72)));
        assert_eq!(harness.mqtt_client.find_messages_by_topic("winter-river").len(), 1);

        harness.mqtt_client.close_inbound();
        let stats = task.await.unwrap();
        assert_eq!(stats.records_published, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_orders_commands_before_tick() {
        let harness = NodeHarness::new(NodeProfile::distribution("dist_a".into()));
        let inbound = harness.mqtt_client.setup_receiver();
        let rt = runtime(&harness);

        harness.send_command("UPS:300").await.unwrap();
        harness.send_command("INPUT:abc").await.unwrap();
        harness.send_command("hello").await.unwrap();
        let task = tokio::spawn(rt.run(inbound));

        // nothing before the first full interval
        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(harness.status_records().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let records = harness.status_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, "NO_INPUT");
        assert_eq!(records[0].metric("load_pct"), Some(&MetricValue::Int(89)));
        assert_eq!(records[0].metric("source"), Some(&MetricValue::Text("NONE".into())));

        harness.send_command("SOURCE:UTILITY").await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        harness.assert_state("FAULT").unwrap();

        harness.mqtt_client.close_inbound();
        let stats = task.await.unwrap();
        assert_eq!(stats.commands_received, 4);
        assert_eq!(stats.commands_ignored, 1);
        assert_eq!(stats.records_published, 2);
    }
}
