//! Gridnode Agent - runs simulated power-distribution nodes over MQTT
//!
//! Each configured node gets:
//! - its own broker connection (client id = node id, OFFLINE last will)
//! - a supervised link task forwarding control messages
//! - a single runtime task owning the node's metrics and state
//!
//! When a link exhausts its retry budget the agent waits `restart_delay_secs`
//! and exits non-zero so the service manager can restart it.

mod clock;
mod config;
mod display;
mod mqtt;
mod runtime;
mod supervisor;

use anyhow::{Context, Result};
use clock::SystemClock;
use config::AgentConfig;
use display::{NullDisplay, TracingDisplay};
use gridnode_core::{Clock, DisplayGeometry, DisplaySink, NodeContext, Topics};
use runtime::NodeRuntime;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "gridnode_agent=info,gridnode_core=info";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Gridnode agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load().await.context("Failed to load configuration")?;
    let policy = config.retry_policy();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(
        config.clock.utc_offset_secs,
        config.clock.dst_offset_secs,
    ));

    let mut tasks = JoinSet::new();
    for profile in config.profiles() {
        let node_id = profile.node_id.clone();
        let topics = Topics::new(&config.topic_prefix, &node_id);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let (publisher, link, link_state) = mqtt::connect(
            &config.mqtt,
            &config.link,
            policy,
            topics.clone(),
            &node_id,
            Arc::clone(&clock),
            inbound_tx,
        );

        let display: Box<dyn DisplaySink> = match profile.display.geometry {
            DisplayGeometry::None => Box::new(NullDisplay),
            _ => Box::new(TracingDisplay::new(node_id.clone())),
        };
        let runtime = NodeRuntime::new(NodeContext::new(profile), topics, publisher, Arc::clone(&clock), display)
            .with_link_state(link_state);

        tasks.spawn(async move { link.run().await.map_err(anyhow::Error::from) });
        tasks.spawn(async move {
            let stats = runtime.run(inbound_rx).await;
            info!(
                node = %node_id,
                received = stats.commands_received,
                published = stats.records_published,
                "Node runtime stopped"
            );
            Ok(())
        });
    }

    info!("Simulating {} node(s) via {}:{}", config.nodes.len(), config.mqtt.host, config.mqtt.port);

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("{:#}", e);
                warn!("Restarting in {:?}", policy.restart_delay);
                tokio::time::sleep(policy.restart_delay).await;
                return Err(e.context("Link supervisor gave up"));
            }
            Err(e) => return Err(e).context("Node task panicked"),
        }
    }
    Ok(())
}
