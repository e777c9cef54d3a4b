//! Narrow interfaces to the node's external collaborators.
//!
//! The engine never talks to a broker, a wall clock or a screen directly.
//! The runtime hands it implementations of these traits, so the simulation
//! can be driven entirely in-process by tests.

use crate::display::DisplayFrame;
use async_trait::async_trait;
use std::sync::Arc;

/// Timestamp published while wall-clock time is unavailable
pub const UNSYNCED_TIMESTAMP: &str = "00:00:00";

/// Delivery guarantee requested for one publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Link is not connected")]
    Disconnected,
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// Outbound side of the messaging link
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, qos: Qos, retain: bool, payload: Vec<u8>) -> Result<(), LinkError>;
}

/// Requests queued from inside the link's event loop, where awaiting the
/// client would deadlock. Failures mean the request was never queued.
pub trait SessionRequests: Send + Sync {
    fn queue_publish(&self, topic: &str, qos: Qos, retain: bool, payload: Vec<u8>) -> Result<(), LinkError>;
    fn queue_subscribe(&self, topic: &str, qos: Qos) -> Result<(), LinkError>;
}

/// Source of `HH:MM:SS` timestamps
pub trait Clock: Send + Sync {
    fn timestamp(&self) -> String;
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn timestamp(&self) -> String {
        (**self).timestamp()
    }
}

/// Clock that always reports the same time
#[derive(Debug, Clone)]
pub struct FixedClock(pub String);

impl FixedClock {
    pub fn new(timestamp: impl Into<String>) -> Self {
        Self(timestamp.into())
    }

    pub fn unsynced() -> Self {
        Self(UNSYNCED_TIMESTAMP.to_string())
    }
}

impl Clock for FixedClock {
    fn timestamp(&self) -> String {
        self.0.clone()
    }
}

/// Receives a freshly rendered frame on every tick
pub trait DisplaySink: Send {
    fn show(&mut self, frame: &DisplayFrame);
}

impl<T: DisplaySink + ?Sized> DisplaySink for Box<T> {
    fn show(&mut self, frame: &DisplayFrame) {
        (**self).show(frame)
    }
}
