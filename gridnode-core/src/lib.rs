//! Gridnode Core - simulation engine shared by every grid node
//!
//! One engine, parameterized by a per-kind `NodeProfile`, drives every node:
//! - `command`: text command grammar (`VERB:VALUE` or bare keyword)
//! - `profile`: static per-node-type configuration and threshold tables
//! - `machine`: metric mutation and state derivation
//! - `telemetry`: the flat JSON record published on every tick
//! - `presence`: retained ONLINE/OFFLINE records and topic layout
//! - `display`: projection of a node onto a small text display
//! - `io`: narrow interfaces to the link, clock and display collaborators

pub mod command;
pub mod display;
pub mod io;
pub mod machine;
pub mod metrics;
pub mod numeric;
pub mod presence;
pub mod profile;
pub mod telemetry;

pub use command::{parse, Command};
pub use display::{DisplayFrame, DisplayGeometry, LinkStatus};
pub use io::{Clock, DisplaySink, FixedClock, LinkError, Publisher, Qos, SessionRequests, UNSYNCED_TIMESTAMP};
pub use machine::{derive_state, Derived, NodeContext, Transition};
pub use metrics::{MetricKind, MetricSpec, MetricValue, NodeMetrics};
pub use presence::{Presence, PresenceRecord, Topics};
pub use profile::{NodeKind, NodeProfile, ProfileError};
pub use telemetry::{TelemetryError, TelemetryRecord};
