//! Node profiles: the static description of each node type.
//!
//! A profile carries everything that differs between node types:
//! rated values, the metric schema, the accepted verbs, the ordered
//! threshold table and the telemetry layout. Profiles are immutable once built
//! and are shared read-only (`Arc<NodeProfile>`) by every component.

use crate::display::{DisplayGeometry, DisplayLayout, DisplayLine};
use crate::metrics::{MetricSpec, MetricValue, NodeMetrics};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default telemetry cadence
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(5);
/// Cadence of bus-bar-adjacent relay nodes
pub const FAST_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Unknown node kind: {0}")]
    UnknownKind(String),
}

/// The eight roles of the simulated distribution hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Utility,
    Transformer,
    Switchgear,
    Generator,
    Distribution,
    Ups,
    Pdu,
    ServerRack,
}

impl NodeKind {
    pub const ALL: [NodeKind; 8] = [
        NodeKind::Utility,
        NodeKind::Transformer,
        NodeKind::Switchgear,
        NodeKind::Generator,
        NodeKind::Distribution,
        NodeKind::Ups,
        NodeKind::Pdu,
        NodeKind::ServerRack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Utility => "utility",
            NodeKind::Transformer => "transformer",
            NodeKind::Switchgear => "switchgear",
            NodeKind::Generator => "generator",
            NodeKind::Distribution => "distribution",
            NodeKind::Ups => "ups",
            NodeKind::Pdu => "pdu",
            NodeKind::ServerRack => "server_rack",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProfileError::UnknownKind(s.to_string()))
    }
}

/// Predicate over current metrics (and the state they are evaluated against)
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Always,
    /// metric > limit
    Above(&'static str, f64),
    /// metric < limit
    Below(&'static str, f64),
    /// metric == value
    Equals(&'static str, f64),
    /// metric < low || metric > high
    Outside(&'static str, f64, f64),
    StateIs(&'static str),
    Any(Vec<Condition>),
    All(Vec<Condition>),
}

impl Condition {
    pub fn holds(&self, metrics: &NodeMetrics, state: &str) -> bool {
        match self {
            Condition::Always => true,
            Condition::Above(name, limit) => metrics.number(name) > *limit,
            Condition::Below(name, limit) => metrics.number(name) < *limit,
            Condition::Equals(name, value) => metrics.number(name) == *value,
            Condition::Outside(name, low, high) => {
                let v = metrics.number(name);
                v < *low || v > *high
            }
            Condition::StateIs(expected) => state == *expected,
            Condition::Any(all) => all.iter().any(|c| c.holds(metrics, state)),
            Condition::All(all) => all.iter().all(|c| c.holds(metrics, state)),
        }
    }
}

/// One row of a threshold table: when `when` holds the node enters `state`
/// and the listed metrics are forced.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub state: &'static str,
    pub when: Condition,
    pub sets: Vec<(&'static str, MetricValue)>,
}

impl Rule {
    pub fn new(state: &'static str, when: Condition) -> Self {
        Self { state, when, sets: Vec::new() }
    }

    pub fn setting(mut self, metric: &'static str, value: MetricValue) -> Self {
        self.sets.push((metric, value));
        self
    }
}

/// State used when no rule matches and the current state is not sticky
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    Normal(&'static str),
    Unchanged,
}

/// What happens right after a raw `STATUS:` override
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverridePolicy {
    /// The threshold table runs immediately and may replace the override
    Reevaluate,
    /// The override stands until the next non-STATUS command
    Hold,
}

/// How a verb's value is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbForm {
    /// Numeric value stored in the named metric (int or float per schema)
    Number(&'static str),
    /// Literal text stored in the named metric
    Text(&'static str),
    /// Literal text written over the state field
    Status,
    /// Bare keyword, the whole message must equal it
    Keyword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerbSpec {
    pub keyword: &'static str,
    pub form: VerbForm,
}

impl VerbSpec {
    /// `LOAD:` style verb; `keyword` excludes the colon
    pub fn number(keyword: &'static str, metric: &'static str) -> Self {
        Self { keyword, form: VerbForm::Number(metric) }
    }

    pub fn text(keyword: &'static str, metric: &'static str) -> Self {
        Self { keyword, form: VerbForm::Text(metric) }
    }

    pub fn status() -> Self {
        Self { keyword: "STATUS", form: VerbForm::Status }
    }

    pub fn keyword(keyword: &'static str) -> Self {
        Self { keyword, form: VerbForm::Keyword }
    }
}

/// Nameplate ratings used by derived-field recomputation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatedValues {
    pub voltage: f64,
    pub power_kw: Option<f64>,
    pub capacity_kva: Option<f64>,
    pub frequency_hz: Option<f64>,
}

impl RatedValues {
    pub fn voltage(voltage: f64) -> Self {
        Self { voltage, power_kw: None, capacity_kva: None, frequency_hz: None }
    }
}

/// Constant field appended to every telemetry record
#[derive(Debug, Clone, PartialEq)]
pub struct RatedField {
    pub key: &'static str,
    pub value: MetricValue,
}

#[derive(Debug, Clone)]
pub struct NodeProfile {
    pub node_id: String,
    pub kind: NodeKind,
    pub rated_values: RatedValues,
    pub metric_schema: Vec<MetricSpec>,
    pub verbs: Vec<VerbSpec>,
    pub threshold_rules: Vec<Rule>,
    pub sticky_states: Vec<&'static str>,
    pub fallback: Fallback,
    pub override_policy: OverridePolicy,
    pub initial_state: &'static str,
    /// Documented closed set; overrides outside it are still accepted
    pub states: Vec<&'static str>,
    /// Telemetry key carrying the state (`state`, or `status` on transformers)
    pub state_key: &'static str,
    pub rated_fields: Vec<RatedField>,
    pub publish_interval: Duration,
    pub display: DisplayLayout,
    /// Also publish the legacy `MQTT Relay Successful: <id>` line each tick
    pub relay_heartbeat: bool,
}

impl NodeProfile {
    pub fn for_kind(kind: NodeKind, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        match kind {
            NodeKind::Utility => Self::utility(node_id),
            NodeKind::Transformer => Self::transformer(node_id),
            NodeKind::Switchgear => Self::switchgear(node_id),
            NodeKind::Generator => Self::generator(node_id),
            NodeKind::Distribution => Self::distribution(node_id),
            NodeKind::Ups => Self::ups(node_id),
            NodeKind::Pdu => Self::pdu(node_id),
            NodeKind::ServerRack => Self::server_rack(node_id),
        }
    }

    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = interval;
        self
    }

    pub fn with_display(mut self, geometry: DisplayGeometry) -> Self {
        self.display.geometry = geometry;
        self
    }

    pub fn verb(&self, keyword: &str) -> Option<&VerbSpec> {
        self.verbs.iter().find(|v| v.keyword == keyword)
    }

    pub fn is_documented_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| *s == state)
    }

    /// MV utility feed: 230 kV, 60 Hz, three phase
    pub fn utility(node_id: String) -> Self {
        let rated_kv = 230.0;
        Self {
            node_id,
            kind: NodeKind::Utility,
            rated_values: RatedValues {
                frequency_hz: Some(60.0),
                ..RatedValues::voltage(rated_kv)
            },
            metric_schema: vec![
                MetricSpec::float("v_out", rated_kv),
                MetricSpec::float("freq_hz", 60.0),
                MetricSpec::int("load_pct", 12),
            ],
            verbs: vec![
                VerbSpec::status(),
                VerbSpec::number("VOLT", "v_out"),
                VerbSpec::number("FREQ", "freq_hz"),
                VerbSpec::number("LOAD", "load_pct"),
            ],
            threshold_rules: vec![
                Rule::new("OUTAGE", Condition::Equals("v_out", 0.0)),
                Rule::new("SAG", Condition::Below("v_out", rated_kv * 0.90)),
                Rule::new("SWELL", Condition::Above("v_out", rated_kv * 1.10)),
                Rule::new("FAULT", Condition::Outside("freq_hz", 59.3, 60.7)),
            ],
            sticky_states: Vec::new(),
            fallback: Fallback::Normal("GRID_OK"),
            override_policy: OverridePolicy::Hold,
            initial_state: "GRID_OK",
            states: vec!["GRID_OK", "SAG", "SWELL", "OUTAGE", "FAULT"],
            state_key: "state",
            rated_fields: vec![
                RatedField { key: "voltage_kv", value: MetricValue::Float(rated_kv) },
                RatedField { key: "phase", value: MetricValue::Int(3) },
            ],
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            display: DisplayLayout::oled(vec![
                DisplayLine::new("Vout:").field("v_out", "kV"),
                DisplayLine::new("Freq:").field("freq_hz", "Hz"),
                DisplayLine::new("Load:").field("load_pct", "%"),
            ]),
            relay_heartbeat: false,
        }
    }

    /// 480 V, 500 kVA step-down transformer
    pub fn transformer(node_id: String) -> Self {
        Self {
            node_id,
            kind: NodeKind::Transformer,
            rated_values: RatedValues {
                capacity_kva: Some(500.0),
                ..RatedValues::voltage(480.0)
            },
            metric_schema: vec![
                MetricSpec::int("load", 45),
                MetricSpec::float("power_kva", 225.0),
                MetricSpec::int("temp_f", 108),
            ],
            verbs: vec![
                VerbSpec::number("LOAD", "load"),
                VerbSpec::number("TEMP", "temp_f"),
                VerbSpec::status(),
            ],
            threshold_rules: vec![
                Rule::new(
                    "FAULT",
                    Condition::Any(vec![
                        Condition::Above("load", 90.0),
                        Condition::Above("temp_f", 185.0),
                    ]),
                ),
                Rule::new(
                    "WARNING",
                    Condition::Any(vec![
                        Condition::Above("load", 75.0),
                        Condition::Above("temp_f", 149.0),
                    ]),
                ),
            ],
            sticky_states: Vec::new(),
            fallback: Fallback::Normal("NORMAL"),
            override_policy: OverridePolicy::Reevaluate,
            initial_state: "NORMAL",
            states: vec!["NORMAL", "WARNING", "FAULT"],
            state_key: "status",
            rated_fields: vec![RatedField { key: "voltage", value: MetricValue::Int(480) }],
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            display: DisplayLayout::oled(vec![
                DisplayLine::new("Load:").field("load", "%").field("power_kva", "kVA"),
                DisplayLine::new("Temp:").field("temp_f", "F"),
            ]),
            relay_heartbeat: false,
        }
    }

    /// 480 V main switchgear with a tripping breaker
    pub fn switchgear(node_id: String) -> Self {
        Self {
            node_id,
            kind: NodeKind::Switchgear,
            rated_values: RatedValues::voltage(480.0),
            metric_schema: vec![
                MetricSpec::flag("breaker", true),
                MetricSpec::float("current_a", 120.5),
                MetricSpec::float("load_kw", 86.5),
                MetricSpec::int("load_pct", 35),
            ],
            verbs: vec![
                VerbSpec::keyword("OPEN"),
                VerbSpec::keyword("CLOSE"),
                VerbSpec::number("LOAD", "load_pct"),
                VerbSpec::status(),
            ],
            threshold_rules: vec![
                Rule::new(
                    "TRIPPED",
                    Condition::Any(vec![
                        Condition::Above("current_a", 280.0),
                        Condition::Above("load_pct", 95.0),
                    ]),
                )
                .setting("breaker", MetricValue::Bool(false)),
                Rule::new(
                    "FAULT",
                    Condition::Any(vec![
                        Condition::Above("current_a", 220.0),
                        Condition::Above("load_pct", 80.0),
                    ]),
                ),
            ],
            sticky_states: Vec::new(),
            fallback: Fallback::Unchanged,
            override_policy: OverridePolicy::Reevaluate,
            initial_state: "CLOSED",
            states: vec!["CLOSED", "OPEN", "TRIPPED", "FAULT"],
            state_key: "state",
            rated_fields: vec![RatedField { key: "voltage", value: MetricValue::Int(480) }],
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            display: DisplayLayout::oled(vec![
                DisplayLine::new("Brkr:").field("breaker", ""),
                DisplayLine::new("Amps:").field("current_a", "A"),
                DisplayLine::new("Load:").field("load_kw", "kW").field("load_pct", "%"),
            ]),
            relay_heartbeat: false,
        }
    }

    /// 480 V standby generator
    pub fn generator(node_id: String) -> Self {
        let rated_v = 480.0;
        Self {
            node_id,
            kind: NodeKind::Generator,
            rated_values: RatedValues::voltage(rated_v),
            metric_schema: vec![
                MetricSpec::int("fuel_pct", 85),
                MetricSpec::int("rpm", 0),
                MetricSpec::float("output_v", 0.0),
                MetricSpec::int("load_pct", 0),
            ],
            verbs: vec![
                VerbSpec::number("FUEL", "fuel_pct"),
                VerbSpec::number("RPM", "rpm"),
                VerbSpec::number("LOAD", "load_pct"),
                VerbSpec::status(),
            ],
            threshold_rules: vec![
                Rule::new(
                    "FAULT",
                    Condition::Any(vec![
                        Condition::Below("fuel_pct", 5.0),
                        Condition::All(vec![
                            Condition::StateIs("RUNNING"),
                            Condition::Below("rpm", 800.0),
                        ]),
                    ]),
                ),
                Rule::new("RUNNING", Condition::Above("rpm", 1500.0))
                    .setting("output_v", MetricValue::Float(rated_v)),
                Rule::new("STARTING", Condition::Above("rpm", 0.0)),
                Rule::new("STANDBY", Condition::Always)
                    .setting("output_v", MetricValue::Float(0.0)),
            ],
            sticky_states: Vec::new(),
            fallback: Fallback::Normal("STANDBY"),
            override_policy: OverridePolicy::Reevaluate,
            initial_state: "STANDBY",
            states: vec!["STANDBY", "STARTING", "RUNNING", "FAULT"],
            state_key: "state",
            rated_fields: vec![RatedField { key: "voltage", value: MetricValue::Int(480) }],
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            display: DisplayLayout::oled(vec![
                DisplayLine::new("Fuel:").field("fuel_pct", "%"),
                DisplayLine::new("RPM: ").field("rpm", ""),
                DisplayLine::new("Vout:").field("output_v", "V"),
                DisplayLine::new("Load:").field("load_pct", "%"),
            ]),
            relay_heartbeat: false,
        }
    }

    /// Main LV distribution board: 480 V, 384 kW
    pub fn distribution(node_id: String) -> Self {
        let rated_v = 480.0;
        Self {
            node_id,
            kind: NodeKind::Distribution,
            rated_values: RatedValues {
                power_kw: Some(384.0),
                ..RatedValues::voltage(rated_v)
            },
            metric_schema: vec![
                MetricSpec::float("input_v", rated_v),
                MetricSpec::float("ups_load_kw", 95.0),
                MetricSpec::float("mech_load_kw", 42.0),
                MetricSpec::float("total_load_kw", 137.0),
                MetricSpec::int("load_pct", 36),
                MetricSpec::text("source", "UTILITY"),
            ],
            verbs: vec![
                VerbSpec::number("INPUT", "input_v"),
                VerbSpec::number("UPS", "ups_load_kw"),
                VerbSpec::number("MECH", "mech_load_kw"),
                VerbSpec::text("SOURCE", "source"),
                VerbSpec::status(),
            ],
            threshold_rules: vec![
                Rule::new("NO_INPUT", Condition::Below("input_v", rated_v * 0.10)),
                Rule::new("OVERLOAD", Condition::Above("load_pct", 95.0)),
                Rule::new("FAULT", Condition::Above("load_pct", 85.0)),
            ],
            sticky_states: vec!["NO_INPUT"],
            fallback: Fallback::Normal("NORMAL"),
            override_policy: OverridePolicy::Reevaluate,
            initial_state: "NORMAL",
            states: vec!["NORMAL", "OVERLOAD", "FAULT", "NO_INPUT"],
            state_key: "state",
            rated_fields: vec![RatedField { key: "voltage", value: MetricValue::Float(rated_v) }],
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            display: DisplayLayout::oled(vec![
                DisplayLine::new("Vin: ").field("input_v", "V"),
                DisplayLine::new("Load:").field("total_load_kw", "kW").field("load_pct", "%"),
                DisplayLine::new("Src: ").field("source", ""),
            ]),
            relay_heartbeat: false,
        }
    }

    /// 480 V double-conversion UPS
    pub fn ups(node_id: String) -> Self {
        Self {
            node_id,
            kind: NodeKind::Ups,
            rated_values: RatedValues::voltage(480.0),
            metric_schema: vec![
                MetricSpec::int("battery_pct", 100),
                MetricSpec::int("load_pct", 40),
                MetricSpec::float("input_v", 480.0),
                MetricSpec::float("output_v", 480.0),
            ],
            verbs: vec![
                VerbSpec::number("BATT", "battery_pct"),
                VerbSpec::number("LOAD", "load_pct"),
                VerbSpec::number("INPUT", "input_v"),
                VerbSpec::status(),
            ],
            threshold_rules: vec![
                Rule::new(
                    "FAULT",
                    Condition::Any(vec![
                        Condition::Below("battery_pct", 10.0),
                        Condition::Below("input_v", 400.0),
                    ]),
                ),
                Rule::new(
                    "ON_BATTERY",
                    Condition::Any(vec![
                        Condition::Below("battery_pct", 25.0),
                        Condition::Below("input_v", 440.0),
                    ]),
                ),
            ],
            sticky_states: Vec::new(),
            fallback: Fallback::Unchanged,
            override_policy: OverridePolicy::Reevaluate,
            initial_state: "NORMAL",
            states: vec!["NORMAL", "ON_BATTERY", "CHARGING", "FAULT"],
            state_key: "state",
            rated_fields: vec![RatedField { key: "voltage", value: MetricValue::Int(480) }],
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            display: DisplayLayout::oled(vec![
                DisplayLine::new("Batt:").field("battery_pct", "%"),
                DisplayLine::new("Vin: ").field("input_v", "V"),
                DisplayLine::new("Load:").field("load_pct", "%"),
            ]),
            relay_heartbeat: false,
        }
    }

    /// Rack power-distribution unit on a 16x2 LCD; relays a heartbeat every second
    pub fn pdu(node_id: String) -> Self {
        let rated_v = 480.0;
        Self {
            node_id,
            kind: NodeKind::Pdu,
            rated_values: RatedValues::voltage(rated_v),
            metric_schema: vec![
                MetricSpec::float("input_v", rated_v),
                MetricSpec::int("load_pct", 0),
            ],
            verbs: vec![
                VerbSpec::number("INPUT", "input_v"),
                VerbSpec::number("LOAD", "load_pct"),
                VerbSpec::status(),
            ],
            threshold_rules: Vec::new(),
            sticky_states: Vec::new(),
            fallback: Fallback::Unchanged,
            override_policy: OverridePolicy::Reevaluate,
            initial_state: "NORMAL",
            states: vec!["NORMAL"],
            state_key: "state",
            rated_fields: vec![RatedField { key: "voltage", value: MetricValue::Int(480) }],
            publish_interval: FAST_PUBLISH_INTERVAL,
            display: DisplayLayout {
                geometry: DisplayGeometry::Lcd,
                lines: vec![DisplayLine::new("").field("input_v", "V").field("load_pct", "%")],
            },
            relay_heartbeat: true,
        }
    }

    /// 208 V server rack
    pub fn server_rack(node_id: String) -> Self {
        Self {
            node_id,
            kind: NodeKind::ServerRack,
            rated_values: RatedValues::voltage(208.0),
            metric_schema: vec![
                MetricSpec::int("cpu_pct", 42),
                MetricSpec::int("inlet_f", 75),
                MetricSpec::float("power_kw", 3.2),
                MetricSpec::int("units", 8),
            ],
            verbs: vec![
                VerbSpec::number("CPU", "cpu_pct"),
                VerbSpec::number("TEMP", "inlet_f"),
                VerbSpec::number("UNITS", "units"),
                VerbSpec::status(),
            ],
            threshold_rules: vec![
                Rule::new(
                    "FAULT",
                    Condition::Any(vec![
                        Condition::Above("inlet_f", 95.0),
                        Condition::Above("cpu_pct", 95.0),
                    ]),
                ),
                Rule::new(
                    "THROTTLED",
                    Condition::Any(vec![
                        Condition::Above("inlet_f", 85.0),
                        Condition::Above("cpu_pct", 80.0),
                    ]),
                ),
            ],
            sticky_states: Vec::new(),
            fallback: Fallback::Normal("NORMAL"),
            override_policy: OverridePolicy::Reevaluate,
            initial_state: "NORMAL",
            states: vec!["NORMAL", "THROTTLED", "FAULT"],
            state_key: "state",
            rated_fields: vec![RatedField { key: "voltage", value: MetricValue::Int(208) }],
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            display: DisplayLayout::oled(vec![
                DisplayLine::new("CPU: ").field("cpu_pct", "%").field("units", "u"),
                DisplayLine::new("Temp:").field("inlet_f", "F"),
                DisplayLine::new("Pwr: ").field("power_kw", "kW"),
            ]),
            relay_heartbeat: false,
        }
    }
}
