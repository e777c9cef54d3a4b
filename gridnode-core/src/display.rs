//! Projection of a node onto its small local display.
//!
//! Purely derived from the node's metrics and state; nothing rendered here
//! ever feeds back into the simulation.

use crate::machine::NodeContext;
use crate::metrics::MetricValue;
use serde::{Deserialize, Serialize};

/// Physical display attached to a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayGeometry {
    /// 128x64 SSD1306 at text size 1
    Oled,
    /// 16x2 character LCD
    Lcd,
    None,
}

impl DisplayGeometry {
    pub fn columns(&self) -> usize {
        match self {
            DisplayGeometry::Oled => 21,
            DisplayGeometry::Lcd => 16,
            DisplayGeometry::None => 0,
        }
    }

    pub fn rows(&self) -> usize {
        match self {
            DisplayGeometry::Oled => 8,
            DisplayGeometry::Lcd => 2,
            DisplayGeometry::None => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayField {
    pub metric: &'static str,
    pub suffix: &'static str,
}

/// A labelled line of one or more metrics (`Load: 137kW 36%`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayLine {
    pub label: &'static str,
    pub fields: Vec<DisplayField>,
}

impl DisplayLine {
    pub fn new(label: &'static str) -> Self {
        Self { label, fields: Vec::new() }
    }

    pub fn field(mut self, metric: &'static str, suffix: &'static str) -> Self {
        self.fields.push(DisplayField { metric, suffix });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayLayout {
    pub geometry: DisplayGeometry,
    pub lines: Vec<DisplayLine>,
}

impl DisplayLayout {
    pub fn oled(lines: Vec<DisplayLine>) -> Self {
        Self { geometry: DisplayGeometry::Oled, lines }
    }
}

/// Link information shown alongside the metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub connected: bool,
    /// Earlier display refreshes, shown as `Msgs:`
    pub messages: u64,
}

/// Rendered text, one entry per display row
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplayFrame {
    pub lines: Vec<String>,
}

impl DisplayFrame {
    pub fn render(node: &NodeContext, link: LinkStatus) -> Self {
        let layout = &node.profile().display;
        let geometry = layout.geometry;
        let cols = geometry.columns();

        let mut lines = Vec::new();
        match geometry {
            DisplayGeometry::None => {}
            DisplayGeometry::Oled => {
                lines.push(header(&node.profile().node_id, node.state(), cols));
                for line in &layout.lines {
                    lines.push(fit(render_line(node, line), cols));
                }
                lines.push(fit(
                    format!(
                        "MQTT:{} Msgs:{}",
                        if link.connected { "OK" } else { "DISC" },
                        link.messages
                    ),
                    cols,
                ));
            }
            DisplayGeometry::Lcd => {
                lines.push(header(&node.profile().node_id, node.state(), cols));
                let metrics = layout
                    .lines
                    .iter()
                    .map(|line| render_line(node, line))
                    .collect::<Vec<_>>()
                    .join(" ");
                lines.push(fit(metrics.trim().to_string(), cols));
            }
        }
        lines.truncate(geometry.rows());
        Self { lines }
    }
}

/// `id [STATE]`, shortening the state until it fits
fn header(node_id: &str, state: &str, cols: usize) -> String {
    let full = format!("{} [{}]", node_id, state);
    if full.chars().count() <= cols {
        return full;
    }
    let room = cols.saturating_sub(node_id.chars().count() + 3);
    if room == 0 {
        return fit(node_id.to_string(), cols);
    }
    let short: String = state.chars().take(room).collect();
    format!("{} [{}]", node_id, short)
}

fn render_line(node: &NodeContext, line: &DisplayLine) -> String {
    let values = line
        .fields
        .iter()
        .map(|field| {
            let value = match node.metrics().get(field.metric) {
                // whole units only
                Some(MetricValue::Float(v)) => format!("{}", *v as i64),
                Some(MetricValue::Bool(true)) => "CLOSED".to_string(),
                Some(MetricValue::Bool(false)) => "OPEN".to_string(),
                Some(other) => other.to_string(),
                None => "-".to_string(),
            };
            format!("{}{}", value, field.suffix)
        })
        .collect::<Vec<_>>()
        .join(" ");

    if line.label.is_empty() {
        values
    } else {
        format!("{} {}", line.label, values)
    }
}

fn fit(text: String, cols: usize) -> String {
    if text.chars().count() <= cols {
        text
    } else {
        text.chars().take(cols).collect()
    }
}
