//! Display sinks for hosts without a physical screen.

use gridnode_core::{DisplayFrame, DisplaySink};
use tracing::debug;

/// Logs a frame whenever its text differs from the previous one
#[derive(Debug)]
pub struct TracingDisplay {
    node_id: String,
    last: Option<DisplayFrame>,
}

impl TracingDisplay {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self { node_id: node_id.into(), last: None }
    }
}

impl DisplaySink for TracingDisplay {
    fn show(&mut self, frame: &DisplayFrame) {
        if self.last.as_ref() == Some(frame) {
            return;
        }
        debug!(node = %self.node_id, "Display: {}", frame.lines.join(" | "));
        self.last = Some(frame.clone());
    }
}

pub struct NullDisplay;

impl DisplaySink for NullDisplay {
    fn show(&mut self, _frame: &DisplayFrame) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_display_remembers_last_frame() {
        let mut display = TracingDisplay::new("gen_a");
        let frame = DisplayFrame { lines: vec!["gen_a [STANDBY]".into()] };
        display.show(&frame);
        display.show(&frame);
        assert_eq!(display.last, Some(frame));

        let next = DisplayFrame { lines: vec!["gen_a [RUNNING]".into()] };
        display.show(&next);
        assert_eq!(display.last, Some(next));
    }
}
