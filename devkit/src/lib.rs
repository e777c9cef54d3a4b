/*!
# Gridnode DevKit - test doubles for node runtimes

Lets the agent's runtime be exercised without a broker:
- `MockMqttClient`: records every publish, feeds simulated control messages
- `NodeHarness`: decodes published telemetry and asserts on it
- `RecordingDisplay`: captures rendered display frames
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockMessage, MockMqttClient};
pub use test_utils::{NodeHarness, RecordingDisplay, TestStats};
