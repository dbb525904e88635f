//! Outbound command encoding: turns symbolic commands from the MQTT command
//! surface into ERP1 payloads.
//!
//! Payload builders are registered per EEP-id prefix, so `D2-05` covers all
//! blinds profiles while the empty prefix acts as the catch-all. The
//! longest matching prefix that produces a payload wins.

use serde_json::Value;

/// A command addressed to a configured device, as received on
/// `<prefix>/<device>/set` (or the brightness/position variants).
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub device: String,
    pub command: String,
    pub value: Option<Value>,
}

impl CommandRequest {
    pub fn new(device: &str, command: &str, value: Option<Value>) -> Self {
        CommandRequest {
            device: device.to_string(),
            command: command.to_string(),
            value,
        }
    }

    /// Parses an MQTT `set` payload: either a bare command string (`on`,
    /// `OFF`, `stop`) or a JSON object `{"command": ..., "value": ...}`.
    pub fn from_payload(device: &str, payload: &str) -> Self {
        if let Ok(Value::Object(object)) = serde_json::from_str(payload) {
            let command = object
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_lowercase();
            return CommandRequest {
                device: device.to_string(),
                command,
                value: object.get("value").cloned(),
            };
        }

        CommandRequest {
            device: device.to_string(),
            command: payload.trim().to_lowercase(),
            value: None,
        }
    }
}

type PayloadBuilder = Box<dyn Fn(&str, Option<&Value>) -> Option<Vec<u8>> + Send + Sync>;

pub struct CommandEncoder {
    builders: Vec<(String, PayloadBuilder)>,
}

impl Default for CommandEncoder {
    fn default() -> Self {
        CommandEncoder::new()
    }
}

impl CommandEncoder {
    pub fn new() -> Self {
        let mut encoder = CommandEncoder {
            builders: Vec::new(),
        };
        encoder.register("D2-05", blinds_payload);
        encoder.register("", switch_payload);
        encoder
    }

    pub fn register<F>(&mut self, eep_prefix: &str, builder: F)
    where
        F: Fn(&str, Option<&Value>) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.builders
            .push((eep_prefix.to_uppercase(), Box::new(builder)));
        self.builders
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
    }

    /// Builds the ERP1 payload for a command against a device's EEP.
    /// Returns None for commands no builder understands.
    pub fn encode(&self, eep_id: &str, command: &str, value: Option<&Value>) -> Option<Vec<u8>> {
        let eep_id = eep_id.to_uppercase();
        self.builders
            .iter()
            .filter(|(prefix, _)| eep_id.starts_with(prefix.as_str()))
            .find_map(|(_, builder)| builder(command, value))
    }
}

fn level_from(value: Option<&Value>, fallback: u64) -> u8 {
    value
        .and_then(Value::as_u64)
        .unwrap_or(fallback)
        .min(100) as u8
}

/// Electronic switch / dimmer actuators (D2-01 and the generic fallback).
fn switch_payload(command: &str, value: Option<&Value>) -> Option<Vec<u8>> {
    match command {
        "on" => Some(vec![0x01, 0x00, 0x00, 0x09]),
        "off" | "stop" => Some(vec![0x00, 0x00, 0x00, 0x08]),
        "dim" => Some(vec![0x02, level_from(value, 100), 0x00, 0x09]),
        _ => None,
    }
}

/// Blinds control (D2-05): CMD 1 "go to position", CMD 2 "stop".
fn blinds_payload(command: &str, value: Option<&Value>) -> Option<Vec<u8>> {
    match command {
        "position" => Some(vec![level_from(value, 0), 0x00, 0x00, 0x01]),
        "open" => Some(vec![0x00, 0x00, 0x00, 0x01]),
        "close" => Some(vec![0x64, 0x00, 0x00, 0x01]),
        "stop" => Some(vec![0x00, 0x00, 0x00, 0x02]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_payload_is_lowercased() {
        let request = CommandRequest::from_payload("lamp", "ON");
        assert_eq!(request.command, "on");
        assert!(request.value.is_none());
    }

    #[test]
    fn test_json_payload_carries_value() {
        let request = CommandRequest::from_payload("lamp", r#"{"command": "DIM", "value": 40}"#);
        assert_eq!(request.command, "dim");
        assert_eq!(request.value, Some(json!(40)));
    }

    #[test]
    fn test_switch_commands() {
        let encoder = CommandEncoder::new();
        assert_eq!(
            encoder.encode("D2-01-0F", "on", None),
            Some(vec![0x01, 0x00, 0x00, 0x09])
        );
        assert_eq!(
            encoder.encode("D2-01-0F", "off", None),
            Some(vec![0x00, 0x00, 0x00, 0x08])
        );
        assert_eq!(
            encoder.encode("D2-01-0F", "dim", Some(&json!(55))),
            Some(vec![0x02, 55, 0x00, 0x09])
        );
        assert_eq!(encoder.encode("D2-01-0F", "dance", None), None);
    }

    #[test]
    fn test_dim_level_is_clamped() {
        let encoder = CommandEncoder::new();
        assert_eq!(
            encoder.encode("A5-38-08", "dim", Some(&json!(250))),
            Some(vec![0x02, 100, 0x00, 0x09])
        );
        assert_eq!(
            encoder.encode("A5-38-08", "dim", None),
            Some(vec![0x02, 100, 0x00, 0x09])
        );
    }

    #[test]
    fn test_blinds_override_generic_stop() {
        let encoder = CommandEncoder::new();
        assert_eq!(
            encoder.encode("D2-05-00", "stop", None),
            Some(vec![0x00, 0x00, 0x00, 0x02])
        );
        assert_eq!(
            encoder.encode("D2-05-00", "position", Some(&json!(42))),
            Some(vec![42, 0x00, 0x00, 0x01])
        );
        // Other profiles still get the generic stop encoding.
        assert_eq!(
            encoder.encode("D2-01-0F", "stop", None),
            Some(vec![0x00, 0x00, 0x00, 0x08])
        );
    }

    #[test]
    fn test_custom_builder_takes_precedence() {
        let mut encoder = CommandEncoder::new();
        encoder.register("D2-01-0F", |command, _| {
            (command == "on").then(|| vec![0xAA])
        });
        assert_eq!(encoder.encode("D2-01-0F", "on", None), Some(vec![0xAA]));
        // Unhandled commands fall through to the shorter-prefix builders.
        assert_eq!(
            encoder.encode("D2-01-0F", "off", None),
            Some(vec![0x00, 0x00, 0x00, 0x08])
        );
        assert_eq!(encoder.encode("D2-01-00", "on", None), Some(vec![0x01, 0x00, 0x00, 0x09]));
    }
}
