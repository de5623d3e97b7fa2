//! Routes decoded PUBLISH messages into the two telemetry domains.

use serde::Deserialize;
use tracing::debug;

use super::message_manager::{BrightnessSample, PumpLogEntry};
use crate::mqtt::PublishMessage;

/// Classification result for one incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    PumpLog(PumpLogEntry),
    Brightness(BrightnessSample),
    /// Environment topic whose payload did not parse; dropped.
    Unrecognized,
}

/// Shape of the JSON the brightness sensor publishes.
#[derive(Debug, Deserialize)]
struct BrightnessPayload {
    brightness: f64,
    description: String,
}

/// Classifies one message by topic and payload.
///
/// Messages on an `env/` topic containing `brightness` must carry a JSON
/// object with a numeric `brightness` and a string `description`; anything
/// that fails to parse is `Unrecognized` and silently dropped so a single
/// bad payload never interrupts the stream. Every other topic is treated
/// as a pump log line, with malformed UTF-8 replaced by an empty string
/// rather than failing.
pub fn classify(message: &PublishMessage) -> Classified {
    if message.topic.starts_with("env/") && message.topic.contains("brightness") {
        match serde_json::from_slice::<BrightnessPayload>(&message.payload) {
            Ok(payload) if payload.brightness >= 0.0 => {
                Classified::Brightness(BrightnessSample {
                    timestamp: message.received_at,
                    brightness: payload.brightness,
                    description: payload.description,
                })
            }
            Ok(payload) => {
                debug!(
                    "dropping negative brightness {} on {}",
                    payload.brightness, message.topic
                );
                Classified::Unrecognized
            }
            Err(e) => {
                debug!("unparseable environment payload on {}: {}", message.topic, e);
                Classified::Unrecognized
            }
        }
    } else {
        let raw_message = String::from_utf8(message.payload.clone()).unwrap_or_default();
        Classified::PumpLog(PumpLogEntry {
            timestamp: message.received_at,
            topic: message.topic.clone(),
            raw_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    fn message(topic: &str, payload: &[u8]) -> PublishMessage {
        PublishMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            received_at: Local::now(),
        }
    }

    #[test]
    fn valid_brightness_payload_becomes_sample() {
        let msg = message(
            "env/1/brightness",
            br#"{"brightness": 842.5, "description": "bright"}"#,
        );
        match classify(&msg) {
            Classified::Brightness(sample) => {
                assert_eq!(sample.brightness, 842.5);
                assert_eq!(sample.description, "bright");
            }
            other => panic!("expected Brightness, got {:?}", other),
        }
    }

    #[test]
    fn missing_fields_are_unrecognized_not_a_panic() {
        let cases: &[&[u8]] = &[
            br#"{"brightness": 10.0}"#,
            br#"{"description": "dark"}"#,
            br#"{"brightness": "very", "description": "dark"}"#,
            br#"not json at all"#,
            br#"[1, 2, 3]"#,
            b"",
        ];
        for payload in cases {
            let msg = message("env/1/brightness", payload);
            assert_eq!(classify(&msg), Classified::Unrecognized);
        }
    }

    #[test]
    fn negative_brightness_is_dropped() {
        let msg = message(
            "env/1/brightness",
            br#"{"brightness": -3.0, "description": "broken sensor"}"#,
        );
        assert_eq!(classify(&msg), Classified::Unrecognized);
    }

    #[test]
    fn env_topic_without_brightness_is_a_pump_log() {
        let msg = message("env/1/humidity", b"62.1");
        assert!(matches!(classify(&msg), Classified::PumpLog(_)));
    }

    #[test]
    fn device_log_topics_keep_raw_text() {
        let msg = message("esp_log/1", b"pump started, duty 2500us");
        match classify(&msg) {
            Classified::PumpLog(entry) => {
                assert_eq!(entry.topic, "esp_log/1");
                assert_eq!(entry.raw_message, "pump started, duty 2500us");
            }
            other => panic!("expected PumpLog, got {:?}", other),
        }
    }

    #[test]
    fn malformed_utf8_becomes_empty_placeholder() {
        let msg = message("esp_log/1", &[0xFF, 0xFE, 0xFD]);
        match classify(&msg) {
            Classified::PumpLog(entry) => assert_eq!(entry.raw_message, ""),
            other => panic!("expected PumpLog, got {:?}", other),
        }
    }
}
