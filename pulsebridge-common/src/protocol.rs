//! Wire messages exchanged with the upstream source and downstream viewers.
//!
//! Upstream frames are loosely typed (an object with a `type` tag, a bare
//! number, or arbitrary text), so they are decoded into [`InboundFrame`]
//! once and everything past that point matches on the variant. Downstream
//! messages are strictly typed in both directions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::telemetry::{DEFAULT_UNIT, TelemetrySample, current_iso_timestamp};

/// A frame received from the upstream source.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A reading, either tagged `heart_rate` or a bare number.
    HeartRate { value: f64, unit: String },
    /// Keepalive echo.
    Heartbeat { timestamp: Option<String> },
    /// Acknowledgement from the source.
    Ack { message: Option<String> },
    /// Structured frame with a tag this relay does not act on.
    Unknown { kind: String, payload: Value },
    /// Anything that is not a usable structured frame.
    Unparsed(String),
}

impl InboundFrame {
    /// Decode a raw text frame.
    ///
    /// Never fails: input that does not match a known shape becomes
    /// [`InboundFrame::Unparsed`] carrying the original text.
    pub fn decode(raw: &str) -> Self {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => return Self::Unparsed(raw.to_string()),
        };

        match value {
            Value::Number(n) => match n.as_f64() {
                Some(value) => Self::HeartRate {
                    value,
                    unit: DEFAULT_UNIT.to_string(),
                },
                None => Self::Unparsed(raw.to_string()),
            },
            Value::Object(map) => Self::from_object(map, raw),
            _ => Self::Unparsed(raw.to_string()),
        }
    }

    fn from_object(map: Map<String, Value>, raw: &str) -> Self {
        let kind = map
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        match kind.as_str() {
            "heart_rate" => match map.get("value").and_then(Value::as_f64) {
                Some(value) => Self::HeartRate {
                    value,
                    unit: string_field(&map, "unit").unwrap_or_else(|| DEFAULT_UNIT.to_string()),
                },
                // A reading without a numeric value is only useful as a diagnostic.
                None => Self::Unparsed(raw.to_string()),
            },
            "heartbeat" => Self::Heartbeat {
                timestamp: string_field(&map, "timestamp"),
            },
            "ack" => Self::Ack {
                message: string_field(&map, "message"),
            },
            _ => Self::Unknown {
                kind,
                payload: Value::Object(map),
            },
        }
    }

    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &str {
        match self {
            Self::HeartRate { .. } => "heart_rate",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Ack { .. } => "ack",
            Self::Unknown { kind, .. } => kind,
            Self::Unparsed(_) => "unparsed",
        }
    }
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Frames this relay sends upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Keepalive sent periodically while connected.
    Heartbeat { timestamp: String },
}

impl OutboundFrame {
    /// A keepalive stamped with the current time.
    pub fn keepalive() -> Self {
        Self::Heartbeat {
            timestamp: current_iso_timestamp(),
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages a downstream viewer sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authentication handshake.
    Auth {
        #[serde(default)]
        code: String,
    },
}

impl ClientMessage {
    /// Decode a viewer frame; unknown or malformed frames yield `None`.
    pub fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Messages the relay sends to downstream viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Outcome of an authentication handshake.
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Latest reading.
    HeartRate { current: f64, timestamp: String },
}

impl ServerMessage {
    /// Successful handshake acknowledgement.
    pub fn auth_accepted() -> Self {
        Self::AuthResult {
            success: true,
            message: None,
        }
    }

    /// Failed handshake acknowledgement.
    pub fn auth_rejected(message: impl Into<String>) -> Self {
        Self::AuthResult {
            success: false,
            message: Some(message.into()),
        }
    }

    /// Broadcast payload for a sample.
    pub fn reading(sample: &TelemetrySample) -> Self {
        Self::HeartRate {
            current: sample.value,
            timestamp: sample.timestamp(),
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_heart_rate() {
        let frame = InboundFrame::decode(r#"{"type":"heart_rate","value":72,"unit":"bpm"}"#);
        assert_eq!(
            frame,
            InboundFrame::HeartRate {
                value: 72.0,
                unit: "bpm".to_string()
            }
        );
    }

    #[test]
    fn test_decode_heart_rate_default_unit() {
        let frame = InboundFrame::decode(r#"{"type":"heart_rate","value":61.5}"#);
        assert_eq!(
            frame,
            InboundFrame::HeartRate {
                value: 61.5,
                unit: "bpm".to_string()
            }
        );
    }

    #[test]
    fn test_decode_heart_rate_without_value() {
        let raw = r#"{"type":"heart_rate","unit":"bpm"}"#;
        assert_eq!(
            InboundFrame::decode(raw),
            InboundFrame::Unparsed(raw.to_string())
        );

        let raw = r#"{"type":"heart_rate","value":"fast"}"#;
        assert_eq!(
            InboundFrame::decode(raw),
            InboundFrame::Unparsed(raw.to_string())
        );
    }

    #[test]
    fn test_decode_bare_number() {
        assert_eq!(
            InboundFrame::decode("85"),
            InboundFrame::HeartRate {
                value: 85.0,
                unit: "bpm".to_string()
            }
        );
    }

    #[test]
    fn test_decode_inert_frames() {
        let frame = InboundFrame::decode(r#"{"type":"heartbeat","timestamp":"2024-01-01T00:00:00"}"#);
        assert_eq!(
            frame,
            InboundFrame::Heartbeat {
                timestamp: Some("2024-01-01T00:00:00".to_string())
            }
        );

        let frame = InboundFrame::decode(r#"{"type":"ack","message":"welcome"}"#);
        assert_eq!(
            frame,
            InboundFrame::Ack {
                message: Some("welcome".to_string())
            }
        );
    }

    #[test]
    fn test_decode_unknown_tag() {
        match InboundFrame::decode(r#"{"type":"battery","level":40}"#) {
            InboundFrame::Unknown { kind, payload } => {
                assert_eq!(kind, "battery");
                assert_eq!(payload["level"], 40);
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        let frame = InboundFrame::decode(r#"{"value":40}"#);
        assert_eq!(frame.kind(), "unknown");
    }

    #[test]
    fn test_decode_unparsed() {
        assert_eq!(
            InboundFrame::decode("hello there"),
            InboundFrame::Unparsed("hello there".to_string())
        );
        assert_eq!(
            InboundFrame::decode(r#""quoted""#),
            InboundFrame::Unparsed(r#""quoted""#.to_string())
        );
        assert_eq!(
            InboundFrame::decode("[1,2,3]"),
            InboundFrame::Unparsed("[1,2,3]".to_string())
        );
    }

    #[test]
    fn test_keepalive_shape() {
        let json = OutboundFrame::keepalive().to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_client_auth() {
        assert_eq!(
            ClientMessage::decode(r#"{"type":"auth","code":"XPH5"}"#),
            Some(ClientMessage::Auth {
                code: "XPH5".to_string()
            })
        );
        assert_eq!(
            ClientMessage::decode(r#"{"type":"auth"}"#),
            Some(ClientMessage::Auth {
                code: String::new()
            })
        );
        assert_eq!(ClientMessage::decode(r#"{"type":"subscribe"}"#), None);
        assert_eq!(ClientMessage::decode("not json"), None);
    }

    #[test]
    fn test_auth_result_shapes() {
        let accepted = ServerMessage::auth_accepted().to_json().unwrap();
        assert_eq!(accepted, r#"{"type":"auth_result","success":true}"#);

        let rejected = ServerMessage::auth_rejected("invalid access code")
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&rejected).unwrap();
        assert_eq!(value["type"], "auth_result");
        assert_eq!(value["success"], false);
        assert_eq!(value["message"], "invalid access code");
    }

    #[test]
    fn test_reading_shape() {
        let sample = TelemetrySample::new(72.0, "bpm");
        let json = ServerMessage::reading(&sample).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "heart_rate");
        assert_eq!(value["current"].as_f64(), Some(72.0));
        assert_eq!(value["timestamp"], sample.timestamp());
    }
}
