//! Integration tests for pulsebridge-common library.

use pulsebridge_common::{
    ClientMessage, InboundFrame, ServerMessage, TelemetrySample, UpstreamTarget,
    DEFAULT_UPSTREAM_PORT,
};

#[test]
fn test_upstream_reading_to_downstream_broadcast() {
    // Decode a frame as it arrives from the source
    let frame = InboundFrame::decode(r#"{"type":"heart_rate","value":72,"unit":"bpm"}"#);

    let sample = match frame {
        InboundFrame::HeartRate { value, unit } => TelemetrySample::new(value, unit),
        other => panic!("expected a reading, got {:?}", other),
    };
    assert_eq!(sample.value, 72.0);
    assert_eq!(sample.unit, "bpm");

    // Re-encode as the broadcast payload viewers receive
    let json = ServerMessage::reading(&sample).to_json().expect("encode failed");
    let decoded: ServerMessage = serde_json::from_str(&json).expect("decode failed");

    match decoded {
        ServerMessage::HeartRate { current, timestamp } => {
            assert_eq!(current, 72.0);
            assert_eq!(timestamp, sample.timestamp());
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[test]
fn test_legacy_numeric_frame_matches_tagged_frame() {
    let legacy = InboundFrame::decode("72");
    let tagged = InboundFrame::decode(r#"{"type":"heart_rate","value":72}"#);
    assert_eq!(legacy, tagged);
}

#[test]
fn test_viewer_handshake_round() {
    let auth = ClientMessage::decode(r#"{"type":"auth","code":"secret"}"#).expect("auth frame");
    let ClientMessage::Auth { code } = auth;
    assert_eq!(code, "secret");

    let rejected = ServerMessage::auth_rejected("invalid access code");
    let json = rejected.to_json().unwrap();
    assert!(json.contains("\"success\":false"));
}

#[test]
fn test_target_variants_agree() {
    let a = UpstreamTarget::parse("10.1.2.3", DEFAULT_UPSTREAM_PORT).unwrap();
    let b = UpstreamTarget::parse("ws://10.1.2.3:6667", DEFAULT_UPSTREAM_PORT).unwrap();
    let c = UpstreamTarget::parse("10.1.2.3:6667", 9999).unwrap();

    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(a.to_string(), "ws://10.1.2.3:6667");
}
