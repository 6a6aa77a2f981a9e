//! Upstream frame routing.

use std::sync::Arc;

use tracing::{debug, trace};

use pulsebridge_common::{InboundFrame, ServerMessage, TelemetrySample};

use crate::cache::SharedCache;
use crate::hub::{BroadcastReport, SharedHub};
use crate::observer::SharedObserver;

/// Longest raw frame echoed into a diagnostic line.
const MAX_DIAGNOSTIC_LEN: usize = 256;

/// What the router did with one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// A reading was cached and broadcast.
    Reading {
        sample: Arc<TelemetrySample>,
        report: BroadcastReport,
    },
    /// A frame that needs no action (heartbeat echo, ack).
    Control,
    /// A structured frame with an unrecognized tag.
    Ignored,
    /// Input that could not be decoded, forwarded as a diagnostic.
    Diagnostic,
}

/// Turns inbound upstream frames into cache updates and broadcasts.
///
/// The router is the only writer of the cache, and it is driven by the
/// supervisor's read loop one frame at a time, so broadcasts leave in the
/// order frames arrived.
pub struct MessageRouter {
    cache: SharedCache,
    hub: SharedHub,
    observer: SharedObserver,
}

impl MessageRouter {
    /// Create a router.
    pub fn new(cache: SharedCache, hub: SharedHub, observer: SharedObserver) -> Self {
        Self {
            cache,
            hub,
            observer,
        }
    }

    /// Handle a text frame.
    pub fn handle_text(&self, raw: &str) -> RouteOutcome {
        self.route(InboundFrame::decode(raw))
    }

    /// Handle a binary frame.
    ///
    /// UTF-8 payloads are treated like text frames; anything else is a
    /// diagnostic.
    pub fn handle_binary(&self, data: &[u8]) -> RouteOutcome {
        match std::str::from_utf8(data) {
            Ok(text) => self.handle_text(text),
            Err(_) => {
                self.diagnostic(&format!("Binary frame ({} bytes)", data.len()));
                RouteOutcome::Diagnostic
            }
        }
    }

    /// Act on a decoded frame.
    pub fn route(&self, frame: InboundFrame) -> RouteOutcome {
        trace!(kind = %frame.kind(), "Routing upstream frame");

        match frame {
            InboundFrame::HeartRate { value, unit } => {
                let sample = self.cache.store(TelemetrySample::new(value, unit));
                self.observer.on_reading_updated(&sample);
                let report = self.hub.broadcast(&ServerMessage::reading(&sample));
                debug!(
                    value = sample.value,
                    unit = %sample.unit,
                    delivered = report.delivered,
                    "Reading updated"
                );
                RouteOutcome::Reading { sample, report }
            }
            InboundFrame::Heartbeat { timestamp } => {
                debug!(timestamp = ?timestamp, "Upstream heartbeat");
                RouteOutcome::Control
            }
            InboundFrame::Ack { message } => {
                let message = message.unwrap_or_default();
                debug!(message = %message, "Upstream ack");
                self.observer.on_log_line(&format!("Upstream ack: {}", message));
                RouteOutcome::Control
            }
            InboundFrame::Unknown { kind, payload } => {
                debug!(kind = %kind, "Ignoring unknown upstream frame");
                self.observer
                    .on_log_line(&format!("Unknown upstream message '{}': {}", kind, payload));
                RouteOutcome::Ignored
            }
            InboundFrame::Unparsed(raw) => {
                self.diagnostic(&format!("Raw upstream message: {}", truncate(&raw)));
                RouteOutcome::Diagnostic
            }
        }
    }

    fn diagnostic(&self, line: &str) {
        debug!("{}", line);
        self.observer.on_log_line(line);
    }
}

fn truncate(raw: &str) -> &str {
    if raw.len() <= MAX_DIAGNOSTIC_LEN {
        return raw;
    }
    let mut end = MAX_DIAGNOSTIC_LEN;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    &raw[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LatestValueCache;
    use crate::hub::{Outbound, SubscriberHub};
    use crate::observer::{ChannelObserver, RelayEvent};
    use serde_json::Value;
    use tokio::sync::mpsc;

    struct Fixture {
        router: MessageRouter,
        cache: SharedCache,
        hub: SharedHub,
        events: mpsc::UnboundedReceiver<RelayEvent>,
    }

    fn fixture() -> Fixture {
        let (observer, events) = ChannelObserver::new();
        let observer: SharedObserver = Arc::new(observer);
        let cache = Arc::new(LatestValueCache::new());
        let hub = Arc::new(SubscriberHub::new("secret", cache.clone(), observer.clone()));
        let router = MessageRouter::new(cache.clone(), hub.clone(), observer);
        Fixture {
            router,
            cache,
            hub,
            events,
        }
    }

    fn authenticated_viewer(hub: &SubscriberHub) -> mpsc::Receiver<Outbound> {
        let (tx, mut rx) = mpsc::channel(16);
        let id = hub.connect(tx).id;
        hub.on_message(id, r#"{"type":"auth","code":"secret"}"#);
        while rx.try_recv().is_ok() {}
        rx
    }

    fn reading_lines(events: &mut mpsc::UnboundedReceiver<RelayEvent>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RelayEvent::LogLine(line) = event {
                lines.push(line);
            }
        }
        lines
    }

    #[test]
    fn test_heart_rate_updates_cache_and_broadcasts() {
        let f = fixture();
        let mut viewer = authenticated_viewer(&f.hub);

        let outcome = f
            .router
            .handle_text(r#"{"type":"heart_rate","value":72,"unit":"bpm"}"#);
        assert!(matches!(outcome, RouteOutcome::Reading { report, .. } if report.delivered == 1));

        let cached = f.cache.load().unwrap();
        assert_eq!(cached.value, 72.0);
        assert_eq!(cached.unit, "bpm");

        let Outbound::Text(text) = viewer.try_recv().unwrap() else {
            panic!("expected text");
        };
        let json: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "heart_rate");
        assert_eq!(json["current"].as_f64(), Some(72.0));
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_bare_number_defaults_unit() {
        let f = fixture();
        f.router.handle_text("64.5");

        let cached = f.cache.load().unwrap();
        assert_eq!(cached.value, 64.5);
        assert_eq!(cached.unit, "bpm");
    }

    #[test]
    fn test_cache_holds_last_reading() {
        let f = fixture();
        for value in [70, 71, 69, 75] {
            f.router
                .handle_text(&format!(r#"{{"type":"heart_rate","value":{}}}"#, value));
        }
        assert_eq!(f.cache.load().unwrap().value, 75.0);
    }

    #[test]
    fn test_reading_notifies_observer() {
        let mut f = fixture();
        f.router.handle_text("88");

        assert!(matches!(
            f.events.try_recv().unwrap(),
            RelayEvent::ReadingUpdated(sample) if sample.value == 88.0
        ));
    }

    #[test]
    fn test_control_frames_do_not_touch_cache() {
        let mut f = fixture();
        let mut viewer = authenticated_viewer(&f.hub);
        reading_lines(&mut f.events);

        assert_eq!(
            f.router
                .handle_text(r#"{"type":"heartbeat","timestamp":"2026-01-01T00:00:00Z"}"#),
            RouteOutcome::Control
        );
        assert_eq!(
            f.router.handle_text(r#"{"type":"ack","message":"ok"}"#),
            RouteOutcome::Control
        );

        assert!(f.cache.is_empty());
        assert!(viewer.try_recv().is_err());
        assert_eq!(reading_lines(&mut f.events), vec!["Upstream ack: ok"]);
    }

    #[test]
    fn test_unknown_and_untyped_objects_ignored() {
        let mut f = fixture();

        assert_eq!(
            f.router.handle_text(r#"{"type":"battery","level":40}"#),
            RouteOutcome::Ignored
        );
        assert_eq!(f.router.handle_text(r#"{"level":40}"#), RouteOutcome::Ignored);
        assert!(f.cache.is_empty());

        let lines = reading_lines(&mut f.events);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Unknown upstream message 'battery'"));
    }

    #[test]
    fn test_unparsed_forwarded_as_diagnostic() {
        let mut f = fixture();
        let mut viewer = authenticated_viewer(&f.hub);
        reading_lines(&mut f.events);

        assert_eq!(f.router.handle_text("hello there"), RouteOutcome::Diagnostic);
        assert_eq!(
            f.router.handle_text(r#"{"type":"heart_rate","value":"fast"}"#),
            RouteOutcome::Diagnostic
        );

        assert!(f.cache.is_empty());
        assert!(viewer.try_recv().is_err());
        let lines = reading_lines(&mut f.events);
        assert_eq!(lines[0], "Raw upstream message: hello there");
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn test_binary_frames() {
        let f = fixture();
        assert!(matches!(
            f.router.handle_binary(b"61"),
            RouteOutcome::Reading { .. }
        ));
        assert_eq!(
            f.router.handle_binary(&[0xff, 0xfe, 0x00]),
            RouteOutcome::Diagnostic
        );
        assert_eq!(f.cache.load().unwrap().value, 61.0);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_DIAGNOSTIC_LEN);
        let cut = truncate(&long);
        assert!(cut.len() <= MAX_DIAGNOSTIC_LEN);
        assert!(cut.chars().all(|c| c == 'é'));
        assert_eq!(truncate("short"), "short");
    }
}
