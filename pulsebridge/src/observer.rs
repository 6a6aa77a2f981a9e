//! Event notifications for front ends.
//!
//! The relay never renders anything itself. It reports what happens through
//! an [`Observer`], and each front end decides how (and on which thread) to
//! present it.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use pulsebridge_common::TelemetrySample;

use crate::supervisor::LinkState;

/// Shared observer handle.
pub type SharedObserver = Arc<dyn Observer>;

/// A link status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    /// New link state.
    pub state: LinkState,
    /// Upstream URL the state refers to.
    pub target: String,
    /// Human-readable detail (e.g., "connection refused").
    pub detail: String,
}

impl std::fmt::Display for StatusUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.state, self.target, self.detail)
    }
}

/// Receives relay events.
///
/// Callbacks run on relay tasks and must not block.
pub trait Observer: Send + Sync {
    /// The upstream link changed state.
    fn on_status_changed(&self, _update: &StatusUpdate) {}

    /// A new reading was accepted.
    fn on_reading_updated(&self, _sample: &TelemetrySample) {}

    /// A diagnostic line worth showing to an operator.
    fn on_log_line(&self, _line: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// An event as delivered by [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    StatusChanged(StatusUpdate),
    ReadingUpdated(TelemetrySample),
    LogLine(String),
}

/// Observer that forwards every event into a channel.
///
/// Lets a front end consume events on its own task instead of inside the
/// callback.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl ChannelObserver {
    /// Create the observer and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: RelayEvent) {
        // The front end may have gone away during shutdown.
        let _ = self.tx.send(event);
    }
}

impl Observer for ChannelObserver {
    fn on_status_changed(&self, update: &StatusUpdate) {
        self.forward(RelayEvent::StatusChanged(update.clone()));
    }

    fn on_reading_updated(&self, sample: &TelemetrySample) {
        self.forward(RelayEvent::ReadingUpdated(sample.clone()));
    }

    fn on_log_line(&self, line: &str) {
        self.forward(RelayEvent::LogLine(line.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_observer_forwards_in_order() {
        let (observer, mut rx) = ChannelObserver::new();

        observer.on_log_line("hello");
        observer.on_reading_updated(&TelemetrySample::new(70.0, "bpm"));
        observer.on_status_changed(&StatusUpdate {
            state: LinkState::Connected,
            target: "ws://127.0.0.1:6667".to_string(),
            detail: "connected".to_string(),
        });

        assert_eq!(rx.try_recv().unwrap(), RelayEvent::LogLine("hello".to_string()));
        assert!(matches!(
            rx.try_recv().unwrap(),
            RelayEvent::ReadingUpdated(sample) if sample.value == 70.0
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            RelayEvent::StatusChanged(update) if update.state == LinkState::Connected
        ));
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.on_log_line("nobody listening");
    }

    #[test]
    fn test_status_display() {
        let update = StatusUpdate {
            state: LinkState::Disconnected,
            target: "ws://10.0.0.1:6667".to_string(),
            detail: "connection refused".to_string(),
        };
        assert_eq!(
            update.to_string(),
            "disconnected (ws://10.0.0.1:6667): connection refused"
        );
    }
}
