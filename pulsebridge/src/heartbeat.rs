//! Upstream keepalive task.

use std::fmt::Display;
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use pulsebridge_common::OutboundFrame;

/// Periodically sends a keepalive frame and a WebSocket ping on the write
/// half of a connection.
///
/// The task owns the sink while it runs. [`Heartbeat::stop`] cancels the task,
/// waits for it to finish, and hands the sink back so the caller can close
/// the connection properly. If a send fails the task ends by itself and
/// [`Heartbeat::failed`] resolves with the error.
pub struct Heartbeat<S> {
    stop_tx: Option<oneshot::Sender<()>>,
    failure_rx: Option<oneshot::Receiver<String>>,
    handle: JoinHandle<Option<S>>,
}

impl<S> Heartbeat<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
{
    /// Start sending keepalives every `interval` and pings every
    /// `ping_interval`, each first sent after one full interval.
    pub fn spawn(sink: S, interval: Duration, ping_interval: Duration) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (failure_tx, failure_rx) = oneshot::channel();
        let handle = tokio::spawn(run(sink, interval, ping_interval, stop_rx, failure_tx));
        Self {
            stop_tx: Some(stop_tx),
            failure_rx: Some(failure_rx),
            handle,
        }
    }

    /// Resolves with the send error once the task gave up on the sink.
    ///
    /// Never resolves if the task is still running or was stopped normally.
    /// Cancel-safe.
    pub async fn failed(&mut self) -> String {
        if let Some(failure_rx) = self.failure_rx.as_mut() {
            let result = failure_rx.await;
            self.failure_rx = None;
            if let Ok(error) = result {
                return error;
            }
        }
        std::future::pending().await
    }

    /// Cancel the task and wait for it.
    ///
    /// Returns the sink, or `None` if sending failed and the sink was dropped.
    pub async fn stop(mut self) -> Option<S> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        match (&mut self.handle).await {
            Ok(sink) => sink,
            Err(e) => {
                warn!(error = %e, "Heartbeat task failed");
                None
            }
        }
    }
}

async fn run<S>(
    mut sink: S,
    interval: Duration,
    ping_interval: Duration,
    mut stop_rx: oneshot::Receiver<()>,
    failure_tx: oneshot::Sender<String>,
) -> Option<S>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut keepalive = ticker(interval);
    let mut ping = ticker(ping_interval);

    loop {
        let message = tokio::select! {
            biased;

            _ = &mut stop_rx => {
                trace!("Heartbeat stopped");
                return Some(sink);
            }
            _ = keepalive.tick() => match OutboundFrame::keepalive().to_json() {
                Ok(payload) => Message::Text(payload),
                Err(e) => {
                    warn!(error = %e, "Failed to encode heartbeat");
                    continue;
                }
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        let kind = if message.is_ping() { "ping" } else { "heartbeat" };
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, kind, "Heartbeat send failed");
            let _ = failure_tx.send(e.to_string());
            return None;
        }
        trace!(kind, "Sent heartbeat");
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
