//! Upstream link supervision.
//!
//! The supervisor owns the single upstream WebSocket connection. It connects,
//! runs the heartbeat next to the read loop, classifies failures, backs off,
//! and restarts against a new address whenever a retarget request arrives.
//! A link that stays silent past the idle timeout, or whose heartbeat can no
//! longer be sent, is treated as dead and replaced.
//!
//! # States
//!
//! ```text
//! Disconnected ──> Connecting ──> Connected ──> (Draining) ──> Disconnected
//!      ^                                                            │
//!      └────────────────────── backoff / retarget ──────────────────┘
//! ```

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::{SplitSink, SplitStream};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tracing::{debug, info, warn};

use pulsebridge_common::UpstreamTarget;

use crate::backoff::Backoff;
use crate::config::LinkSettings;
use crate::heartbeat::Heartbeat;
use crate::observer::{SharedObserver, StatusUpdate};
use crate::retarget::RetargetChannel;
use crate::router::MessageRouter;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Lifecycle state of the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Tearing down a live connection before a retarget or stop.
    Draining,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the link, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkSnapshot {
    pub state: LinkState,
    /// URL of the current target.
    pub target: String,
    /// Failed attempts since the last successful connection.
    pub consecutive_failures: u32,
}

/// Why an upstream connection failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("connection refused")]
    Refused,

    #[error("connection reset")]
    Reset,

    #[error("connection closed abnormally")]
    AbnormalClose,

    #[error("handshake rejected (HTTP {status})")]
    Rejected { status: u16 },

    #[error("connection timed out")]
    Timeout,

    #[error("upstream stopped responding")]
    Unresponsive,

    #[error("keepalive failed: {0}")]
    KeepaliveFailed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<WsError> for LinkError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::Io(e) => match e.kind() {
                ErrorKind::ConnectionRefused => Self::Refused,
                ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                    Self::Reset
                }
                ErrorKind::UnexpectedEof => Self::AbnormalClose,
                ErrorKind::TimedOut => Self::Timeout,
                _ => Self::Io(e.to_string()),
            },
            WsError::Http(response) => Self::Rejected {
                status: response.status().as_u16(),
            },
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::AbnormalClose,
            WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => Self::AbnormalClose,
            WsError::Protocol(e) => Self::Protocol(e.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

/// How a connection ended when neither a retarget nor a stop caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEnd {
    /// The source closed the connection with a normal close code.
    Closed { reason: String },
    /// Anything else.
    Failed(LinkError),
}

impl LinkEnd {
    /// Classify a close frame sent by the source.
    pub fn from_close(frame: Option<&CloseFrame<'_>>) -> Self {
        match frame {
            None => Self::Closed {
                reason: String::new(),
            },
            Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
                Self::Closed {
                    reason: frame.reason.to_string(),
                }
            }
            Some(frame) => {
                debug!(code = u16::from(frame.code), reason = %frame.reason, "Abnormal close frame");
                Self::Failed(LinkError::AbnormalClose)
            }
        }
    }

    /// Status text for observers.
    pub fn detail(&self) -> String {
        match self {
            Self::Closed { reason } if reason.is_empty() => "closed normally".to_string(),
            Self::Closed { reason } => format!("closed normally: {}", reason),
            Self::Failed(e) => e.to_string(),
        }
    }
}

/// Result of one connection attempt.
enum Cycle {
    Stop,
    Retarget(UpstreamTarget),
    Ended(LinkEnd),
}

/// Result of a reconnect wait.
enum Wait {
    Elapsed,
    Stop,
    Retarget(UpstreamTarget),
}

/// Keeps one upstream connection alive until stopped.
pub struct LinkSupervisor {
    target: UpstreamTarget,
    settings: LinkSettings,
    router: MessageRouter,
    retarget: Arc<RetargetChannel>,
    observer: SharedObserver,
    backoff: Backoff,
    snapshot: watch::Sender<LinkSnapshot>,
}

impl LinkSupervisor {
    /// Create a supervisor for `target`. Nothing happens until [`run`](Self::run).
    pub fn new(
        target: UpstreamTarget,
        settings: LinkSettings,
        router: MessageRouter,
        retarget: Arc<RetargetChannel>,
        observer: SharedObserver,
    ) -> Self {
        let (snapshot, _) = watch::channel(LinkSnapshot {
            state: LinkState::Disconnected,
            target: target.url(),
            consecutive_failures: 0,
        });
        let backoff = Backoff::from_settings(&settings);

        Self {
            target,
            settings,
            router,
            retarget,
            observer,
            backoff,
            snapshot,
        }
    }

    /// Watch link transitions.
    pub fn subscribe(&self) -> watch::Receiver<LinkSnapshot> {
        self.snapshot.subscribe()
    }

    /// Supervise the link until `shutdown` turns true (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(upstream = %self.target, "Link supervisor started");

        loop {
            if is_stopping(&shutdown) {
                break;
            }

            if let Some(next) = self.retarget.try_consume() {
                self.apply_retarget(next);
            }

            match self.connect_once(&mut shutdown).await {
                Cycle::Stop => break,
                Cycle::Retarget(next) => self.apply_retarget(next),
                Cycle::Ended(end) => {
                    let delay = self.backoff.next_delay();
                    let detail = end.detail();
                    match &end {
                        LinkEnd::Closed { .. } => {
                            info!(upstream = %self.target, detail = %detail, "Upstream closed")
                        }
                        LinkEnd::Failed(e) => warn!(
                            upstream = %self.target,
                            error = %e,
                            failures = self.backoff.consecutive_failures(),
                            "Upstream link failed"
                        ),
                    }
                    self.set_state(LinkState::Disconnected, &detail);

                    let line = format!("Reconnecting in {}", format_delay(delay));
                    info!(upstream = %self.target, delay_ms = delay.as_millis() as u64, "{}", line);
                    self.observer.on_log_line(&line);

                    match self.wait(delay, &mut shutdown).await {
                        Wait::Elapsed => {}
                        Wait::Stop => break,
                        Wait::Retarget(next) => self.apply_retarget(next),
                    }
                }
            }
        }

        self.set_state(LinkState::Disconnected, "stopped");
        info!("Link supervisor stopped");
    }

    /// One attempt: connect, then read until the connection ends.
    async fn connect_once(&mut self, shutdown: &mut watch::Receiver<bool>) -> Cycle {
        let url = self.target.url();
        self.set_state(LinkState::Connecting, "connecting");

        let config = WebSocketConfig {
            max_message_size: Some(self.settings.max_message_size),
            max_frame_size: Some(self.settings.max_message_size),
            ..Default::default()
        };
        let connect = tokio::time::timeout(
            self.settings.connect_timeout,
            connect_async_with_config(url.as_str(), Some(config), false),
        );

        let ws = tokio::select! {
            biased;

            _ = stopped(shutdown) => return Cycle::Stop,
            next = self.retarget.recv() => return Cycle::Retarget(next),
            result = connect => match result {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => return Cycle::Ended(LinkEnd::Failed(e.into())),
                Err(_) => return Cycle::Ended(LinkEnd::Failed(LinkError::Timeout)),
            },
        };

        self.backoff.reset();
        self.set_state(LinkState::Connected, "connected");

        let (sink, mut stream) = ws.split();
        let mut heartbeat = Heartbeat::spawn(
            sink,
            self.settings.heartbeat_interval,
            self.settings.ping_interval,
        );
        let idle = tokio::time::sleep(self.settings.idle_timeout);
        tokio::pin!(idle);

        let cycle = loop {
            tokio::select! {
                biased;

                _ = stopped(shutdown) => break Cycle::Stop,
                next = self.retarget.recv() => break Cycle::Retarget(next),
                error = heartbeat.failed() => {
                    break Cycle::Ended(LinkEnd::Failed(LinkError::KeepaliveFailed(error)));
                }
                _ = &mut idle => break Cycle::Ended(LinkEnd::Failed(LinkError::Unresponsive)),
                message = stream.next() => {
                    if matches!(message, Some(Ok(_))) {
                        idle.as_mut().reset(Instant::now() + self.settings.idle_timeout);
                    }
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.router.handle_text(&text);
                        }
                        Some(Ok(Message::Binary(data))) => {
                            self.router.handle_binary(&data);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break Cycle::Ended(LinkEnd::from_close(frame.as_ref()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Cycle::Ended(LinkEnd::Failed(e.into())),
                        None => break Cycle::Ended(LinkEnd::Failed(LinkError::AbnormalClose)),
                    }
                }
            }
        };

        match cycle {
            Cycle::Stop => self.drain(heartbeat, stream, "stopping").await,
            Cycle::Retarget(_) => self.drain(heartbeat, stream, "retargeting").await,
            Cycle::Ended(_) => {
                // The connection is already gone; the sink is simply dropped.
                let _ = heartbeat.stop().await;
            }
        }
        cycle
    }

    /// Close a live connection on our side: stop the heartbeat, then run the
    /// close handshake (bounded by the close timeout).
    async fn drain(&self, heartbeat: Heartbeat<WsSink>, stream: SplitStream<WsStream>, reason: &str) {
        self.set_state(LinkState::Draining, reason);

        if let Some(sink) = heartbeat.stop().await {
            match sink.reunite(stream) {
                Ok(mut ws) => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: reason.into(),
                    };
                    let handshake = async {
                        ws.close(Some(frame)).await?;
                        while let Some(message) = ws.next().await {
                            message?;
                        }
                        Ok::<(), WsError>(())
                    };
                    match tokio::time::timeout(self.settings.close_timeout, handshake).await {
                        Ok(Ok(())) => debug!("Upstream close handshake completed"),
                        Ok(Err(e)) => debug!(error = %e, "Upstream close handshake failed"),
                        Err(_) => debug!("Upstream close handshake timed out"),
                    }
                }
                Err(e) => warn!(error = %e, "Failed to reassemble upstream connection"),
            }
        }

        self.set_state(LinkState::Disconnected, reason);
    }

    /// Sleep before the next attempt, unless a retarget or stop comes first.
    async fn wait(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> Wait {
        tokio::select! {
            biased;

            _ = stopped(shutdown) => Wait::Stop,
            next = self.retarget.recv() => Wait::Retarget(next),
            _ = tokio::time::sleep(delay) => Wait::Elapsed,
        }
    }

    fn apply_retarget(&mut self, next: UpstreamTarget) {
        let previous = std::mem::replace(&mut self.target, next);
        self.backoff.reset();

        info!(from = %previous, upstream = %self.target, "Retargeting upstream");
        self.observer.on_log_line(&format!(
            "Retargeting upstream from {} to {}",
            previous, self.target
        ));
    }

    fn set_state(&self, state: LinkState, detail: &str) {
        let update = StatusUpdate {
            state,
            target: self.target.url(),
            detail: detail.to_string(),
        };

        self.snapshot.send_replace(LinkSnapshot {
            state,
            target: update.target.clone(),
            consecutive_failures: self.backoff.consecutive_failures(),
        });

        info!(state = %state, upstream = %update.target, detail = %detail, "Link status changed");
        self.observer.on_status_changed(&update);
    }
}

fn is_stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Resolves once shutdown is requested or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn format_delay(delay: Duration) -> String {
    if delay < Duration::from_secs(1) {
        format!("{}ms", delay.as_millis())
    } else if delay.subsec_millis() == 0 {
        format!("{}s", delay.as_secs())
    } else {
        format!("{:.1}s", delay.as_secs_f64())
    }
}
