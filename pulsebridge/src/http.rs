//! HTTP server for viewers: the viewer page, the WebSocket endpoint, and
//! health/status resources.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::hub::{MessageOutcome, Outbound, Registration};
use crate::relay::RelayHandle;
use crate::supervisor::LinkState;

const VIEWER_PAGE: &str = include_str!("../assets/viewer.html");

/// Largest frame accepted from a viewer. Viewers only ever send the auth
/// message.
const MAX_VIEWER_MESSAGE: usize = 4 * 1024;

/// How long a closing connection gets to flush its queue.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long shutdown waits for viewer connections to wind down.
const VIEWER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Viewer connection tasks, tracked so shutdown can wait for them.
#[derive(Clone, Default)]
struct ViewerTasks {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl ViewerTasks {
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        // Reap finished connections.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Wait for every tracked task, aborting whatever is left after `timeout`.
    async fn shutdown(&self, timeout: Duration) -> usize {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let pending = tasks.len();

        let joined = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            warn!(remaining = tasks.len(), "Aborting viewer connections");
            tasks.shutdown().await;
        }
        pending
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    relay: RelayHandle,
    page: Arc<str>,
    send_buffer: usize,
    shutdown: watch::Receiver<bool>,
    viewers: ViewerTasks,
}

/// Create the HTTP router.
fn create_router(
    relay: RelayHandle,
    ws_path: &str,
    send_buffer: usize,
    shutdown: watch::Receiver<bool>,
    viewers: ViewerTasks,
) -> Router {
    let state = AppState {
        relay,
        page: VIEWER_PAGE.replace("__WS_PATH__", ws_path).into(),
        send_buffer,
        shutdown,
        viewers,
    };

    Router::new()
        .route("/", get(page_handler))
        .route(ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the viewer page.
async fn page_handler(State(state): State<AppState>) -> Html<String> {
    Html(state.page.to_string())
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

#[derive(Debug, Serialize)]
struct ReadingStatus {
    value: f64,
    unit: String,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    link: LinkState,
    target: String,
    consecutive_failures: u32,
    reading: Option<ReadingStatus>,
    subscribers: usize,
    authenticated: usize,
}

/// Handler for the /status endpoint.
async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let link = state.relay.snapshot();
    let hub = state.relay.hub();
    let reading = state.relay.cache().load().map(|sample| ReadingStatus {
        value: sample.value,
        unit: sample.unit.clone(),
        timestamp: sample.timestamp(),
    });

    Json(StatusResponse {
        link: link.state,
        target: link.target,
        consecutive_failures: link.consecutive_failures,
        reading,
        subscribers: hub.subscriber_count(),
        authenticated: hub.authenticated_count(),
    })
}

/// Handler for the viewer WebSocket endpoint.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(MAX_VIEWER_MESSAGE)
        .on_upgrade(move |socket| {
            let viewers = state.viewers.clone();
            viewers.spawn(handle_viewer(socket, state));
            std::future::ready(())
        })
}

/// Serve one viewer connection.
///
/// The hub talks to the connection through a bounded queue; a writer task
/// drains it onto the socket while this task reads viewer frames. The
/// connection ends when either side is done.
async fn handle_viewer(socket: WebSocket, state: AppState) {
    let hub = state.relay.hub().clone();
    let (tx, rx) = mpsc::channel(state.send_buffer);
    let Registration { id, evicted } = hub.connect(tx);
    let (mut sender, mut receiver) = socket.split();

    let mut writer = tokio::spawn(async move {
        write_outbound(&mut sender, rx, evicted).await;
    });
    let mut writer_done = false;

    let mut shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = &mut writer, if !writer_done => {
                writer_done = true;
                break;
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if hub.on_message(id, &text) == MessageOutcome::Close {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    hub.disconnect(id);

    // Dropping the hub's sender ends the writer once the queue is flushed.
    if !writer_done
        && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
    {
        debug!(subscriber = %id, "Viewer writer did not finish, aborting");
        writer.abort();
    }
}

/// Drain a viewer's queue onto its socket until a close instruction, an
/// eviction, or a send failure.
async fn write_outbound<S>(
    sink: &mut S,
    mut rx: mpsc::Receiver<Outbound>,
    mut evicted: oneshot::Receiver<String>,
) where
    S: Sink<Message> + Unpin,
{
    let mut watch_eviction = true;
    loop {
        let outbound = tokio::select! {
            biased;

            reason = &mut evicted, if watch_eviction => match reason {
                Ok(reason) => Outbound::Close { reason },
                Err(_) => {
                    // Removed normally; whatever is queued still goes out.
                    watch_eviction = false;
                    continue;
                }
            },
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => return,
            },
        };

        match outbound {
            Outbound::Text(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            Outbound::Close { reason } => {
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                return;
            }
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Nobody can request shutdown any more.
            std::future::pending::<()>().await;
        }
    }
}

/// HTTP server configuration.
pub struct HttpServer {
    relay: RelayHandle,
    listen_addr: SocketAddr,
    ws_path: String,
    send_buffer: usize,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        relay: RelayHandle,
        listen_addr: SocketAddr,
        ws_path: String,
        send_buffer: usize,
    ) -> Self {
        Self {
            relay,
            listen_addr,
            ws_path,
            send_buffer,
        }
    }

    /// Bind the listen address and serve until the shutdown signal is received.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until the shutdown signal is received.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        let viewers = ViewerTasks::default();
        let router = create_router(
            self.relay,
            &self.ws_path,
            self.send_buffer,
            shutdown.clone(),
            viewers.clone(),
        );

        info!(
            addr = %addr,
            ws_path = %self.ws_path,
            "HTTP server listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        // Upgraded connections outlive the server future; wait for them too.
        let viewers = viewers.shutdown(VIEWER_SHUTDOWN_TIMEOUT).await;
        info!(viewers, "HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::LinkSnapshot;
    use axum::body::Body;
    use axum::http::Request;
    use pulsebridge_common::TelemetrySample;
    use tower::ServiceExt;

    fn make_router() -> (Router, RelayHandle, watch::Sender<LinkSnapshot>) {
        let (relay, link_tx) = RelayHandle::detached("secret");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = create_router(relay.clone(), "/ws", 8, shutdown_rx, ViewerTasks::default());
        (router, relay, link_tx)
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_viewer_page() {
        let (relay, _link_tx) = RelayHandle::detached("secret");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = create_router(relay, "/live", 8, shutdown_rx, ViewerTasks::default());

        let response = router
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/html"));

        let body = body_string(response).await;
        assert!(body.contains("const WS_PATH = '/live';"));
        assert!(!body.contains("__WS_PATH__"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (router, _, _link_tx) = make_router();

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "healthy\n");
    }

    #[tokio::test]
    async fn test_status_without_reading() {
        let (router, _, _link_tx) = make_router();

        let response = router
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["link"], "disconnected");
        assert_eq!(json["target"], "ws://127.0.0.1:6667");
        assert!(json["reading"].is_null());
        assert_eq!(json["subscribers"], 0);
    }

    #[tokio::test]
    async fn test_status_reports_link_and_reading() {
        let (router, relay, link_tx) = make_router();

        link_tx.send_replace(LinkSnapshot {
            state: LinkState::Connected,
            target: "ws://10.0.0.7:6667".to_string(),
            consecutive_failures: 0,
        });
        relay.cache().store(TelemetrySample::new(77.0, "bpm"));
        let (tx, _rx) = mpsc::channel(8);
        relay.hub().connect(tx);

        let response = router
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["link"], "connected");
        assert_eq!(json["target"], "ws://10.0.0.7:6667");
        assert_eq!(json["reading"]["value"].as_f64(), Some(77.0));
        assert_eq!(json["reading"]["unit"], "bpm");
        assert_eq!(json["subscribers"], 1);
        assert_eq!(json["authenticated"], 0);
    }

    #[tokio::test]
    async fn test_ws_path_requires_upgrade() {
        let (router, _, _link_tx) = make_router();

        let response = router
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_path_404() {
        let (router, _, _link_tx) = make_router();

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    /// Sink collecting every frame the writer sends.
    #[derive(Default)]
    struct Frames(Vec<Message>);

    impl Sink<Message> for Frames {
        type Error = std::convert::Infallible;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn start_send(mut self: std::pin::Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.0.push(item);
            Ok(())
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn close_reason(message: &Message) -> Option<String> {
        match message {
            Message::Close(Some(frame)) if frame.code == close_code::NORMAL => {
                Some(frame.reason.to_string())
            }
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_writer_closes_slow_viewer() {
        let (relay, _link_tx) = RelayHandle::detached("secret");
        let hub = relay.hub();
        let (tx, rx) = mpsc::channel(1);
        let Registration { id, evicted } = hub.connect(tx);
        hub.on_message(id, r#"{"type":"auth","code":"secret"}"#);

        // The unsent acknowledgement fills the queue, so the reading drops the viewer.
        let report = hub.broadcast(&pulsebridge_common::ServerMessage::reading(
            &TelemetrySample::new(90.0, "bpm"),
        ));
        assert_eq!(report.dropped, 1);

        let mut frames = Frames::default();
        tokio::time::timeout(
            Duration::from_secs(1),
            write_outbound(&mut frames, rx, evicted),
        )
        .await
        .unwrap();

        assert_eq!(frames.0.len(), 1);
        assert_eq!(close_reason(&frames.0[0]).as_deref(), Some("send queue full"));
    }

    #[tokio::test]
    async fn test_writer_flushes_queue_before_close() {
        let (relay, _link_tx) = RelayHandle::detached("secret");
        let hub = relay.hub();
        let (tx, rx) = mpsc::channel(8);
        let Registration { id, evicted } = hub.connect(tx);
        hub.on_message(id, r#"{"type":"auth","code":"WRONG"}"#);

        let mut frames = Frames::default();
        tokio::time::timeout(
            Duration::from_secs(1),
            write_outbound(&mut frames, rx, evicted),
        )
        .await
        .unwrap();

        assert_eq!(frames.0.len(), 2);
        assert!(matches!(&frames.0[0], Message::Text(text) if text.contains("auth_result")));
        assert_eq!(
            close_reason(&frames.0[1]).as_deref(),
            Some("authentication failed")
        );
    }

    #[tokio::test]
    async fn test_viewer_tasks_shutdown_waits_and_aborts() {
        let viewers = ViewerTasks::default();
        let (done_tx, done_rx) = oneshot::channel();
        viewers.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = done_tx.send(());
        });
        viewers.spawn(std::future::pending());

        let pending = viewers.shutdown(Duration::from_millis(300)).await;
        assert_eq!(pending, 2);
        assert!(done_rx.await.is_ok());
        assert_eq!(viewers.tasks.lock().len(), 0);
    }
}
