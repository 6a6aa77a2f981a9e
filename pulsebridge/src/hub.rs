//! Downstream subscriber hub.
//!
//! The hub is transport-agnostic: each subscriber is represented by the
//! sending half of a bounded queue, and whatever owns the actual connection
//! (see [`crate::http`]) drains that queue onto the wire. A subscriber whose
//! queue is closed or full is considered failed and removed. When the close
//! instruction cannot be queued, it is delivered through the eviction signal
//! handed out by [`SubscriberHub::connect`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use pulsebridge_common::{ClientMessage, ServerMessage};

use crate::cache::SharedCache;
use crate::observer::SharedObserver;

/// Shared handle to the hub.
pub type SharedHub = Arc<SubscriberHub>;

/// Message shown to viewers that present a wrong access code.
pub const AUTH_REJECTED_MESSAGE: &str = "invalid access code";

/// Identifier of a connected subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Instruction for a subscriber's connection writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send a text frame.
    Text(String),
    /// Close the connection with the given reason.
    Close { reason: String },
}

/// A newly registered subscriber.
#[derive(Debug)]
pub struct Registration {
    pub id: SubscriberId,
    /// Resolves with a close reason if the hub drops the subscriber while its
    /// queue is full. Resolves with an error when the subscriber is removed
    /// any other way; the close instruction is then in the queue.
    pub evicted: oneshot::Receiver<String>,
}

/// What the connection should do after a subscriber message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Keep reading.
    Continue,
    /// The hub dropped this subscriber; stop reading.
    Close,
}

/// Result of one broadcast pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers the event was queued for.
    pub delivered: usize,
    /// Subscribers removed because delivery failed.
    pub dropped: usize,
}

#[derive(Debug)]
struct Subscriber {
    authenticated: bool,
    tx: mpsc::Sender<Outbound>,
    evict: oneshot::Sender<String>,
}

impl Subscriber {
    /// Tell the connection to close, bypassing the queue if it is full.
    fn close(self, reason: &str) {
        let close = Outbound::Close {
            reason: reason.to_string(),
        };
        if let Err(TrySendError::Full(_)) = self.tx.try_send(close) {
            let _ = self.evict.send(reason.to_string());
        }
    }
}

/// Authenticates downstream subscribers and fans out readings to them.
pub struct SubscriberHub {
    access_code: String,
    cache: SharedCache,
    observer: SharedObserver,
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
}

impl SubscriberHub {
    /// Create a hub guarding broadcasts with `access_code`.
    pub fn new(access_code: impl Into<String>, cache: SharedCache, observer: SharedObserver) -> Self {
        Self {
            access_code: access_code.into(),
            cache,
            observer,
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new, unauthenticated subscriber.
    pub fn connect(&self, tx: mpsc::Sender<Outbound>) -> Registration {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (evict, evicted) = oneshot::channel();
        let count = {
            let mut subscribers = self.subscribers.write();
            subscribers.insert(
                id,
                Subscriber {
                    authenticated: false,
                    tx,
                    evict,
                },
            );
            subscribers.len()
        };

        info!(subscriber = %id, connected = count, "Viewer connected");
        self.observer
            .on_log_line(&format!("Viewer {} connected ({} connected)", id, count));
        Registration { id, evicted }
    }

    /// Handle a text frame sent by a subscriber.
    pub fn on_message(&self, id: SubscriberId, raw: &str) -> MessageOutcome {
        let Some(ClientMessage::Auth { code }) = ClientMessage::decode(raw) else {
            trace!(subscriber = %id, "Ignoring viewer frame");
            return MessageOutcome::Continue;
        };

        let mut subscribers = self.subscribers.write();
        let Some(subscriber) = subscribers.get_mut(&id) else {
            return MessageOutcome::Close;
        };

        if subscriber.authenticated {
            trace!(subscriber = %id, "Ignoring repeated auth");
            return MessageOutcome::Continue;
        }

        if code != self.access_code {
            let _ = queue(&subscriber.tx, &ServerMessage::auth_rejected(AUTH_REJECTED_MESSAGE));
            if let Some(subscriber) = subscribers.remove(&id) {
                subscriber.close("authentication failed");
            }
            drop(subscribers);

            warn!(subscriber = %id, "Viewer failed authentication");
            self.observer
                .on_log_line(&format!("Viewer {} rejected: {}", id, AUTH_REJECTED_MESSAGE));
            return MessageOutcome::Close;
        }

        // Flip the flag and push the cached reading under the same write lock so a
        // concurrent broadcast cannot slip an older reading in after a newer one.
        subscriber.authenticated = true;
        let mut delivered = queue(&subscriber.tx, &ServerMessage::auth_accepted());
        if let Some(sample) = self.cache.load() {
            delivered = delivered && queue(&subscriber.tx, &ServerMessage::reading(&sample));
        }

        if !delivered {
            if let Some(subscriber) = subscribers.remove(&id) {
                subscriber.close("send queue full");
            }
            warn!(subscriber = %id, "Viewer went away during authentication");
            return MessageOutcome::Close;
        }
        drop(subscribers);

        info!(subscriber = %id, "Viewer authenticated");
        self.observer
            .on_log_line(&format!("Viewer {} authenticated", id));
        MessageOutcome::Continue
    }

    /// Send `message` to every authenticated subscriber.
    ///
    /// Subscribers whose delivery fails are removed; the others are unaffected.
    pub fn broadcast(&self, message: &ServerMessage) -> BroadcastReport {
        let payload = match message.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode broadcast");
                return BroadcastReport::default();
            }
        };

        let targets: Vec<(SubscriberId, mpsc::Sender<Outbound>)> = self
            .subscribers
            .read()
            .iter()
            .filter(|(_, subscriber)| subscriber.authenticated)
            .map(|(id, subscriber)| (*id, subscriber.tx.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for (id, tx) in targets {
            match tx.try_send(Outbound::Text(payload.clone())) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => failed.push((id, "send queue full")),
                Err(TrySendError::Closed(_)) => failed.push((id, "connection closed")),
            }
        }

        if !failed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for (id, reason) in &failed {
                if let Some(subscriber) = subscribers.remove(id) {
                    subscriber.close(reason);
                    report.dropped += 1;
                    warn!(subscriber = %id, reason = %reason, "Dropping viewer");
                }
            }
        }

        debug!(
            delivered = report.delivered,
            dropped = report.dropped,
            "Broadcast reading"
        );
        report
    }

    /// Remove a subscriber. Returns whether it was still registered.
    pub fn disconnect(&self, id: SubscriberId) -> bool {
        let (removed, count) = {
            let mut subscribers = self.subscribers.write();
            let removed = subscribers.remove(&id).is_some();
            (removed, subscribers.len())
        };

        if removed {
            info!(subscriber = %id, connected = count, "Viewer disconnected");
            self.observer
                .on_log_line(&format!("Viewer {} disconnected ({} connected)", id, count));
        }
        removed
    }

    /// Ask every subscriber connection to close and forget them all.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Subscriber> = self
            .subscribers
            .write()
            .drain()
            .map(|(_, subscriber)| subscriber)
            .collect();

        let count = drained.len();
        for subscriber in drained {
            subscriber.close("server shutting down");
        }
        count
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Number of authenticated subscribers.
    pub fn authenticated_count(&self) -> usize {
        self.subscribers
            .read()
            .values()
            .filter(|subscriber| subscriber.authenticated)
            .count()
    }

    /// Whether a subscriber is registered and authenticated.
    pub fn is_authenticated(&self, id: SubscriberId) -> bool {
        self.subscribers
            .read()
            .get(&id)
            .is_some_and(|subscriber| subscriber.authenticated)
    }
}

fn queue(tx: &mpsc::Sender<Outbound>, message: &ServerMessage) -> bool {
    match message.to_json() {
        Ok(payload) => tx.try_send(Outbound::Text(payload)).is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode viewer message");
            false
        }
    }
}
