//! Heart-rate relay.
//!
//! This crate keeps a WebSocket link to a remote heart-rate source alive and
//! re-broadcasts every reading to authenticated local viewers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ LinkSupervisor  │────>│  MessageRouter  │────>│  SubscriberHub  │───> viewers
//! │ (upstream ws)   │     │ (decode, cache) │     │ (auth, fan-out) │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//!          ^                       │                       ^
//!          │                       v                       │
//!   RetargetChannel       LatestValueCache ────────────────┘
//! ```
//!
//! Front ends (the console and the HTTP server) talk to the core through
//! [`RelayHandle`] and receive events through an [`Observer`].
//!
//! # Usage
//!
//! ```bash
//! pulsebridge --config relay.json5
//! pulsebridge --host 192.168.3.168 --access-code XPH5qChgcd
//! ```
//!
//! # Configuration
//!
//! See [`config::RelayConfig`] for configuration options.

pub mod backoff;
pub mod cache;
pub mod config;
pub mod console;
pub mod heartbeat;
pub mod http;
pub mod hub;
pub mod observer;
pub mod relay;
pub mod retarget;
pub mod router;
pub mod supervisor;

pub use cache::{LatestValueCache, SharedCache};
pub use config::{LinkSettings, RelayConfig};
pub use http::HttpServer;
pub use hub::{SharedHub, SubscriberHub};
pub use observer::{ChannelObserver, NoopObserver, Observer, RelayEvent, SharedObserver, StatusUpdate};
pub use relay::{Relay, RelayHandle};
pub use retarget::RetargetChannel;
pub use router::MessageRouter;
pub use supervisor::{LinkError, LinkSnapshot, LinkState, LinkSupervisor};
