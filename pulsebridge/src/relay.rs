//! Relay facade: wires the core components together and exposes the command
//! interface used by front ends.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use pulsebridge_common::UpstreamTarget;

use crate::cache::{LatestValueCache, SharedCache};
use crate::config::{ConfigError, LinkSettings, RelayConfig};
use crate::hub::{SharedHub, SubscriberHub};
use crate::observer::SharedObserver;
use crate::retarget::RetargetChannel;
use crate::router::MessageRouter;
use crate::supervisor::{LinkSnapshot, LinkSupervisor};

/// Cloneable access to a running relay.
#[derive(Clone)]
pub struct RelayHandle {
    hub: SharedHub,
    cache: SharedCache,
    retarget: Arc<RetargetChannel>,
    link: watch::Receiver<LinkSnapshot>,
    default_port: u16,
}

impl RelayHandle {
    /// Ask the supervisor to switch to a new upstream address.
    ///
    /// The address is validated first; an invalid one leaves the current
    /// link alone. When the address has no port, the relay's port is used.
    /// An explicit port (`host:7000` or a `ws://` URL) overrides it, so the
    /// port is only fixed for bare host addresses.
    pub fn retarget(&self, address: &str) -> pulsebridge_common::Result<UpstreamTarget> {
        let target = UpstreamTarget::parse(address, self.default_port)?;
        info!(upstream = %target, "Retarget requested");
        self.retarget.submit(target.clone());
        Ok(target)
    }

    /// Current link snapshot.
    pub fn snapshot(&self) -> LinkSnapshot {
        self.link.borrow().clone()
    }

    /// Watch link transitions.
    pub fn link(&self) -> watch::Receiver<LinkSnapshot> {
        self.link.clone()
    }

    /// The subscriber hub.
    pub fn hub(&self) -> &SharedHub {
        &self.hub
    }

    /// The latest-value cache.
    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// A handle with no supervisor behind it, plus the sender driving its
    /// link snapshot.
    #[cfg(test)]
    pub(crate) fn detached(access_code: &str) -> (Self, watch::Sender<LinkSnapshot>) {
        use crate::observer::NoopObserver;
        use crate::supervisor::LinkState;

        let cache: SharedCache = Arc::new(LatestValueCache::new());
        let hub = Arc::new(SubscriberHub::new(
            access_code,
            cache.clone(),
            Arc::new(NoopObserver),
        ));
        let (tx, link) = watch::channel(LinkSnapshot {
            state: LinkState::Disconnected,
            target: UpstreamTarget::new("127.0.0.1", pulsebridge_common::DEFAULT_UPSTREAM_PORT)
                .url(),
            consecutive_failures: 0,
        });

        let handle = Self {
            hub,
            cache,
            retarget: Arc::new(RetargetChannel::new()),
            link,
            default_port: pulsebridge_common::DEFAULT_UPSTREAM_PORT,
        };
        (handle, tx)
    }
}

/// A running relay: one link supervisor plus the shared hub and cache.
pub struct Relay {
    handle: RelayHandle,
    shutdown_tx: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

impl Relay {
    /// Build the components and start supervising `target`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        target: UpstreamTarget,
        access_code: impl Into<String>,
        settings: LinkSettings,
        observer: SharedObserver,
    ) -> Self {
        let cache: SharedCache = Arc::new(LatestValueCache::new());
        let hub: SharedHub = Arc::new(SubscriberHub::new(
            access_code,
            cache.clone(),
            observer.clone(),
        ));
        let router = MessageRouter::new(cache.clone(), hub.clone(), observer.clone());
        let retarget = Arc::new(RetargetChannel::new());
        let default_port = target.port;

        let supervisor = LinkSupervisor::new(target, settings, router, retarget.clone(), observer);
        let link = supervisor.subscribe();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervisor.run(shutdown_rx));

        Self {
            handle: RelayHandle {
                hub,
                cache,
                retarget,
                link,
                default_port,
            },
            shutdown_tx,
            supervisor,
        }
    }

    /// Start a relay from a complete configuration.
    pub fn from_config(config: &RelayConfig, observer: SharedObserver) -> Result<Self, ConfigError> {
        let host = config
            .upstream
            .host
            .as_deref()
            .ok_or_else(|| ConfigError::Validation("upstream host must be set".to_string()))?;
        let target = UpstreamTarget::parse(host, config.upstream.port)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        Ok(Self::start(
            target,
            config.server.access_code.clone(),
            config.link_settings(),
            observer,
        ))
    }

    /// Cloneable handle for front ends.
    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// See [`RelayHandle::retarget`].
    pub fn retarget(&self, address: &str) -> pulsebridge_common::Result<UpstreamTarget> {
        self.handle.retarget(address)
    }

    /// Stop the supervisor, wait for it, and close every subscriber.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.supervisor.await {
            warn!(error = %e, "Link supervisor task failed");
        }

        let closed = self.handle.hub.close_all();
        info!(subscribers_closed = closed, "Relay stopped");
    }
}
