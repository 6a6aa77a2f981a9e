//! Single-slot mailbox for live upstream retargeting.

use parking_lot::Mutex;
use tokio::sync::Notify;

use pulsebridge_common::UpstreamTarget;

/// Holds at most one pending retarget request.
///
/// A new submission overwrites any request the supervisor has not consumed
/// yet. Submitting also wakes the supervisor so it does not have to wait out
/// a read or a backoff delay.
#[derive(Debug, Default)]
pub struct RetargetChannel {
    slot: Mutex<Option<UpstreamTarget>>,
    notify: Notify,
}

impl RetargetChannel {
    /// Create an empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a new upstream target, replacing any pending request.
    pub fn submit(&self, target: UpstreamTarget) {
        let replaced = self.slot.lock().replace(target);
        if let Some(previous) = replaced {
            tracing::debug!(upstream = %previous, "Discarding unconsumed retarget request");
        }
        self.notify.notify_one();
    }

    /// Take the pending request, if any.
    pub fn try_consume(&self) -> Option<UpstreamTarget> {
        self.slot.lock().take()
    }

    /// Whether a request is waiting.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Wait until a request is available and take it.
    ///
    /// Cancel-safe: dropping the future never loses a request.
    pub async fn recv(&self) -> UpstreamTarget {
        loop {
            let notified = self.notify.notified();
            if let Some(target) = self.try_consume() {
                return target;
            }
            notified.await;
        }
    }
}
