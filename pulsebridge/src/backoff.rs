//! Reconnect delay policy.

use std::time::Duration;

use crate::config::LinkSettings;

/// Multiplicative backoff with a cap.
///
/// The first delay after a success is always the base delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
    failures: u32,
}

impl Backoff {
    /// Create a backoff starting at `base`.
    pub fn new(base: Duration, max: Duration, multiplier: f64) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            multiplier: multiplier.max(1.0),
            current: base,
            failures: 0,
        }
    }

    /// Build the policy described by link settings.
    pub fn from_settings(settings: &LinkSettings) -> Self {
        Self::new(settings.base_delay, settings.max_delay, settings.multiplier)
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.failures = self.failures.saturating_add(1);
        // Saturate at the cap instead of overflowing the conversion.
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .map_or(self.max, |next| next.min(self.max));
        delay
    }

    /// Forget past failures.
    pub fn reset(&mut self) {
        self.current = self.base;
        self.failures = 0;
    }

    /// Failures recorded since the last reset.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }
}
