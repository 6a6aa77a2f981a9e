//! Latest-value cache.

use std::sync::Arc;

use tokio::sync::watch;

use pulsebridge_common::TelemetrySample;

/// Shared handle to the cache.
pub type SharedCache = Arc<LatestValueCache>;

/// Holds the most recent reading, if any.
///
/// Writes replace the whole sample (last write wins by arrival order).
/// Readers get a cheap `Arc` clone of whatever was stored last.
#[derive(Debug)]
pub struct LatestValueCache {
    tx: watch::Sender<Option<Arc<TelemetrySample>>>,
}

impl LatestValueCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Replace the cached sample.
    pub fn store(&self, sample: TelemetrySample) -> Arc<TelemetrySample> {
        let sample = Arc::new(sample);
        self.tx.send_replace(Some(sample.clone()));
        sample
    }

    /// The cached sample, if any.
    pub fn load(&self) -> Option<Arc<TelemetrySample>> {
        self.tx.borrow().clone()
    }

    /// Whether a sample has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_none()
    }
}

impl Default for LatestValueCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_empty() {
        let cache = LatestValueCache::new();
        assert!(cache.is_empty());
        assert!(cache.load().is_none());
    }

    #[test]
    fn test_last_write_wins() {
        let cache = LatestValueCache::new();
        for value in [70.0, 75.0, 68.0] {
            cache.store(TelemetrySample::new(value, "bpm"));
        }

        let sample = cache.load().unwrap();
        assert_eq!(sample.value, 68.0);
        assert_eq!(sample.unit, "bpm");
    }

    #[test]
    fn test_readers_keep_their_snapshot() {
        let cache = LatestValueCache::new();
        cache.store(TelemetrySample::new(60.0, "bpm"));
        let before = cache.load().unwrap();

        cache.store(TelemetrySample::new(90.0, "bpm"));

        assert_eq!(before.value, 60.0);
        assert_eq!(cache.load().unwrap().value, 90.0);
    }
}
