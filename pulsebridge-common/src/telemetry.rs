use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Unit assumed when an upstream reading does not carry one.
pub const DEFAULT_UNIT: &str = "bpm";

/// A single reading received from the upstream source.
///
/// Samples are never mutated after construction; a newer reading replaces the
/// whole sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// The measured value.
    pub value: f64,

    /// Unit of the value (e.g., "bpm").
    pub unit: String,

    /// When this process received the reading.
    pub received_at: DateTime<Utc>,
}

impl TelemetrySample {
    /// Create a new sample stamped with the current time.
    pub fn new(value: f64, unit: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
            received_at: Utc::now(),
        }
    }

    /// Reception time formatted as an ISO-8601 string.
    pub fn timestamp(&self) -> String {
        iso_timestamp(&self.received_at)
    }
}

impl std::fmt::Display for TelemetrySample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

/// Format a timestamp the way it travels on the wire.
pub fn iso_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time as an ISO-8601 string.
pub fn current_iso_timestamp() -> String {
    iso_timestamp(&Utc::now())
}
