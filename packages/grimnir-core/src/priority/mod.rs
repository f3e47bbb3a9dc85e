//! Priority ladder types and the per-station arbiter.
//!
//! A [`PrioritySource`] is a claim on a station at a given urgency. The
//! [`arbiter::PriorityArbiter`] keeps the single currently-active claim per
//! station and publishes every change on the event bus.

pub mod arbiter;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Urgency ladder; numerically smaller preempts larger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PriorityLevel {
    Emergency = 0,
    LiveOverride = 1,
    LiveScheduled = 2,
    Automation = 3,
    Fallback = 4,
}

impl PriorityLevel {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a stored numeric level.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Emergency),
            1 => Some(Self::LiveOverride),
            2 => Some(Self::LiveScheduled),
            3 => Some(Self::Automation),
            4 => Some(Self::Fallback),
            _ => None,
        }
    }

    /// Live levels are the ones a DJ session may claim.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::LiveOverride | Self::LiveScheduled)
    }
}

/// What kind of audio source backs a priority claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Media,
    Live,
    Webstream,
    Emergency,
    Fallback,
}

impl SourceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Media => "media",
            Self::Live => "live",
            Self::Webstream => "webstream",
            Self::Emergency => "emergency",
            Self::Fallback => "fallback",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "media" => Some(Self::Media),
            "live" => Some(Self::Live),
            "webstream" => Some(Self::Webstream),
            "emergency" => Some(Self::Emergency),
            "fallback" => Some(Self::Fallback),
            _ => None,
        }
    }
}

/// A source's claim on a station.
///
/// Plain domain data; row mapping lives in the store implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioritySource {
    pub id: String,
    pub station_id: String,
    pub mount_id: Option<String>,
    pub priority: PriorityLevel,
    pub source_type: SourceType,
    /// Opaque id of the underlying source (slot id, session id, webstream id).
    pub source_id: String,
    pub active: bool,
    pub activated_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

impl PrioritySource {
    /// Convenience constructor for a fresh, active claim.
    pub fn new(
        station_id: impl Into<String>,
        priority: PriorityLevel,
        source_type: SourceType,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            station_id: station_id.into(),
            mount_id: None,
            priority,
            source_type,
            source_id: source_id.into(),
            active: true,
            activated_at: Utc::now(),
            deactivated_at: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_mount(mut self, mount_id: impl Into<String>) -> Self {
        self.mount_id = Some(mount_id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_orders_by_urgency() {
        assert!(PriorityLevel::Emergency < PriorityLevel::LiveOverride);
        assert!(PriorityLevel::LiveOverride < PriorityLevel::LiveScheduled);
        assert!(PriorityLevel::LiveScheduled < PriorityLevel::Automation);
        assert!(PriorityLevel::Automation < PriorityLevel::Fallback);
    }

    #[test]
    fn numeric_round_trip() {
        for level in [
            PriorityLevel::Emergency,
            PriorityLevel::LiveOverride,
            PriorityLevel::LiveScheduled,
            PriorityLevel::Automation,
            PriorityLevel::Fallback,
        ] {
            assert_eq!(PriorityLevel::from_u8(level.as_u8()), Some(level));
        }
        assert_eq!(PriorityLevel::from_u8(9), None);
    }

    #[test]
    fn live_levels() {
        assert!(PriorityLevel::LiveOverride.is_live());
        assert!(PriorityLevel::LiveScheduled.is_live());
        assert!(!PriorityLevel::Emergency.is_live());
        assert!(!PriorityLevel::Automation.is_live());
    }

    #[test]
    fn source_type_round_trip() {
        for ty in [
            SourceType::Media,
            SourceType::Live,
            SourceType::Webstream,
            SourceType::Emergency,
            SourceType::Fallback,
        ] {
            assert_eq!(SourceType::from_str(ty.as_str()), Some(ty));
        }
    }
}
