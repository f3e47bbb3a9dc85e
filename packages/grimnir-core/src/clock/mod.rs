//! Station clock templates and their expansion into time-bounded slot plans.
//!
//! A clock describes one hour of programming: which slots play at which
//! offset. Templates carry an hour window so a station can run different
//! clocks through the day; the planner picks the most specific applicable
//! template per hour.

pub mod planner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a slot asks the media engine to play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Playlist,
    Smartblock,
    HardItem,
    Stopset,
}

impl SlotKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Playlist => "playlist",
            Self::Smartblock => "smartblock",
            Self::HardItem => "hard_item",
            Self::Stopset => "stopset",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "playlist" => Some(Self::Playlist),
            "smartblock" => Some(Self::Smartblock),
            "hard_item" => Some(Self::HardItem),
            "stopset" => Some(Self::Stopset),
            _ => None,
        }
    }
}

/// One element of a clock template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockSlot {
    pub id: String,
    /// Ordering within the hour; slots are expanded position-ascending.
    pub position: u32,
    /// Offset from the top of the hour (milliseconds).
    pub offset_ms: u64,
    pub kind: SlotKind,
    /// Selector hints for the media engine; may carry `duration_ms` or
    /// `duration_seconds`.
    pub payload: serde_json::Value,
}

/// An hour template with its applicability window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockHour {
    pub id: String,
    pub station_id: String,
    /// Window start in local hours, 0..=24.
    pub start_hour: u8,
    /// Window end in local hours, 0..=24. Equal to `start_hour` means the
    /// clock covers the whole day; smaller means it wraps past midnight.
    pub end_hour: u8,
    pub created_at: DateTime<Utc>,
    pub slots: Vec<ClockSlot>,
}

impl ClockHour {
    /// Width of the window in hours. Narrower windows are more specific and
    /// win template selection.
    #[must_use]
    pub fn window_width(&self) -> u8 {
        if self.start_hour == self.end_hour {
            24
        } else if self.start_hour < self.end_hour {
            self.end_hour - self.start_hour
        } else {
            24 - (self.start_hour - self.end_hour)
        }
    }

    /// Whether the window covers the given local hour (0..24).
    #[must_use]
    pub fn applies_at(&self, local_hour: u8) -> bool {
        if self.start_hour == self.end_hour {
            true
        } else if self.start_hour < self.end_hour {
            local_hour >= self.start_hour && local_hour < self.end_hour
        } else {
            // Wraps past midnight, e.g. 22-02 covers 22, 23, 0, 1.
            local_hour >= self.start_hour || local_hour < self.end_hour
        }
    }
}

/// A planned playback window materialized onto real time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotPlan {
    /// Id of the originating clock slot.
    pub slot_id: String,
    pub station_id: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub kind: SlotKind,
    pub payload: serde_json::Value,
}
