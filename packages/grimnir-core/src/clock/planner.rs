//! Expansion of clock templates into ordered, non-overlapping slot plans.
//!
//! The expansion itself is a pure function over loaded templates, which keeps
//! it deterministic and directly testable; [`ClockPlanner`] is the thin
//! store-backed wrapper the scheduler uses.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use chrono_tz::Tz;

use super::{ClockHour, SlotPlan};
use crate::error::{GrimnirError, GrimnirResult};
use crate::store::Store;

/// Default slot duration when the payload names none.
const DEFAULT_SLOT_MS: u64 = 60_000;

/// Default horizon when the caller passes zero or negative.
fn default_horizon() -> Duration {
    Duration::hours(1)
}

/// Store-backed planner.
pub struct ClockPlanner {
    store: Arc<dyn Store>,
}

impl ClockPlanner {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Expands the station's clocks over `[start, start + horizon)`.
    ///
    /// Load failures bubble up; a station without clocks compiles to an
    /// empty plan.
    pub async fn compile(
        &self,
        station_id: &str,
        start: DateTime<Utc>,
        horizon: Duration,
    ) -> GrimnirResult<Vec<SlotPlan>> {
        let station = self
            .store
            .station(station_id)
            .await?
            .ok_or_else(|| GrimnirError::StationNotFound(station_id.to_string()))?;
        let clocks = self.store.clock_hours(station_id).await?;
        Ok(expand(&clocks, &station.timezone, start, horizon))
    }
}

/// Pure expansion over already-loaded templates.
///
/// Template selection per hour: narrowest window first, then lower
/// `start_hour`, then creation order, so a 6-12 clock beats a 0-24
/// fallback for the morning hours no matter which was created first.
pub fn expand(
    clocks: &[ClockHour],
    timezone: &str,
    start: DateTime<Utc>,
    horizon: Duration,
) -> Vec<SlotPlan> {
    let horizon = if horizon <= Duration::zero() {
        default_horizon()
    } else {
        horizon
    };
    let end = start + horizon;

    let mut ordered: Vec<&ClockHour> = clocks.iter().collect();
    ordered.sort_by(|a, b| {
        a.window_width()
            .cmp(&b.window_width())
            .then(a.start_hour.cmp(&b.start_hour))
            .then(a.created_at.cmp(&b.created_at))
    });

    let tz = Tz::from_str(timezone).unwrap_or(Tz::UTC);

    // Truncating to the hour cannot fail for an hour-sized rounding.
    let mut cursor = start
        .duration_trunc(Duration::hours(1))
        .unwrap_or(start);

    let mut plans = Vec::new();
    while cursor < end {
        let local_hour = cursor.with_timezone(&tz).hour() as u8;
        if let Some(template) = ordered.iter().find(|c| c.applies_at(local_hour)) {
            let mut slots: Vec<_> = template.slots.iter().collect();
            slots.sort_by_key(|s| s.position);

            for slot in slots {
                let starts_at = cursor + Duration::milliseconds(slot.offset_ms as i64);
                if starts_at < start || starts_at >= end {
                    continue;
                }
                let duration_ms = slot_duration_ms(&slot.payload);
                plans.push(SlotPlan {
                    slot_id: slot.id.clone(),
                    station_id: template.station_id.clone(),
                    starts_at,
                    ends_at: starts_at + Duration::milliseconds(duration_ms as i64),
                    duration_ms,
                    kind: slot.kind,
                    payload: slot.payload.clone(),
                });
            }
        }
        cursor += Duration::hours(1);
    }
    plans
}

/// Duration resolution: `duration_ms`, then `duration_seconds`, then one
/// minute.
fn slot_duration_ms(payload: &serde_json::Value) -> u64 {
    if let Some(ms) = payload.get("duration_ms").and_then(|v| v.as_u64()) {
        return ms;
    }
    if let Some(secs) = payload.get("duration_seconds").and_then(|v| v.as_u64()) {
        return secs * 1000;
    }
    DEFAULT_SLOT_MS
}
