//! Persistence access for the core runtime.
//!
//! The database is a collaborator, not a framework: domain entities are
//! plain data, and the [`Store`] trait names exactly what the core reads and
//! writes. Implementations map rows to entities: [`MemoryStore`] for tests
//! and DSN-less development, [`SqlStore`] for Postgres. Handles are passed
//! explicitly through constructors; there are no global singletons.

mod memory;
mod sql;

pub use memory::MemoryStore;
pub use sql::SqlStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::ClockHour;
use crate::error::GrimnirResult;
use crate::executor::ExecutorStateRow;
use crate::live::LiveSession;
use crate::mount::MountConfig;
use crate::priority::PrioritySource;
use crate::webhook::WebhookTarget;
use crate::webstream::{HealthStatus, Webstream};

/// Configuration anchor for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub name: String,
    /// IANA timezone name; invalid or empty falls back to UTC.
    pub timezone: String,
    pub active: bool,
}

/// A scheduled show occurrence, used by the webhook dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowInstance {
    pub id: String,
    pub station_id: String,
    pub name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl ShowInstance {
    /// Whether the instance's interval contains `at`.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.starts_at <= at && at < self.ends_at
    }
}

/// Everything the core persists or reads, as short transactional calls.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Stations and mounts ─────────────────────────────────────────────

    async fn station(&self, id: &str) -> GrimnirResult<Option<Station>>;

    async fn active_stations(&self) -> GrimnirResult<Vec<Station>>;

    async fn mount(&self, id: &str) -> GrimnirResult<Option<MountConfig>>;

    async fn mounts_for_station(&self, station_id: &str) -> GrimnirResult<Vec<MountConfig>>;

    /// All mounts with the given short name. Names may collide across
    /// stations; the caller disambiguates (the harbor uses the token's bound
    /// station).
    async fn mounts_by_name(&self, name: &str) -> GrimnirResult<Vec<MountConfig>>;

    async fn all_mounts(&self) -> GrimnirResult<Vec<MountConfig>>;

    // ── Clock templates ─────────────────────────────────────────────────

    async fn clock_hours(&self, station_id: &str) -> GrimnirResult<Vec<ClockHour>>;

    // ── Priority sources ────────────────────────────────────────────────

    async fn insert_priority_source(&self, source: &PrioritySource) -> GrimnirResult<()>;

    async fn deactivate_priority_source(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> GrimnirResult<()>;

    async fn active_priority_sources(
        &self,
        station_id: &str,
    ) -> GrimnirResult<Vec<PrioritySource>>;

    // ── Executor state ──────────────────────────────────────────────────

    async fn save_executor_state(&self, row: &ExecutorStateRow) -> GrimnirResult<()>;

    async fn executor_state(&self, station_id: &str) -> GrimnirResult<Option<ExecutorStateRow>>;

    // ── Live sessions ───────────────────────────────────────────────────

    async fn insert_live_session(&self, session: &LiveSession) -> GrimnirResult<()>;

    async fn live_session(&self, id: &str) -> GrimnirResult<Option<LiveSession>>;

    async fn live_session_by_token(&self, token: &str) -> GrimnirResult<Option<LiveSession>>;

    /// One-shot token consumption: flips `token_used` from false to true
    /// atomically. Returns `false` when the token was already used.
    async fn consume_token(&self, token: &str) -> GrimnirResult<bool>;

    async fn update_live_session(&self, session: &LiveSession) -> GrimnirResult<()>;

    /// Non-critical "seen recently" stamp; callers log failures instead of
    /// propagating them.
    async fn touch_session_last_used(&self, id: &str, at: DateTime<Utc>) -> GrimnirResult<()>;

    // ── Webstreams ──────────────────────────────────────────────────────

    async fn webstream(&self, id: &str) -> GrimnirResult<Option<Webstream>>;

    /// Webstreams with health checking enabled.
    async fn monitored_webstreams(&self) -> GrimnirResult<Vec<Webstream>>;

    /// Updates the relay status columns in place.
    async fn update_webstream_status(
        &self,
        id: &str,
        current_index: usize,
        health: HealthStatus,
        last_check: DateTime<Utc>,
    ) -> GrimnirResult<()>;

    // ── Shows and webhooks ──────────────────────────────────────────────

    /// The show instance whose interval contains `now`, if any.
    async fn current_show_instance(
        &self,
        station_id: &str,
        now: DateTime<Utc>,
    ) -> GrimnirResult<Option<ShowInstance>>;

    async fn webhook_targets(&self, station_id: &str) -> GrimnirResult<Vec<WebhookTarget>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn show_instance_interval_is_half_open() {
        let show = ShowInstance {
            id: "sh1".into(),
            station_id: "st1".into(),
            name: "Morning Drive".into(),
            starts_at: Utc.with_ymd_and_hms(2024, 3, 4, 6, 0, 0).unwrap(),
            ends_at: Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap(),
        };
        assert!(show.contains(Utc.with_ymd_and_hms(2024, 3, 4, 6, 0, 0).unwrap()));
        assert!(show.contains(Utc.with_ymd_and_hms(2024, 3, 4, 8, 59, 59).unwrap()));
        assert!(!show.contains(Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()));
        assert!(!show.contains(Utc.with_ymd_and_hms(2024, 3, 4, 5, 59, 59).unwrap()));
    }
}
