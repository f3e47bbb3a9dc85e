//! In-memory [`Store`] implementation.
//!
//! Backs the test suite and DSN-less development runs. Indexed the same way
//! the SQL store is queried: entities by id with a secondary token index for
//! live sessions, so the one-shot token consume is atomic on the entry lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{ShowInstance, Station, Store};
use crate::clock::ClockHour;
use crate::error::{GrimnirError, GrimnirResult};
use crate::executor::ExecutorStateRow;
use crate::live::LiveSession;
use crate::mount::MountConfig;
use crate::priority::PrioritySource;
use crate::webhook::WebhookTarget;
use crate::webstream::{HealthStatus, Webstream};

/// DashMap-backed store.
#[derive(Default)]
pub struct MemoryStore {
    stations: DashMap<String, Station>,
    mounts: DashMap<String, MountConfig>,
    clocks: DashMap<String, Vec<ClockHour>>,
    priority_sources: DashMap<String, PrioritySource>,
    executor_states: DashMap<String, ExecutorStateRow>,
    sessions: DashMap<String, LiveSession>,
    /// token -> session id.
    token_index: DashMap<String, String>,
    webstreams: DashMap<String, Webstream>,
    shows: DashMap<String, Vec<ShowInstance>>,
    webhooks: DashMap<String, Vec<WebhookTarget>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Seeding (operator CRUD stands outside the core) ─────────────────

    pub fn insert_station(&self, station: Station) {
        self.stations.insert(station.id.clone(), station);
    }

    pub fn insert_mount(&self, mount: MountConfig) {
        self.mounts.insert(mount.id.clone(), mount);
    }

    pub fn insert_clock_hour(&self, clock: ClockHour) {
        self.clocks
            .entry(clock.station_id.clone())
            .or_default()
            .push(clock);
    }

    pub fn insert_webstream(&self, webstream: Webstream) {
        self.webstreams.insert(webstream.id.clone(), webstream);
    }

    pub fn insert_show_instance(&self, show: ShowInstance) {
        self.shows
            .entry(show.station_id.clone())
            .or_default()
            .push(show);
    }

    pub fn insert_webhook_target(&self, target: WebhookTarget) {
        self.webhooks
            .entry(target.station_id.clone())
            .or_default()
            .push(target);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn station(&self, id: &str) -> GrimnirResult<Option<Station>> {
        Ok(self.stations.get(id).map(|r| r.value().clone()))
    }

    async fn active_stations(&self) -> GrimnirResult<Vec<Station>> {
        Ok(self
            .stations
            .iter()
            .filter(|r| r.value().active)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn mount(&self, id: &str) -> GrimnirResult<Option<MountConfig>> {
        Ok(self.mounts.get(id).map(|r| r.value().clone()))
    }

    async fn mounts_for_station(&self, station_id: &str) -> GrimnirResult<Vec<MountConfig>> {
        Ok(self
            .mounts
            .iter()
            .filter(|r| r.value().station_id == station_id)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn mounts_by_name(&self, name: &str) -> GrimnirResult<Vec<MountConfig>> {
        Ok(self
            .mounts
            .iter()
            .filter(|r| r.value().name == name)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn all_mounts(&self) -> GrimnirResult<Vec<MountConfig>> {
        Ok(self.mounts.iter().map(|r| r.value().clone()).collect())
    }

    async fn clock_hours(&self, station_id: &str) -> GrimnirResult<Vec<ClockHour>> {
        Ok(self
            .clocks
            .get(station_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn insert_priority_source(&self, source: &PrioritySource) -> GrimnirResult<()> {
        self.priority_sources
            .insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn deactivate_priority_source(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> GrimnirResult<()> {
        match self.priority_sources.get_mut(id) {
            Some(mut entry) => {
                entry.active = false;
                entry.deactivated_at = Some(at);
                Ok(())
            }
            None => Err(GrimnirError::Database(format!(
                "priority source {id} not found"
            ))),
        }
    }

    async fn active_priority_sources(
        &self,
        station_id: &str,
    ) -> GrimnirResult<Vec<PrioritySource>> {
        Ok(self
            .priority_sources
            .iter()
            .filter(|r| r.value().station_id == station_id && r.value().active)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn save_executor_state(&self, row: &ExecutorStateRow) -> GrimnirResult<()> {
        self.executor_states
            .insert(row.station_id.clone(), row.clone());
        Ok(())
    }

    async fn executor_state(&self, station_id: &str) -> GrimnirResult<Option<ExecutorStateRow>> {
        Ok(self
            .executor_states
            .get(station_id)
            .map(|r| r.value().clone()))
    }

    async fn insert_live_session(&self, session: &LiveSession) -> GrimnirResult<()> {
        self.token_index
            .insert(session.token.clone(), session.id.clone());
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn live_session(&self, id: &str) -> GrimnirResult<Option<LiveSession>> {
        Ok(self.sessions.get(id).map(|r| r.value().clone()))
    }

    async fn live_session_by_token(&self, token: &str) -> GrimnirResult<Option<LiveSession>> {
        let Some(id) = self.token_index.get(token) else {
            return Ok(None);
        };
        Ok(self.sessions.get(id.value()).map(|r| r.value().clone()))
    }

    async fn consume_token(&self, token: &str) -> GrimnirResult<bool> {
        let Some(id) = self.token_index.get(token).map(|r| r.value().clone()) else {
            return Ok(false);
        };
        // The entry lock makes the read-modify-write atomic, mirroring the
        // SQL store's `update ... where token_used = false`.
        match self.sessions.get_mut(&id) {
            Some(mut session) if !session.token_used => {
                session.token_used = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_live_session(&self, session: &LiveSession) -> GrimnirResult<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn touch_session_last_used(&self, id: &str, at: DateTime<Utc>) -> GrimnirResult<()> {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn webstream(&self, id: &str) -> GrimnirResult<Option<Webstream>> {
        Ok(self.webstreams.get(id).map(|r| r.value().clone()))
    }

    async fn monitored_webstreams(&self) -> GrimnirResult<Vec<Webstream>> {
        Ok(self
            .webstreams
            .iter()
            .filter(|r| r.value().health_check_enabled)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn update_webstream_status(
        &self,
        id: &str,
        current_index: usize,
        health: HealthStatus,
        last_check: DateTime<Utc>,
    ) -> GrimnirResult<()> {
        match self.webstreams.get_mut(id) {
            Some(mut entry) => {
                entry.current_index = current_index;
                entry.health_status = health;
                entry.last_check = Some(last_check);
                Ok(())
            }
            None => Err(GrimnirError::WebstreamNotFound(id.to_string())),
        }
    }

    async fn current_show_instance(
        &self,
        station_id: &str,
        now: DateTime<Utc>,
    ) -> GrimnirResult<Option<ShowInstance>> {
        Ok(self.shows.get(station_id).and_then(|shows| {
            shows.value().iter().find(|s| s.contains(now)).cloned()
        }))
    }

    async fn webhook_targets(&self, station_id: &str) -> GrimnirResult<Vec<WebhookTarget>> {
        Ok(self
            .webhooks
            .get(station_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }
}
