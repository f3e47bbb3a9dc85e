//! Postgres-backed [`Store`] implementation over sqlx.
//!
//! Entities stay plain; this module is the mapper layer. Every call is a
//! short transactional statement; read-then-write patterns use atomic
//! `update … where` forms instead of row locks held across awaits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use super::{ShowInstance, Station, Store};
use crate::clock::{ClockHour, ClockSlot};
use crate::error::{GrimnirError, GrimnirResult};
use crate::executor::{ExecutorPhase, ExecutorStateRow, Telemetry};
use crate::live::LiveSession;
use crate::mount::MountConfig;
use crate::priority::{PriorityLevel, PrioritySource, SourceType};
use crate::webhook::WebhookTarget;
use crate::webstream::{HealthCheckMethod, HealthStatus, Webstream};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Postgres store.
pub struct SqlStore {
    pool: PgPool,
}

impl SqlStore {
    /// Connects and applies pending migrations.
    pub async fn connect(dsn: &str) -> GrimnirResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(dsn)
            .await?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| GrimnirError::Database(format!("migrations: {e}")))?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bad_column<T>(column: &str, value: &str) -> GrimnirResult<T> {
    Err(GrimnirError::Database(format!(
        "unmappable {column} value {value:?}"
    )))
}

fn station_from(row: &PgRow) -> GrimnirResult<Station> {
    Ok(Station {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        timezone: row.try_get("timezone")?,
        active: row.try_get("active")?,
    })
}

fn mount_from(row: &PgRow) -> GrimnirResult<MountConfig> {
    Ok(MountConfig {
        id: row.try_get("id")?,
        station_id: row.try_get("station_id")?,
        name: row.try_get("name")?,
        content_type: row.try_get("content_type")?,
        bitrate_kbps: row.try_get::<i32, _>("bitrate_kbps")? as u32,
        channels: row.try_get::<i16, _>("channels")? as u8,
        sample_rate: row.try_get::<i32, _>("sample_rate")? as u32,
        format: row.try_get("format")?,
    })
}

fn clock_from(row: &PgRow) -> GrimnirResult<ClockHour> {
    let slots: serde_json::Value = row.try_get("slots")?;
    let slots: Vec<ClockSlot> = serde_json::from_value(slots)
        .map_err(|e| GrimnirError::Database(format!("clock slots: {e}")))?;
    Ok(ClockHour {
        id: row.try_get("id")?,
        station_id: row.try_get("station_id")?,
        start_hour: row.try_get::<i16, _>("start_hour")? as u8,
        end_hour: row.try_get::<i16, _>("end_hour")? as u8,
        created_at: row.try_get("created_at")?,
        slots,
    })
}

fn priority_source_from(row: &PgRow) -> GrimnirResult<PrioritySource> {
    let priority = row.try_get::<i16, _>("priority")?;
    let source_type: String = row.try_get("source_type")?;
    Ok(PrioritySource {
        id: row.try_get("id")?,
        station_id: row.try_get("station_id")?,
        mount_id: row.try_get("mount_id")?,
        priority: PriorityLevel::from_u8(priority as u8)
            .map_or_else(|| bad_column("priority", &priority.to_string()), Ok)?,
        source_type: SourceType::from_str(&source_type)
            .map_or_else(|| bad_column("source_type", &source_type), Ok)?,
        source_id: row.try_get("source_id")?,
        active: row.try_get("active")?,
        activated_at: row.try_get("activated_at")?,
        deactivated_at: row.try_get("deactivated_at")?,
        metadata: row.try_get("metadata")?,
    })
}

fn executor_state_from(row: &PgRow) -> GrimnirResult<ExecutorStateRow> {
    let phase: String = row.try_get("phase")?;
    let priority: Option<i16> = row.try_get("priority")?;
    let telemetry: serde_json::Value = row.try_get("telemetry")?;
    Ok(ExecutorStateRow {
        station_id: row.try_get("station_id")?,
        phase: ExecutorPhase::from_str(&phase)
            .map_or_else(|| bad_column("phase", &phase), Ok)?,
        priority: match priority {
            Some(p) => Some(
                PriorityLevel::from_u8(p as u8)
                    .map_or_else(|| bad_column("priority", &p.to_string()), Ok)?,
            ),
            None => None,
        },
        current_source: row.try_get("current_source")?,
        next_source: row.try_get("next_source")?,
        telemetry: serde_json::from_value::<Telemetry>(telemetry).unwrap_or_default(),
        last_heartbeat: row.try_get("last_heartbeat")?,
    })
}

fn live_session_from(row: &PgRow) -> GrimnirResult<LiveSession> {
    let priority = row.try_get::<i16, _>("priority")?;
    Ok(LiveSession {
        id: row.try_get("id")?,
        station_id: row.try_get("station_id")?,
        mount_id: row.try_get("mount_id")?,
        user_id: row.try_get("user_id")?,
        username: row.try_get("username")?,
        priority: PriorityLevel::from_u8(priority as u8)
            .map_or_else(|| bad_column("priority", &priority.to_string()), Ok)?,
        token: row.try_get("token")?,
        token_used: row.try_get("token_used")?,
        expires_at: row.try_get("expires_at")?,
        active: row.try_get("active")?,
        source_ip: row.try_get("source_ip")?,
        user_agent: row.try_get("user_agent")?,
        connected_at: row.try_get("connected_at")?,
        disconnected_at: row.try_get("disconnected_at")?,
        last_used_at: row.try_get("last_used_at")?,
        metadata: row.try_get("metadata")?,
    })
}

fn webstream_from(row: &PgRow) -> GrimnirResult<Webstream> {
    let urls: serde_json::Value = row.try_get("urls")?;
    let urls: Vec<String> = serde_json::from_value(urls)
        .map_err(|e| GrimnirError::Database(format!("webstream urls: {e}")))?;
    let health: String = row.try_get("health_status")?;
    let method: String = row.try_get("check_method")?;
    Ok(Webstream {
        id: row.try_get("id")?,
        station_id: row.try_get("station_id")?,
        urls,
        current_index: row.try_get::<i32, _>("current_index")? as usize,
        health_status: HealthStatus::from_str(&health)
            .map_or_else(|| bad_column("health_status", &health), Ok)?,
        health_check_enabled: row.try_get("health_check_enabled")?,
        check_interval_secs: row.try_get::<i32, _>("check_interval_secs")? as u64,
        check_timeout_secs: row.try_get::<i32, _>("check_timeout_secs")? as u64,
        check_method: match method.as_str() {
            "HEAD" => HealthCheckMethod::Head,
            "GET" => HealthCheckMethod::Get,
            other => return bad_column("check_method", other),
        },
        failover_enabled: row.try_get("failover_enabled")?,
        grace_ms: row.try_get::<i64, _>("grace_ms")? as u64,
        auto_recover: row.try_get("auto_recover")?,
        last_check: row.try_get("last_check")?,
    })
}

fn show_from(row: &PgRow) -> GrimnirResult<ShowInstance> {
    Ok(ShowInstance {
        id: row.try_get("id")?,
        station_id: row.try_get("station_id")?,
        name: row.try_get("name")?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
    })
}

fn webhook_target_from(row: &PgRow) -> GrimnirResult<WebhookTarget> {
    let events: serde_json::Value = row.try_get("events")?;
    let events: Vec<String> = serde_json::from_value(events)
        .map_err(|e| GrimnirError::Database(format!("webhook events: {e}")))?;
    Ok(WebhookTarget {
        id: row.try_get("id")?,
        station_id: row.try_get("station_id")?,
        url: row.try_get("url")?,
        events,
        secret: row.try_get("secret")?,
        active: row.try_get("active")?,
    })
}

#[async_trait]
impl Store for SqlStore {
    async fn station(&self, id: &str) -> GrimnirResult<Option<Station>> {
        let row = sqlx::query("select id, name, timezone, active from stations where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(station_from).transpose()
    }

    async fn active_stations(&self) -> GrimnirResult<Vec<Station>> {
        let rows =
            sqlx::query("select id, name, timezone, active from stations where active order by id")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(station_from).collect()
    }

    async fn mount(&self, id: &str) -> GrimnirResult<Option<MountConfig>> {
        let row = sqlx::query(
            "select id, station_id, name, content_type, bitrate_kbps, channels, sample_rate, format \
             from mounts where id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(mount_from).transpose()
    }

    async fn mounts_for_station(&self, station_id: &str) -> GrimnirResult<Vec<MountConfig>> {
        let rows = sqlx::query(
            "select id, station_id, name, content_type, bitrate_kbps, channels, sample_rate, format \
             from mounts where station_id = $1 order by id",
        )
        .bind(station_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(mount_from).collect()
    }

    async fn mounts_by_name(&self, name: &str) -> GrimnirResult<Vec<MountConfig>> {
        let rows = sqlx::query(
            "select id, station_id, name, content_type, bitrate_kbps, channels, sample_rate, format \
             from mounts where name = $1 order by id",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(mount_from).collect()
    }

    async fn all_mounts(&self) -> GrimnirResult<Vec<MountConfig>> {
        let rows = sqlx::query(
            "select id, station_id, name, content_type, bitrate_kbps, channels, sample_rate, format \
             from mounts order by id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(mount_from).collect()
    }

    async fn clock_hours(&self, station_id: &str) -> GrimnirResult<Vec<ClockHour>> {
        let rows = sqlx::query(
            "select id, station_id, start_hour, end_hour, created_at, slots \
             from clock_hours where station_id = $1 order by created_at, id",
        )
        .bind(station_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(clock_from).collect()
    }

    async fn insert_priority_source(&self, source: &PrioritySource) -> GrimnirResult<()> {
        sqlx::query(
            "insert into priority_sources \
             (id, station_id, mount_id, priority, source_type, source_id, active, \
              activated_at, deactivated_at, metadata) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&source.id)
        .bind(&source.station_id)
        .bind(&source.mount_id)
        .bind(source.priority.as_u8() as i16)
        .bind(source.source_type.as_str())
        .bind(&source.source_id)
        .bind(source.active)
        .bind(source.activated_at)
        .bind(source.deactivated_at)
        .bind(&source.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_priority_source(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> GrimnirResult<()> {
        let result = sqlx::query(
            "update priority_sources set active = false, deactivated_at = $2 where id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GrimnirError::Database(format!(
                "priority source {id} not found"
            )));
        }
        Ok(())
    }

    async fn active_priority_sources(
        &self,
        station_id: &str,
    ) -> GrimnirResult<Vec<PrioritySource>> {
        let rows = sqlx::query(
            "select id, station_id, mount_id, priority, source_type, source_id, active, \
             activated_at, deactivated_at, metadata \
             from priority_sources where station_id = $1 and active \
             order by priority, activated_at desc",
        )
        .bind(station_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(priority_source_from).collect()
    }

    async fn save_executor_state(&self, row: &ExecutorStateRow) -> GrimnirResult<()> {
        let telemetry = serde_json::to_value(row.telemetry)
            .map_err(|e| GrimnirError::Database(format!("telemetry encode: {e}")))?;
        sqlx::query(
            "insert into executor_states \
             (station_id, phase, priority, current_source, next_source, telemetry, last_heartbeat) \
             values ($1, $2, $3, $4, $5, $6, $7) \
             on conflict (station_id) do update set \
             phase = excluded.phase, priority = excluded.priority, \
             current_source = excluded.current_source, next_source = excluded.next_source, \
             telemetry = excluded.telemetry, last_heartbeat = excluded.last_heartbeat",
        )
        .bind(&row.station_id)
        .bind(row.phase.as_str())
        .bind(row.priority.map(|p| p.as_u8() as i16))
        .bind(&row.current_source)
        .bind(&row.next_source)
        .bind(telemetry)
        .bind(row.last_heartbeat)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn executor_state(&self, station_id: &str) -> GrimnirResult<Option<ExecutorStateRow>> {
        let row = sqlx::query(
            "select station_id, phase, priority, current_source, next_source, telemetry, \
             last_heartbeat from executor_states where station_id = $1",
        )
        .bind(station_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(executor_state_from).transpose()
    }

    async fn insert_live_session(&self, session: &LiveSession) -> GrimnirResult<()> {
        sqlx::query(
            "insert into live_sessions \
             (id, station_id, mount_id, user_id, username, priority, token, token_used, \
              expires_at, active, source_ip, user_agent, connected_at, disconnected_at, \
              last_used_at, metadata) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(&session.id)
        .bind(&session.station_id)
        .bind(&session.mount_id)
        .bind(&session.user_id)
        .bind(&session.username)
        .bind(session.priority.as_u8() as i16)
        .bind(&session.token)
        .bind(session.token_used)
        .bind(session.expires_at)
        .bind(session.active)
        .bind(&session.source_ip)
        .bind(&session.user_agent)
        .bind(session.connected_at)
        .bind(session.disconnected_at)
        .bind(session.last_used_at)
        .bind(&session.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn live_session(&self, id: &str) -> GrimnirResult<Option<LiveSession>> {
        let row = sqlx::query("select * from live_sessions where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(live_session_from).transpose()
    }

    async fn live_session_by_token(&self, token: &str) -> GrimnirResult<Option<LiveSession>> {
        let row = sqlx::query("select * from live_sessions where token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(live_session_from).transpose()
    }

    async fn consume_token(&self, token: &str) -> GrimnirResult<bool> {
        let result = sqlx::query(
            "update live_sessions set token_used = true where token = $1 and not token_used",
        )
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_live_session(&self, session: &LiveSession) -> GrimnirResult<()> {
        sqlx::query(
            "update live_sessions set active = $2, source_ip = $3, user_agent = $4, \
             connected_at = $5, disconnected_at = $6, metadata = $7, token_used = $8 \
             where id = $1",
        )
        .bind(&session.id)
        .bind(session.active)
        .bind(&session.source_ip)
        .bind(&session.user_agent)
        .bind(session.connected_at)
        .bind(session.disconnected_at)
        .bind(&session.metadata)
        .bind(session.token_used)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_session_last_used(&self, id: &str, at: DateTime<Utc>) -> GrimnirResult<()> {
        sqlx::query("update live_sessions set last_used_at = $2 where id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn webstream(&self, id: &str) -> GrimnirResult<Option<Webstream>> {
        let row = sqlx::query("select * from webstreams where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(webstream_from).transpose()
    }

    async fn monitored_webstreams(&self) -> GrimnirResult<Vec<Webstream>> {
        let rows = sqlx::query("select * from webstreams where health_check_enabled order by id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(webstream_from).collect()
    }

    async fn update_webstream_status(
        &self,
        id: &str,
        current_index: usize,
        health: HealthStatus,
        last_check: DateTime<Utc>,
    ) -> GrimnirResult<()> {
        let result = sqlx::query(
            "update webstreams set current_index = $2, health_status = $3, last_check = $4 \
             where id = $1",
        )
        .bind(id)
        .bind(current_index as i32)
        .bind(health.as_str())
        .bind(last_check)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GrimnirError::WebstreamNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn current_show_instance(
        &self,
        station_id: &str,
        now: DateTime<Utc>,
    ) -> GrimnirResult<Option<ShowInstance>> {
        let row = sqlx::query(
            "select id, station_id, name, starts_at, ends_at from show_instances \
             where station_id = $1 and starts_at <= $2 and ends_at > $2 \
             order by starts_at desc limit 1",
        )
        .bind(station_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(show_from).transpose()
    }

    async fn webhook_targets(&self, station_id: &str) -> GrimnirResult<Vec<WebhookTarget>> {
        let rows = sqlx::query(
            "select id, station_id, url, events, secret, active from webhook_targets \
             where station_id = $1 order by id",
        )
        .bind(station_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(webhook_target_from).collect()
    }
}
