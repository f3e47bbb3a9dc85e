//! DJ live-session lifecycle: one-time tokens, connect/disconnect, and the
//! priority handover that preempts automation.
//!
//! A token is minted ahead of time, handed to the DJ's encoder as the
//! source password, and consumed exactly once when the harbor authorizes the
//! connection. An active session maps to exactly one active priority claim
//! at a live level; closing the session releases that claim and automation
//! resumes.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus};
use crate::error::{GrimnirError, GrimnirResult};
use crate::priority::{arbiter::PriorityArbiter, PriorityLevel, PrioritySource, SourceType};
use crate::store::Store;

/// Token entropy in bytes (192 bits, comfortably past the 128-bit floor).
const TOKEN_BYTES: usize = 24;

/// A DJ ingest session, from token mint to disconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSession {
    pub id: String,
    pub station_id: String,
    pub mount_id: String,
    pub user_id: String,
    pub username: String,
    pub priority: PriorityLevel,
    /// One-time authorization token; unique across all sessions.
    pub token: String,
    pub token_used: bool,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Ice-* headers and anything else the source client announced.
    pub metadata: serde_json::Value,
}

/// Connection details recorded when the harbor accepts a source.
#[derive(Debug, Clone, Default)]
pub struct ConnectInfo {
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: serde_json::Value,
}

/// Generates a URL-safe random token.
fn mint_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Registry coordinating sessions, tokens and priority handover.
pub struct LiveSessionRegistry {
    store: Arc<dyn Store>,
    arbiter: Arc<PriorityArbiter>,
    bus: Arc<EventBus>,
}

impl LiveSessionRegistry {
    pub fn new(store: Arc<dyn Store>, arbiter: Arc<PriorityArbiter>, bus: Arc<EventBus>) -> Self {
        Self { store, arbiter, bus }
    }

    #[must_use]
    pub fn arc(
        store: Arc<dyn Store>,
        arbiter: Arc<PriorityArbiter>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self::new(store, arbiter, bus))
    }

    /// Mints an inactive session with a fresh one-time token.
    ///
    /// Only live levels (override/scheduled) may be requested; automation
    /// and emergency never enter through the harbor.
    pub async fn generate_token(
        &self,
        station_id: &str,
        mount_id: &str,
        user_id: &str,
        username: &str,
        priority: PriorityLevel,
        expires_in: Duration,
    ) -> GrimnirResult<LiveSession> {
        if !priority.is_live() {
            return Err(GrimnirError::InvalidRequest(format!(
                "live sessions require a live priority level, got {}",
                priority.as_u8()
            )));
        }

        let session = LiveSession {
            id: Uuid::new_v4().to_string(),
            station_id: station_id.to_string(),
            mount_id: mount_id.to_string(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            priority,
            token: mint_token(),
            token_used: false,
            expires_at: Utc::now() + expires_in,
            active: false,
            source_ip: None,
            user_agent: None,
            connected_at: None,
            disconnected_at: None,
            last_used_at: None,
            metadata: serde_json::Value::Null,
        };
        self.store.insert_live_session(&session).await?;
        Ok(session)
    }

    /// Validates and consumes a token for a (station, mount) pair.
    ///
    /// Succeeds at most once per token across the process lifetime; the
    /// `token_used` flip is a one-shot atomic update in the store.
    pub async fn authorize_source(
        &self,
        station_id: &str,
        mount_id: &str,
        token: &str,
    ) -> GrimnirResult<LiveSession> {
        let Some(mut session) = self.store.live_session_by_token(token).await? else {
            return Err(GrimnirError::Unauthorized("unknown token".into()));
        };

        if session.expires_at <= Utc::now() {
            return Err(GrimnirError::TokenExpired);
        }
        if session.station_id != station_id || session.mount_id != mount_id {
            return Err(GrimnirError::Unauthorized(
                "token is bound to a different station or mount".into(),
            ));
        }
        if session.token_used {
            return Err(GrimnirError::TokenUsed);
        }
        if !self.store.consume_token(token).await? {
            // Lost the race against a concurrent authorize.
            return Err(GrimnirError::TokenUsed);
        }
        session.token_used = true;
        Ok(session)
    }

    /// Activates an authorized session and hands the station over.
    ///
    /// Idempotent: a repeated connect for an already-active session returns
    /// the existing session unchanged.
    pub async fn handle_connect(
        &self,
        session_id: &str,
        info: ConnectInfo,
    ) -> GrimnirResult<LiveSession> {
        let Some(mut session) = self.store.live_session(session_id).await? else {
            return Err(GrimnirError::SessionNotFound(session_id.to_string()));
        };
        if session.active {
            return Ok(session);
        }

        session.active = true;
        session.connected_at = Some(Utc::now());
        session.source_ip = info.source_ip;
        session.user_agent = info.user_agent;
        if !info.metadata.is_null() {
            session.metadata = info.metadata;
        }
        self.store.update_live_session(&session).await?;

        self.bus.publish(&BusEvent::DjConnect {
            station_id: session.station_id.clone(),
            mount_id: session.mount_id.clone(),
            session_id: session.id.clone(),
            username: session.username.clone(),
        });

        let claim = PrioritySource::new(
            &session.station_id,
            session.priority,
            SourceType::Live,
            &session.id,
        )
        .with_mount(&session.mount_id)
        .with_metadata(serde_json::json!({ "username": session.username }));
        self.arbiter.request(claim).await?;

        Ok(session)
    }

    /// Closes a session: releases its priority claim, stamps the disconnect
    /// and notifies listeners. A session that is already closed is a no-op.
    pub async fn handle_disconnect(&self, session_id: &str) -> GrimnirResult<()> {
        let Some(mut session) = self.store.live_session(session_id).await? else {
            return Err(GrimnirError::SessionNotFound(session_id.to_string()));
        };
        if !session.active {
            return Ok(());
        }

        if let Err(e) = self.arbiter.release(&session.station_id, &session.id).await {
            // The claim may already be gone (e.g. emergency displaced it);
            // the session still closes.
            tracing::warn!(
                session = session.id,
                error = %e,
                "priority release on disconnect failed"
            );
        }

        session.active = false;
        session.disconnected_at = Some(Utc::now());
        self.store.update_live_session(&session).await?;

        self.bus.publish(&BusEvent::DjDisconnect {
            station_id: session.station_id.clone(),
            session_id: session.id.clone(),
            username: session.username.clone(),
        });
        Ok(())
    }

    /// Stamps the session as recently used without blocking the caller.
    ///
    /// Failure is logged, never propagated.
    pub fn note_activity(self: &Arc<Self>, session_id: &str) {
        let registry = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = registry
                .store
                .touch_session_last_used(&session_id, Utc::now())
                .await
            {
                tracing::debug!(session = session_id, error = %e, "last-used stamp failed");
            }
        });
    }

    /// Session lookup for the harbor's admin endpoints.
    pub async fn session(&self, session_id: &str) -> GrimnirResult<Option<LiveSession>> {
        self.store.live_session(session_id).await
    }
}
