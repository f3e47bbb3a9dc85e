//! HTTP surface: listener streaming plus the thin operator endpoints the
//! core owns (emergency takeover/release, webstream failover ops, live
//! token minting, health and stats).
//!
//! Handlers stay thin and delegate to the services; admin CRUD lives in the
//! external control plane, not here.

mod stream;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bus::EventBus;
use crate::error::{GrimnirError, GrimnirResult};
use crate::executor::ExecutorRegistry;
use crate::live::LiveSessionRegistry;
use crate::mount::MountRegistry;
use crate::priority::{arbiter::PriorityArbiter, PriorityLevel, PrioritySource, SourceType};
use crate::webhook::WebhookDispatcher;
use crate::webstream::WebstreamMonitor;

/// Shared application state for the API layer.
///
/// A thin bundle of service handles; all business logic lives in the
/// services themselves.
#[derive(Clone)]
pub struct AppState {
    pub mounts: Arc<MountRegistry>,
    pub executors: Arc<ExecutorRegistry>,
    pub arbiter: Arc<PriorityArbiter>,
    pub live: Arc<LiveSessionRegistry>,
    pub webstreams: Arc<WebstreamMonitor>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub bus: Arc<EventBus>,
}

/// Builds the router. Listener mounts live at the root (`GET /<mount>`)
/// via the fallback so `/live.mp3` style paths keep working next to the
/// fixed routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route(
            "/api/stations/{station_id}/emergency",
            post(emergency_takeover),
        )
        .route(
            "/api/stations/{station_id}/emergency/{source_id}/release",
            post(emergency_release),
        )
        .route("/api/stations/{station_id}/live-tokens", post(mint_token))
        .route("/api/webstreams/{id}/failover", post(webstream_failover))
        .route("/api/webstreams/{id}/reset", post(webstream_reset))
        .fallback(get(stream::stream_mount))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves until cancelled.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> GrimnirResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await?;
    Ok(())
}

/// Liveness: per-station executor heartbeat freshness.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stations = state.executors.health().await;
    let all_healthy = stations.iter().all(|(_, healthy)| *healthy);
    Json(json!({
        "status": if all_healthy { "ok" } else { "degraded" },
        "stations": stations
            .into_iter()
            .map(|(id, healthy)| json!({ "station_id": id, "healthy": healthy }))
            .collect::<Vec<_>>(),
    }))
}

/// Operator-visible runtime counters.
async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mounts: Vec<_> = state
        .mounts
        .all()
        .into_iter()
        .map(|mount| {
            let config = mount.config().clone();
            json!({
                "mount": config.name,
                "station_id": config.station_id,
                "content_type": config.content_type,
                "bitrate_kbps": config.bitrate_kbps,
                "listeners": mount.listener_count(),
                "feeding": mount.feeding(),
                "dropped_chunks": mount.dropped_count(),
                "now_playing": mount.now_playing(),
            })
        })
        .collect();
    Json(json!({
        "mounts": mounts,
        "bus_dropped_events": state.bus.dropped_count(),
        "webhook_failures": state.webhooks.failure_count(),
    }))
}

#[derive(Deserialize)]
struct EmergencyRequest {
    source_id: String,
    #[serde(default)]
    detail: Option<String>,
}

/// Operator emergency takeover: priority 0 preempts everything.
async fn emergency_takeover(
    State(state): State<AppState>,
    Path(station_id): Path<String>,
    Json(body): Json<EmergencyRequest>,
) -> GrimnirResult<Json<serde_json::Value>> {
    let claim = PrioritySource::new(
        &station_id,
        PriorityLevel::Emergency,
        SourceType::Emergency,
        &body.source_id,
    )
    .with_metadata(json!({ "detail": body.detail }));
    state.arbiter.request(claim).await?;
    Ok(Json(json!({ "status": "active", "source_id": body.source_id })))
}

/// The only way an emergency claim ends.
async fn emergency_release(
    State(state): State<AppState>,
    Path((station_id, source_id)): Path<(String, String)>,
) -> GrimnirResult<Json<serde_json::Value>> {
    state.arbiter.operator_release(&station_id, &source_id).await?;
    Ok(Json(json!({ "status": "released", "source_id": source_id })))
}

#[derive(Deserialize)]
struct TokenRequest {
    mount_id: String,
    user_id: String,
    username: String,
    /// 1 = override, 2 = scheduled.
    priority: u8,
    expires_in_secs: i64,
}

/// Mints a one-time harbor token for a DJ.
async fn mint_token(
    State(state): State<AppState>,
    Path(station_id): Path<String>,
    Json(body): Json<TokenRequest>,
) -> GrimnirResult<Json<serde_json::Value>> {
    let priority = PriorityLevel::from_u8(body.priority)
        .ok_or_else(|| GrimnirError::InvalidRequest(format!("bad priority {}", body.priority)))?;
    let session = state
        .live
        .generate_token(
            &station_id,
            &body.mount_id,
            &body.user_id,
            &body.username,
            priority,
            chrono::Duration::seconds(body.expires_in_secs),
        )
        .await?;
    Ok(Json(json!({
        "session_id": session.id,
        "token": session.token,
        "expires_at": session.expires_at,
    })))
}

async fn webstream_failover(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> GrimnirResult<Json<serde_json::Value>> {
    let stream = state.webstreams.trigger_failover(&id).await?;
    Ok(Json(json!({
        "current_index": stream.current_index,
        "current_url": stream.current_url()?,
    })))
}

async fn webstream_reset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> GrimnirResult<Json<serde_json::Value>> {
    let stream = state.webstreams.reset_to_primary(&id).await?;
    Ok(Json(json!({
        "current_index": stream.current_index,
        "current_url": stream.current_url()?,
    })))
}
