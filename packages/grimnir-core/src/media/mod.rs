//! Media engine RPC contract.
//!
//! Decoding, encoding and deck control live in a remote engine process; the
//! core addresses it through the [`MediaEngine`] trait. [`RpcMediaEngine`]
//! speaks HTTP/JSON with short control timeouts. [`NullMediaEngine`] stands
//! in when no engine is configured: executors keep their state machines
//! consistent and surface [`MediaEngineUnavailable`] to callers.
//!
//! [`MediaEngineUnavailable`]: crate::error::GrimnirError::MediaEngineUnavailable

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;

use crate::clock::SlotPlan;
use crate::error::{GrimnirError, GrimnirResult};
use crate::executor::Telemetry;
use crate::priority::PrioritySource;
use crate::protocol_constants::{ENGINE_CONTROL_TIMEOUT, ENGINE_PING_TIMEOUT};

/// Writable sink into a mount's encoder (live DJ audio goes here).
pub type LiveSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Readable stream of a mount's encoded output.
pub type EncodedSource = Box<dyn AsyncRead + Send + Unpin>;

/// Remote media engine operations the core depends on.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> GrimnirResult<()>;

    /// Asks the engine to stage the next slot's material.
    async fn preload(&self, station_id: &str, plan: &SlotPlan) -> GrimnirResult<()>;

    /// Starts playback of a source on a station.
    async fn play(&self, station_id: &str, source: &PrioritySource) -> GrimnirResult<()>;

    /// Stops a station's playback.
    async fn stop(&self, station_id: &str) -> GrimnirResult<()>;

    /// Crossfades toward an already-preloaded source.
    async fn crossfade(
        &self,
        station_id: &str,
        to_source: &str,
        duration_ms: u64,
    ) -> GrimnirResult<()>;

    /// Opens the encoder-side sink for a live source on a mount.
    async fn inject_live_source(
        &self,
        station_id: &str,
        mount_id: &str,
    ) -> GrimnirResult<LiveSink>;

    /// Opens the encoded output stream feeding a mount.
    async fn encoded_stream(&self, mount_id: &str) -> GrimnirResult<EncodedSource>;

    /// 1 Hz telemetry feed for a station.
    async fn telemetry(&self, station_id: &str) -> GrimnirResult<BoxStream<'static, Telemetry>>;

    /// Whether an engine is configured at all; a disconnected engine skips
    /// the telemetry worker.
    fn connected(&self) -> bool;
}

/// HTTP/JSON client for the engine's control surface.
pub struct RpcMediaEngine {
    base_url: String,
    /// Short-timeout client for control calls.
    control: reqwest::Client,
    /// Unbounded client for long-lived streams.
    streaming: reqwest::Client,
}

/// Response of the live-source injection call: where to ship raw PCM.
#[derive(Debug, Deserialize)]
struct LiveSinkAddr {
    host: String,
    port: u16,
}

impl RpcMediaEngine {
    pub fn new(base_url: impl Into<String>) -> GrimnirResult<Self> {
        let control = reqwest::Client::builder()
            .timeout(ENGINE_CONTROL_TIMEOUT)
            .build()
            .map_err(|e| GrimnirError::MediaEngineUnavailable(e.to_string()))?;
        let streaming = reqwest::Client::builder()
            .build()
            .map_err(|e| GrimnirError::MediaEngineUnavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            control,
            streaming,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post_control(&self, path: &str, body: serde_json::Value) -> GrimnirResult<()> {
        let response = self
            .control
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| GrimnirError::MediaEngineUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GrimnirError::MediaEngineUnavailable(format!(
                "{path}: engine returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for RpcMediaEngine {
    async fn ping(&self) -> GrimnirResult<()> {
        let response = self
            .control
            .get(self.url("/v1/ping"))
            .timeout(ENGINE_PING_TIMEOUT)
            .send()
            .await
            .map_err(|e| GrimnirError::MediaEngineUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GrimnirError::MediaEngineUnavailable(format!(
                "ping returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn preload(&self, station_id: &str, plan: &SlotPlan) -> GrimnirResult<()> {
        self.post_control(
            &format!("/v1/stations/{station_id}/preload"),
            serde_json::json!({
                "slot_id": plan.slot_id,
                "kind": plan.kind,
                "duration_ms": plan.duration_ms,
                "payload": plan.payload,
            }),
        )
        .await
    }

    async fn play(&self, station_id: &str, source: &PrioritySource) -> GrimnirResult<()> {
        self.post_control(
            &format!("/v1/stations/{station_id}/play"),
            serde_json::json!({
                "source_id": source.source_id,
                "source_type": source.source_type,
                "priority": source.priority,
                "metadata": source.metadata,
            }),
        )
        .await
    }

    async fn stop(&self, station_id: &str) -> GrimnirResult<()> {
        self.post_control(&format!("/v1/stations/{station_id}/stop"), serde_json::json!({}))
            .await
    }

    async fn crossfade(
        &self,
        station_id: &str,
        to_source: &str,
        duration_ms: u64,
    ) -> GrimnirResult<()> {
        self.post_control(
            &format!("/v1/stations/{station_id}/crossfade"),
            serde_json::json!({ "to_source": to_source, "duration_ms": duration_ms }),
        )
        .await
    }

    async fn inject_live_source(
        &self,
        station_id: &str,
        mount_id: &str,
    ) -> GrimnirResult<LiveSink> {
        // The engine opens a PCM ingest socket and tells us where.
        let response = self
            .control
            .post(self.url(&format!(
                "/v1/stations/{station_id}/mounts/{mount_id}/live-source"
            )))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| GrimnirError::MediaEngineUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GrimnirError::MediaEngineUnavailable(format!(
                "live-source returned {}",
                response.status()
            )));
        }
        let addr: LiveSinkAddr = response
            .json()
            .await
            .map_err(|e| GrimnirError::MediaEngineUnavailable(e.to_string()))?;

        let socket = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| GrimnirError::MediaEngineUnavailable(format!("pcm ingest: {e}")))?;
        Ok(Box::new(socket))
    }

    async fn encoded_stream(&self, mount_id: &str) -> GrimnirResult<EncodedSource> {
        let response = self
            .streaming
            .get(self.url(&format!("/v1/mounts/{mount_id}/stream")))
            .send()
            .await
            .map_err(|e| GrimnirError::MediaEngineUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GrimnirError::MediaEngineUnavailable(format!(
                "encoded stream returned {}",
                response.status()
            )));
        }
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn telemetry(&self, station_id: &str) -> GrimnirResult<BoxStream<'static, Telemetry>> {
        let response = self
            .streaming
            .get(self.url(&format!("/v1/stations/{station_id}/telemetry")))
            .send()
            .await
            .map_err(|e| GrimnirError::MediaEngineUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GrimnirError::MediaEngineUnavailable(format!(
                "telemetry returned {}",
                response.status()
            )));
        }

        // JSON-lines over chunked transfer, one sample per second.
        let reader = StreamReader::new(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other)),
        );
        let lines = LinesStream::new(BufReader::new(reader).lines());
        let samples = lines.filter_map(|line| async move {
            let line = line.ok()?;
            match serde_json::from_str::<Telemetry>(&line) {
                Ok(sample) => Some(sample),
                Err(e) => {
                    tracing::debug!(error = %e, "undecodable telemetry line");
                    None
                }
            }
        });
        Ok(samples.boxed())
    }

    fn connected(&self) -> bool {
        true
    }
}

/// Stand-in engine for deployments without a media engine configured.
pub struct NullMediaEngine;

impl NullMediaEngine {
    fn unavailable<T>() -> GrimnirResult<T> {
        Err(GrimnirError::MediaEngineUnavailable(
            "no media engine configured".into(),
        ))
    }
}

#[async_trait]
impl MediaEngine for NullMediaEngine {
    async fn ping(&self) -> GrimnirResult<()> {
        Self::unavailable()
    }

    async fn preload(&self, _station_id: &str, _plan: &SlotPlan) -> GrimnirResult<()> {
        Self::unavailable()
    }

    async fn play(&self, _station_id: &str, _source: &PrioritySource) -> GrimnirResult<()> {
        Self::unavailable()
    }

    async fn stop(&self, _station_id: &str) -> GrimnirResult<()> {
        Self::unavailable()
    }

    async fn crossfade(
        &self,
        _station_id: &str,
        _to_source: &str,
        _duration_ms: u64,
    ) -> GrimnirResult<()> {
        Self::unavailable()
    }

    async fn inject_live_source(
        &self,
        _station_id: &str,
        _mount_id: &str,
    ) -> GrimnirResult<LiveSink> {
        Self::unavailable()
    }

    async fn encoded_stream(&self, _mount_id: &str) -> GrimnirResult<EncodedSource> {
        Self::unavailable()
    }

    async fn telemetry(&self, _station_id: &str) -> GrimnirResult<BoxStream<'static, Telemetry>> {
        Self::unavailable()
    }

    fn connected(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_engine_is_disconnected_and_unavailable() {
        let engine = NullMediaEngine;
        assert!(!engine.connected());
        assert!(matches!(
            engine.ping().await,
            Err(GrimnirError::MediaEngineUnavailable(_))
        ));
        assert!(matches!(
            engine.stop("st1").await,
            Err(GrimnirError::MediaEngineUnavailable(_))
        ));
    }

    #[test]
    fn rpc_engine_normalizes_base_url() {
        let engine = RpcMediaEngine::new("http://engine:9300/").unwrap();
        assert_eq!(engine.url("/v1/ping"), "http://engine:9300/v1/ping");
    }
}
