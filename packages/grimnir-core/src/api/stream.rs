//! Listener streaming handler.
//!
//! Separated from the REST handlers due to its distinct concerns: recent-
//! audio priming, the per-listener bounded queue, keepalive wakeups and
//! optional ICY metadata injection.

use std::sync::Arc;

use async_stream::stream;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Uri};
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;

use super::AppState;
use crate::error::{GrimnirError, GrimnirResult};
use crate::harbor::protocol::parse_query;
use crate::mount::icy::{IcyInjector, ICY_METAINT};
use crate::mount::{mount_name_from_path, Mount};
use crate::protocol_constants::LISTENER_KEEPALIVE;

/// `GET /<mount-path>`: attach as a listener.
///
/// `?nobuffer=1` selects the short quality-switch prime. `Icy-MetaData: 1`
/// enables Shoutcast metadata blocks carrying the mount's now-playing.
pub(super) async fn stream_mount(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> GrimnirResult<Response> {
    let name = mount_name_from_path(uri.path(), None)
        .ok_or_else(|| GrimnirError::InvalidRequest("empty mount path".into()))?;
    let mount = state
        .mounts
        .by_name(&name)
        .into_iter()
        .next()
        .ok_or(GrimnirError::MountNotFound(name))?;

    let params = parse_query(uri.query().unwrap_or(""));
    let skip_buffer = params.get("nobuffer").map(String::as_str) == Some("1");
    let wants_icy = headers
        .get("icy-metadata")
        .and_then(|v| v.to_str().ok())
        == Some("1");

    let config = mount.config().clone();
    let listener = mount.attach_listener(skip_buffer);
    tracing::debug!(
        mount = config.name,
        listener = %listener.id,
        prime = listener.prime.len(),
        skip_buffer,
        "listener attached"
    );

    let body = listener_stream(Arc::clone(&mount), listener, wants_icy);

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, &config.content_type)
        .header(header::CACHE_CONTROL, "no-cache,no-store,must-revalidate")
        .header(header::CONNECTION, "keep-alive")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        // Reverse proxies must not buffer live audio.
        .header("X-Accel-Buffering", "no")
        .header("icy-br", config.bitrate_kbps.to_string())
        .header("icy-name", config.name.as_str());
    if wants_icy {
        builder = builder.header("icy-metaint", ICY_METAINT.to_string());
    }
    // Content-Length intentionally absent: the body streams chunked.

    builder
        .body(Body::from_stream(body))
        .map_err(|e| GrimnirError::InvalidRequest(e.to_string()))
}

/// Detaches the listener when the HTTP body is dropped.
struct DetachGuard {
    mount: Arc<Mount>,
    id: uuid::Uuid,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        self.mount.detach_listener(self.id);
    }
}

/// Per-listener pump: prime first, then live chunks; wake on the keepalive
/// interval so idle connections are noticed, stop on mount close or queue
/// end.
fn listener_stream(
    mount: Arc<Mount>,
    listener: crate::mount::AttachedListener,
    wants_icy: bool,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    let crate::mount::AttachedListener { id, prime, mut rx, cancel } = listener;
    // Constructed eagerly so a body that is dropped before its first poll
    // still detaches.
    let guard = DetachGuard {
        mount: Arc::clone(&mount),
        id,
    };
    stream! {
        let _guard = guard;
        let mut injector = wants_icy.then(IcyInjector::new);

        let mut emit = |chunk: Bytes| -> Bytes {
            match injector.as_mut() {
                Some(injector) => injector.inject(&chunk, mount.now_playing().as_deref()),
                None => chunk,
            }
        };

        if !prime.is_empty() {
            yield Ok(emit(prime));
        }

        let mut keepalive = tokio::time::interval(LISTENER_KEEPALIVE);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.reset();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = keepalive.tick() => {
                    // Wakeup only: chunked bodies need no filler bytes, the
                    // tick just keeps the task observably alive.
                    tracing::trace!(listener = %id, "keepalive tick");
                }
                chunk = rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    keepalive.reset();
                    yield Ok(emit(chunk));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::executor::ExecutorRegistry;
    use crate::live::LiveSessionRegistry;
    use crate::media::NullMediaEngine;
    use crate::mount::{MountConfig, MountRegistry};
    use crate::priority::arbiter::PriorityArbiter;
    use crate::store::MemoryStore;
    use crate::webhook::WebhookDispatcher;
    use crate::webstream::WebstreamMonitor;
    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    async fn state_with_mount() -> AppState {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::arc();
        let arbiter = PriorityArbiter::arc(store.clone(), bus.clone());
        let mounts = MountRegistry::new(bus.clone());
        mounts.insert(MountConfig {
            id: "m1".into(),
            station_id: "st1".into(),
            name: "live".into(),
            content_type: "audio/mpeg".into(),
            bitrate_kbps: 128,
            channels: 2,
            sample_rate: 44_100,
            format: "mp3".into(),
        });
        AppState {
            mounts,
            executors: ExecutorRegistry::new(
                store.clone(),
                Arc::new(NullMediaEngine),
                bus.clone(),
                arbiter.clone(),
                CancellationToken::new(),
            ),
            arbiter: arbiter.clone(),
            live: LiveSessionRegistry::arc(store.clone(), arbiter, bus.clone()),
            webstreams: WebstreamMonitor::new(store.clone(), bus.clone()),
            webhooks: WebhookDispatcher::new(store, bus.clone()),
            bus,
        }
    }

    async fn feed(state: &AppState, bytes: &[u8]) {
        let mount = state.mounts.get("m1").unwrap();
        let (mut writer, reader) = tokio::io::duplex(256 * 1024);
        use tokio::io::AsyncWriteExt;
        let feeder = tokio::spawn(async move { mount.feed_from(reader).await });
        writer.write_all(bytes).await.unwrap();
        drop(writer);
        feeder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn response_carries_streaming_headers() {
        let state = state_with_mount().await;
        let response = stream_mount(
            State(state),
            Uri::from_static("/live.mp3"),
            HeaderMap::new(),
        )
        .await
        .unwrap();

        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(
            headers[header::CACHE_CONTROL],
            "no-cache,no-store,must-revalidate"
        );
        assert_eq!(headers[header::CONNECTION], "keep-alive");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers["X-Accel-Buffering"], "no");
        assert_eq!(headers["icy-br"], "128");
        assert_eq!(headers["icy-name"], "live");
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert!(headers.get("icy-metaint").is_none());
    }

    #[tokio::test]
    async fn icy_listener_gets_metaint_header() {
        let state = state_with_mount().await;
        let mut headers = HeaderMap::new();
        headers.insert("icy-metadata", "1".parse().unwrap());
        let response = stream_mount(State(state), Uri::from_static("/live"), headers)
            .await
            .unwrap();
        assert_eq!(
            response.headers()["icy-metaint"],
            ICY_METAINT.to_string().as_str()
        );
    }

    #[tokio::test]
    async fn unknown_mount_is_not_found() {
        let state = state_with_mount().await;
        let err = stream_mount(
            State(state),
            Uri::from_static("/nosuch"),
            HeaderMap::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GrimnirError::MountNotFound(_)));
    }

    #[tokio::test]
    async fn prime_arrives_as_first_body_frame() {
        let state = state_with_mount().await;
        feed(&state, &vec![5u8; 40_000]).await;

        let response = stream_mount(
            State(state.clone()),
            Uri::from_static("/live"),
            HeaderMap::new(),
        )
        .await
        .unwrap();

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        // 2 s at 128 kbps = 32 kB prime.
        assert_eq!(first.len(), 32_000);
        assert!(first.iter().all(|b| *b == 5));
    }

    #[tokio::test]
    async fn nobuffer_prime_is_short() {
        let state = state_with_mount().await;
        feed(&state, &vec![6u8; 40_000]).await;

        let response = stream_mount(
            State(state.clone()),
            Uri::from_static("/live?nobuffer=1"),
            HeaderMap::new(),
        )
        .await
        .unwrap();

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 3_200);
    }

    #[tokio::test]
    async fn dropping_the_body_detaches_the_listener() {
        let state = state_with_mount().await;
        let response = stream_mount(
            State(state.clone()),
            Uri::from_static("/live"),
            HeaderMap::new(),
        )
        .await
        .unwrap();

        let mount = state.mounts.get("m1").unwrap();
        assert_eq!(mount.listener_count(), 1);

        drop(response);
        // Drop is synchronous on the body's stream.
        assert_eq!(mount.listener_count(), 0);
    }

    #[tokio::test]
    async fn empty_ring_still_attaches_and_streams_live() {
        let state = state_with_mount().await;
        let response = stream_mount(
            State(state.clone()),
            Uri::from_static("/live"),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        let mut body = response.into_body().into_data_stream();

        // No prime frame; the first frame is the first live chunk.
        let state2 = state.clone();
        tokio::spawn(async move { feed(&state2, b"LIVE").await });

        let first = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            body.next(),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(&first[..], b"LIVE");
    }
}
