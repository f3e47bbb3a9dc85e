//! Fixed protocol and timing constants.
//!
//! These values come from external protocol expectations (Icecast source
//! clients, HTTP streaming renderers) or from the runtime contract between
//! subsystems. Changing them changes observable behavior, not just tuning.

use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Mount fan-out
// ─────────────────────────────────────────────────────────────────────────────

/// Read/fan-out chunk size for producer feeds (bytes).
pub const FEED_CHUNK_SIZE: usize = 4 * 1024;

/// Per-listener outgoing queue capacity, in chunks.
///
/// A listener that falls this far behind starts dropping chunks; the feed and
/// the other listeners are never slowed.
pub const LISTENER_QUEUE_CHUNKS: usize = 256;

/// Interval between keepalive wakeups on an otherwise idle listener.
pub const LISTENER_KEEPALIVE: Duration = Duration::from_secs(30);

/// Ring buffer retention window (seconds of audio at the mount bitrate).
pub const RING_BUFFER_SECONDS: u64 = 5;

/// Floor for the ring buffer capacity regardless of bitrate (bytes).
pub const RING_BUFFER_MIN_BYTES: usize = 20_000;

/// Prime size for the quality-switch path (`?nobuffer=1`): about 200 ms of
/// audio, never less than this many bytes.
pub const PRIME_NOBUFFER_MIN_BYTES: usize = 1_000;

/// Bounds for the normal 2-second listener prime (bytes).
pub const PRIME_MIN_BYTES: usize = 8 * 1024;
pub const PRIME_MAX_BYTES: usize = 64 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// ICY protocol (Shoutcast/Icecast metadata)
// ─────────────────────────────────────────────────────────────────────────────

/// ICY metadata interval (bytes of audio between metadata blocks).
pub const ICY_METAINT: usize = 8192;

// ─────────────────────────────────────────────────────────────────────────────
// Event bus
// ─────────────────────────────────────────────────────────────────────────────

/// Default per-subscriber queue capacity.
pub const BUS_QUEUE_CAPACITY: usize = 8;

/// Queue capacity for hot topics (priority changes, listener stats).
pub const BUS_HOT_QUEUE_CAPACITY: usize = 16;

/// Consecutive remote publish failures before the bridge degrades to
/// local-only delivery.
pub const BUS_CIRCUIT_THRESHOLD: u32 = 5;

/// Minimum interval between remote-bus recovery probes once the circuit
/// breaker has tripped.
pub const BUS_CIRCUIT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for a single publish to the remote broker.
pub const BUS_REMOTE_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

// ─────────────────────────────────────────────────────────────────────────────
// Executor
// ─────────────────────────────────────────────────────────────────────────────

/// Heartbeat update interval per running station.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A station is healthy while its last heartbeat is younger than this.
pub const HEARTBEAT_HEALTHY_WITHIN: Duration = Duration::from_secs(10);

/// Delay before retrying a media-engine call that failed transiently.
pub const ENGINE_RETRY_DELAY: Duration = Duration::from_secs(2);

// ─────────────────────────────────────────────────────────────────────────────
// External call timeouts
// ─────────────────────────────────────────────────────────────────────────────

/// Media-engine control calls (play, preload, stop, fade).
pub const ENGINE_CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

/// Media-engine liveness ping.
pub const ENGINE_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Webstream health checks.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Outgoing webhook deliveries.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Harbor: the source client must produce its first audio bytes within this
/// deadline; after that reads are unbounded for the life of the session.
pub const HARBOR_FIRST_READ_TIMEOUT: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────────────────────────────────────
// Harbor ingest
// ─────────────────────────────────────────────────────────────────────────────

/// Default harbor bind port.
pub const HARBOR_DEFAULT_PORT: u16 = 8088;

/// Default cap on concurrent source connections.
pub const HARBOR_DEFAULT_MAX_SOURCES: usize = 10;

/// Maximum accepted size of an ingest request head (request line + headers).
pub const HARBOR_MAX_HEAD_BYTES: usize = 8 * 1024;

/// Content type assumed when a source client sends none.
pub const HARBOR_DEFAULT_CONTENT_TYPE: &str = "audio/mpeg";

// ─────────────────────────────────────────────────────────────────────────────
// Webhooks / show transitions
// ─────────────────────────────────────────────────────────────────────────────

/// Interval of the show-transition scan across active stations.
pub const SHOW_SCAN_INTERVAL: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────────────────────────
// Application identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name used in stream headers (`icy-name` falls back to this
/// when a mount carries no display name).
pub const APP_NAME: &str = "Grimnir Radio";

/// User-agent for webstream health checks.
pub const HEALTH_CHECK_USER_AGENT: &str =
    concat!("Grimnir-Radio/", env!("CARGO_PKG_VERSION"));

/// User-agent for outgoing webhook deliveries.
pub const WEBHOOK_USER_AGENT: &str = "Grimnir-Radio-Webhook/1.0";
