//! Cross-node event fan-out over Redis pub/sub.
//!
//! Wraps the local [`EventBus`](super::EventBus): every publish is delivered
//! locally first, then mirrored to a Redis channel so sibling instances see
//! it. Remote delivery is best-effort; repeated failures trip a circuit
//! breaker and the bridge degrades to local-only until a timed re-probe
//! succeeds. Frames are tagged with the publishing instance id so a node
//! never re-delivers its own events.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use std::collections::VecDeque;

use super::{BusEvent, EventBus, EventType};
use crate::error::{GrimnirError, GrimnirResult};
use crate::protocol_constants::{
    BUS_CIRCUIT_PROBE_INTERVAL, BUS_CIRCUIT_THRESHOLD, BUS_REMOTE_PUBLISH_TIMEOUT,
};

/// How many recently-replayed inbound events are remembered for echo
/// suppression on the outbound forwarder.
const REPLAY_MEMO_DEPTH: usize = 128;

/// Wire frame carried on the Redis channel.
#[derive(Debug, Serialize, Deserialize)]
struct RemoteFrame {
    /// Publishing instance, used to suppress self-delivery.
    instance: String,
    event: BusEvent,
}

/// Failure-counting circuit breaker for the remote path.
///
/// Closed: attempts pass through. After `threshold` consecutive failures the
/// breaker opens and attempts are skipped until `probe_interval` has
/// elapsed, at which point exactly one probe attempt is allowed.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    probe_interval: Duration,
    consecutive_failures: u32,
    open_since: Option<Instant>,
    last_probe: Option<Instant>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(threshold: u32, probe_interval: Duration) -> Self {
        Self {
            threshold,
            probe_interval,
            consecutive_failures: 0,
            open_since: None,
            last_probe: None,
        }
    }

    /// Whether an attempt may be made at `now`.
    pub fn should_attempt(&mut self, now: Instant) -> bool {
        match self.open_since {
            None => true,
            Some(_) => {
                let probe_due = self
                    .last_probe
                    .map_or(true, |p| now.duration_since(p) >= self.probe_interval);
                if probe_due {
                    self.last_probe = Some(now);
                }
                probe_due
            }
        }
    }

    /// Records a successful attempt; closes the breaker.
    ///
    /// Returns `true` when this success recovered an open circuit.
    pub fn record_success(&mut self) -> bool {
        let recovered = self.open_since.is_some();
        self.consecutive_failures = 0;
        self.open_since = None;
        self.last_probe = None;
        recovered
    }

    /// Records a failed attempt.
    ///
    /// Returns `true` when this failure tripped the breaker open.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures += 1;
        if self.open_since.is_none() && self.consecutive_failures >= self.threshold {
            self.open_since = Some(now);
            self.last_probe = Some(now);
            return true;
        }
        false
    }

    /// Whether the breaker is currently open (degraded to local-only).
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open_since.is_some()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BUS_CIRCUIT_THRESHOLD, BUS_CIRCUIT_PROBE_INTERVAL)
    }
}

/// Event bus bridge multiplexing across nodes via Redis.
pub struct RemoteEventBus {
    local: Arc<EventBus>,
    client: redis::Client,
    conn: ConnectionManager,
    channel: String,
    instance_id: String,
    breaker: Mutex<CircuitBreaker>,
    replayed: ReplayMemo,
}

/// Fingerprints of inbound events just replayed onto the local bus; the
/// outbound forwarder drops these instead of echoing them back out under
/// this node's id.
#[derive(Default)]
struct ReplayMemo {
    entries: Mutex<VecDeque<String>>,
}

impl ReplayMemo {
    fn fingerprint(event: &BusEvent) -> String {
        serde_json::to_string(event).unwrap_or_default()
    }

    fn note(&self, event: &BusEvent) {
        let mut entries = self.entries.lock();
        if entries.len() >= REPLAY_MEMO_DEPTH {
            entries.pop_front();
        }
        entries.push_back(Self::fingerprint(event));
    }

    /// Consumes the memo entry for `event` if present.
    fn take(&self, event: &BusEvent) -> bool {
        let fingerprint = Self::fingerprint(event);
        let mut entries = self.entries.lock();
        match entries.iter().position(|f| *f == fingerprint) {
            Some(position) => {
                entries.remove(position);
                true
            }
            None => false,
        }
    }
}

impl RemoteEventBus {
    /// Connects the bridge. `redis_url` is a full `redis://` URL including
    /// credentials and database index.
    pub async fn connect(
        local: Arc<EventBus>,
        redis_url: &str,
        channel: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> GrimnirResult<Arc<Self>> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| GrimnirError::InvalidRequest(format!("redis url: {e}")))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| GrimnirError::Database(format!("redis connect: {e}")))?;

        Ok(Arc::new(Self {
            local,
            client,
            conn,
            channel: channel.into(),
            instance_id: instance_id.into(),
            breaker: Mutex::new(CircuitBreaker::default()),
            replayed: ReplayMemo::default(),
        }))
    }

    /// The wrapped local bus.
    #[must_use]
    pub fn local(&self) -> &Arc<EventBus> {
        &self.local
    }

    /// Publishes locally, then mirrors to the Redis channel unless the
    /// circuit breaker is open.
    pub async fn publish(&self, event: &BusEvent) {
        self.local.publish(event);
        self.publish_remote(event).await;
    }

    /// Remote mirror half: best-effort, breaker-gated.
    async fn publish_remote(&self, event: &BusEvent) {
        if !self.breaker.lock().should_attempt(Instant::now()) {
            return;
        }

        let frame = RemoteFrame {
            instance: self.instance_id.clone(),
            event: event.clone(),
        };
        let payload = match serde_json::to_string(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode remote bus frame");
                return;
            }
        };

        let mut conn = self.conn.clone();
        let channel = self.channel.clone();
        let result = tokio::time::timeout(
            BUS_REMOTE_PUBLISH_TIMEOUT,
            conn.publish::<_, _, ()>(channel, payload),
        )
        .await;

        let mut breaker = self.breaker.lock();
        match result {
            Ok(Ok(())) => {
                if breaker.record_success() {
                    tracing::info!("remote event bus recovered, resuming cross-node delivery");
                }
            }
            Ok(Err(e)) => {
                if breaker.record_failure(Instant::now()) {
                    tracing::warn!(error = %e, "remote event bus degraded to local-only");
                }
            }
            Err(_) => {
                if breaker.record_failure(Instant::now()) {
                    tracing::warn!("remote event bus publish timed out, degraded to local-only");
                }
            }
        }
    }

    /// Spawns both halves of the bridge: the inbound subscriber that
    /// replays sibling events onto the local bus, and the outbound
    /// forwarder that mirrors locally-published events to Redis. Replayed
    /// events are remembered briefly so the forwarder does not echo them
    /// back out under this node's id.
    pub fn spawn_subscriber(self: &Arc<Self>, cancel: CancellationToken) {
        let bridge = Arc::clone(self);
        let inbound_cancel = cancel.child_token();
        tokio::spawn(async move {
            loop {
                if inbound_cancel.is_cancelled() {
                    return;
                }
                match bridge.run_subscriber_once(&inbound_cancel).await {
                    Ok(()) => return, // cancelled
                    Err(e) => {
                        tracing::warn!(error = %e, "remote bus subscriber lost, reconnecting");
                        tokio::select! {
                            _ = inbound_cancel.cancelled() => return,
                            _ = tokio::time::sleep(BUS_CIRCUIT_PROBE_INTERVAL) => {}
                        }
                    }
                }
            }
        });

        let bridge = Arc::clone(self);
        let outbound_cancel = cancel.child_token();
        let mut sub = self.local.subscribe_many(&EventType::ALL);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = outbound_cancel.cancelled() => return,
                    event = sub.recv() => {
                        let Some(event) = event else { return };
                        if bridge.replayed.take(&event) {
                            continue;
                        }
                        bridge.publish_remote(&event).await;
                    }
                }
            }
        });
    }

    async fn run_subscriber_once(&self, cancel: &CancellationToken) -> GrimnirResult<()> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| GrimnirError::Database(format!("redis pubsub: {e}")))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| GrimnirError::Database(format!("redis subscribe: {e}")))?;

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = stream.next() => {
                    let Some(message) = message else {
                        return Err(GrimnirError::Database("redis pubsub stream ended".into()));
                    };
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!(error = %e, "unreadable remote bus frame");
                            continue;
                        }
                    };
                    match serde_json::from_str::<RemoteFrame>(&payload) {
                        Ok(frame) if frame.instance == self.instance_id => {}
                        Ok(frame) => {
                            self.replayed.note(&frame.event);
                            self.local.publish(&frame.event);
                        }
                        Err(e) => tracing::warn!(error = %e, "undecodable remote bus frame"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_stays_closed_below_threshold() {
        let mut breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        let now = Instant::now();
        for _ in 0..4 {
            assert!(!breaker.record_failure(now));
        }
        assert!(!breaker.is_open());
        assert!(breaker.should_attempt(now));
    }

    #[test]
    fn breaker_opens_at_threshold_and_skips_attempts() {
        let mut breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        let now = Instant::now();
        for _ in 0..4 {
            breaker.record_failure(now);
        }
        assert!(breaker.record_failure(now));
        assert!(breaker.is_open());

        // Inside the probe interval attempts are skipped.
        assert!(!breaker.should_attempt(now + Duration::from_secs(5)));
    }

    #[test]
    fn breaker_allows_single_probe_after_interval() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        let t0 = Instant::now();
        breaker.record_failure(t0);
        assert!(breaker.is_open());

        let t1 = t0 + Duration::from_secs(31);
        assert!(breaker.should_attempt(t1));
        // Immediately after, the next attempt is suppressed again.
        assert!(!breaker.should_attempt(t1 + Duration::from_millis(10)));
    }

    #[test]
    fn success_closes_breaker_and_reports_recovery() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure(Instant::now());
        assert!(breaker.is_open());
        assert!(breaker.record_success());
        assert!(!breaker.is_open());
        // A success with a closed breaker is not a recovery.
        assert!(!breaker.record_success());
    }

    #[test]
    fn replay_memo_consumes_exactly_once() {
        let memo = ReplayMemo::default();
        let event = BusEvent::Audit {
            station_id: None,
            action: "replayed".into(),
            detail: String::new(),
        };
        assert!(!memo.take(&event));
        memo.note(&event);
        assert!(memo.take(&event));
        assert!(!memo.take(&event));
    }

    #[test]
    fn replay_memo_is_bounded() {
        let memo = ReplayMemo::default();
        for i in 0..(REPLAY_MEMO_DEPTH + 10) {
            memo.note(&BusEvent::Audit {
                station_id: None,
                action: format!("a{i}"),
                detail: String::new(),
            });
        }
        assert_eq!(memo.entries.lock().len(), REPLAY_MEMO_DEPTH);
        // The oldest entries were evicted.
        assert!(!memo.take(&BusEvent::Audit {
            station_id: None,
            action: "a0".into(),
            detail: String::new(),
        }));
    }

    #[test]
    fn intermittent_failures_reset_on_success() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        let now = Instant::now();
        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_success();
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert!(!breaker.is_open());
    }
}
