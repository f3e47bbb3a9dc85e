//! Webstream relay health checking and failover.
//!
//! Each relayed external stream carries an ordered URL chain. A background
//! checker probes the current URL on its configured interval; on a
//! confirmed failure it advances down the chain, and with auto-recover it
//! probes the primary while off it and snaps back as soon as the primary
//! answers again. The transition rules are a pure function so the policy is
//! testable without a network.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, EventBus};
use crate::error::{GrimnirError, GrimnirResult};
use crate::protocol_constants::{HEALTH_CHECK_TIMEOUT, HEALTH_CHECK_USER_AGENT};
use crate::store::Store;

/// Health state of the relay's current URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// Not yet probed (fresh stream or fresh failover target).
    Unknown,
}

impl HealthStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(Self::Healthy),
            "degraded" => Some(Self::Degraded),
            "unhealthy" => Some(Self::Unhealthy),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Probe method for health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthCheckMethod {
    Head,
    Get,
}

/// A relayed external HTTP audio source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webstream {
    pub id: String,
    pub station_id: String,
    /// Ordered URL chain, primary first.
    pub urls: Vec<String>,
    pub current_index: usize,
    pub health_status: HealthStatus,
    pub health_check_enabled: bool,
    pub check_interval_secs: u64,
    pub check_timeout_secs: u64,
    pub check_method: HealthCheckMethod,
    pub failover_enabled: bool,
    /// A failure must persist this long before failover fires.
    pub grace_ms: u64,
    pub auto_recover: bool,
    pub last_check: Option<DateTime<Utc>>,
}

impl Webstream {
    /// The URL currently being relayed: `urls[current_index]`.
    pub fn current_url(&self) -> GrimnirResult<&str> {
        if self.urls.is_empty() {
            return Err(GrimnirError::NoUrls(self.id.clone()));
        }
        self.urls
            .get(self.current_index)
            .map(String::as_str)
            .ok_or_else(|| GrimnirError::InvalidUrl(format!("index {} out of chain", self.current_index)))
    }

    /// Index the chain advances to from `current_index`, or `None` when the
    /// chain is exhausted. Wraps to the primary only under auto-recover.
    #[must_use]
    pub fn next_index(&self) -> Option<usize> {
        let next = self.current_index + 1;
        if next < self.urls.len() {
            Some(next)
        } else if self.auto_recover && self.urls.len() > 1 {
            Some(0)
        } else {
            None
        }
    }
}

/// Events a check evaluation decides to publish.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Failover {
        from_url: String,
        to_url: String,
        manual: bool,
    },
    Recovered {
        url: String,
    },
}

/// Outcome of evaluating one round of probes.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub new_index: usize,
    pub new_status: HealthStatus,
    pub event: Option<RelayEvent>,
}

/// Pure transition policy.
///
/// * `current_ok`: did the current URL answer 2xx/3xx.
/// * `primary_ok`: probe of the primary, only taken while off it with
///   auto-recover on.
/// * `unhealthy_for`: how long the current URL has been failing, for the
///   grace window.
pub fn evaluate(
    stream: &Webstream,
    current_ok: bool,
    primary_ok: Option<bool>,
    unhealthy_for: Duration,
) -> Evaluation {
    if current_ok {
        // Recovery path: healthy again, and the primary answers while we sit
        // on a backup.
        if stream.current_index != 0 && stream.auto_recover && primary_ok == Some(true) {
            return Evaluation {
                new_index: 0,
                new_status: HealthStatus::Healthy,
                event: Some(RelayEvent::Recovered {
                    url: stream.urls[0].clone(),
                }),
            };
        }
        return Evaluation {
            new_index: stream.current_index,
            new_status: HealthStatus::Healthy,
            event: None,
        };
    }

    // Current URL failing. Inside the grace window we only degrade.
    if unhealthy_for < Duration::from_millis(stream.grace_ms) {
        return Evaluation {
            new_index: stream.current_index,
            new_status: HealthStatus::Degraded,
            event: None,
        };
    }

    if stream.failover_enabled {
        if let Some(next) = stream.next_index() {
            // Only fail over once per outage: an already-unhealthy stream
            // that could not advance stays put.
            if stream.health_status != HealthStatus::Unhealthy {
                return Evaluation {
                    new_index: next,
                    new_status: HealthStatus::Unknown,
                    event: Some(RelayEvent::Failover {
                        from_url: stream.urls[stream.current_index].clone(),
                        to_url: stream.urls[next].clone(),
                        manual: false,
                    }),
                };
            }
        }
    }

    Evaluation {
        new_index: stream.current_index,
        new_status: HealthStatus::Unhealthy,
        event: None,
    }
}

/// Background monitor owning the per-stream check loops.
pub struct WebstreamMonitor {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    client: reqwest::Client,
    /// When the current URL started failing, per stream.
    failing_since: DashMap<String, Instant>,
}

impl WebstreamMonitor {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .user_agent(HEALTH_CHECK_USER_AGENT)
            // 3xx counts as healthy; do not chase redirects.
            .redirect(Policy::none())
            .timeout(HEALTH_CHECK_TIMEOUT)
            .build()
            .expect("health check client");
        Arc::new(Self {
            store,
            bus,
            client,
            failing_since: DashMap::new(),
        })
    }

    /// Spawns one checker task per monitored webstream.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> GrimnirResult<()> {
        let streams = self.store.monitored_webstreams().await?;
        tracing::info!(count = streams.len(), "starting webstream health checkers");
        for stream in streams {
            let monitor = Arc::clone(self);
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                monitor.run_checker(stream.id.clone(), cancel).await;
            });
        }
        Ok(())
    }

    async fn run_checker(&self, stream_id: String, cancel: CancellationToken) {
        loop {
            // Reload each round: manual ops and other instances move the
            // chain underneath us.
            let stream = match self.store.webstream(&stream_id).await {
                Ok(Some(stream)) if stream.health_check_enabled => stream,
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(webstream = stream_id, error = %e, "webstream reload failed");
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    continue;
                }
            };

            if let Err(e) = self.check_once(&stream).await {
                tracing::warn!(webstream = stream.id, error = %e, "health check round failed");
            }

            let interval = Duration::from_secs(stream.check_interval_secs.max(1));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One probe round: current URL, plus the primary while off it.
    async fn check_once(&self, stream: &Webstream) -> GrimnirResult<()> {
        let current_url = stream.current_url()?;
        let current_ok = self.probe(stream, current_url).await;

        let primary_ok = if stream.current_index != 0 && stream.auto_recover {
            Some(self.probe(stream, &stream.urls[0]).await)
        } else {
            None
        };

        let unhealthy_for = if current_ok {
            self.failing_since.remove(&stream.id);
            Duration::ZERO
        } else {
            let since = *self
                .failing_since
                .entry(stream.id.clone())
                .or_insert_with(Instant::now);
            since.elapsed()
        };

        let evaluation = evaluate(stream, current_ok, primary_ok, unhealthy_for);
        self.apply(stream, evaluation).await
    }

    async fn probe(&self, stream: &Webstream, url: &str) -> bool {
        let request = match stream.check_method {
            HealthCheckMethod::Head => self.client.head(url),
            HealthCheckMethod::Get => self.client.get(url),
        };
        let result = request
            .header("Icy-MetaData", "1")
            .timeout(Duration::from_secs(stream.check_timeout_secs.max(1)))
            .send()
            .await;
        match result {
            Ok(response) => {
                let status = response.status();
                status.is_success() || status.is_redirection()
            }
            Err(_) => false,
        }
    }

    /// Persists an evaluation and publishes its event. Status is committed
    /// before the event goes out.
    async fn apply(&self, stream: &Webstream, evaluation: Evaluation) -> GrimnirResult<()> {
        let changed = evaluation.new_index != stream.current_index
            || evaluation.new_status != stream.health_status;
        if changed || stream.last_check.is_none() {
            self.store
                .update_webstream_status(
                    &stream.id,
                    evaluation.new_index,
                    evaluation.new_status,
                    Utc::now(),
                )
                .await?;
        }
        if evaluation.new_index != stream.current_index {
            self.failing_since.remove(&stream.id);
        }

        match evaluation.event {
            Some(RelayEvent::Failover {
                from_url,
                to_url,
                manual,
            }) => self.bus.publish(&BusEvent::WebstreamFailover {
                webstream_id: stream.id.clone(),
                station_id: stream.station_id.clone(),
                from_url,
                to_url,
                manual,
            }),
            Some(RelayEvent::Recovered { url }) => {
                self.bus.publish(&BusEvent::WebstreamRecovered {
                    webstream_id: stream.id.clone(),
                    station_id: stream.station_id.clone(),
                    url,
                })
            }
            None => {}
        }
        Ok(())
    }

    /// Operator-forced advance to the next URL in the chain.
    pub async fn trigger_failover(&self, stream_id: &str) -> GrimnirResult<Webstream> {
        let stream = self
            .store
            .webstream(stream_id)
            .await?
            .ok_or_else(|| GrimnirError::WebstreamNotFound(stream_id.to_string()))?;
        let from_url = stream.current_url()?.to_string();
        let next = stream.next_index().ok_or_else(|| {
            GrimnirError::InvalidRequest("webstream URL chain is exhausted".into())
        })?;

        self.apply(
            &stream,
            Evaluation {
                new_index: next,
                new_status: HealthStatus::Unknown,
                event: Some(RelayEvent::Failover {
                    from_url,
                    to_url: stream.urls[next].clone(),
                    manual: true,
                }),
            },
        )
        .await?;

        self.store
            .webstream(stream_id)
            .await?
            .ok_or_else(|| GrimnirError::WebstreamNotFound(stream_id.to_string()))
    }

    /// Operator-forced return to the primary URL.
    pub async fn reset_to_primary(&self, stream_id: &str) -> GrimnirResult<Webstream> {
        let stream = self
            .store
            .webstream(stream_id)
            .await?
            .ok_or_else(|| GrimnirError::WebstreamNotFound(stream_id.to_string()))?;
        if stream.urls.is_empty() {
            return Err(GrimnirError::NoUrls(stream.id));
        }

        self.apply(
            &stream,
            Evaluation {
                new_index: 0,
                new_status: HealthStatus::Unknown,
                event: None,
            },
        )
        .await?;

        self.store
            .webstream(stream_id)
            .await?
            .ok_or_else(|| GrimnirError::WebstreamNotFound(stream_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventType;
    use crate::store::MemoryStore;

    fn stream(urls: &[&str], index: usize, status: HealthStatus) -> Webstream {
        Webstream {
            id: "ws1".into(),
            station_id: "st1".into(),
            urls: urls.iter().map(|s| s.to_string()).collect(),
            current_index: index,
            health_status: status,
            health_check_enabled: true,
            check_interval_secs: 30,
            check_timeout_secs: 10,
            check_method: HealthCheckMethod::Head,
            failover_enabled: true,
            grace_ms: 0,
            auto_recover: true,
            last_check: None,
        }
    }

    #[test]
    fn current_url_tracks_index() {
        let s = stream(&["http://p", "http://b"], 1, HealthStatus::Healthy);
        assert_eq!(s.current_url().unwrap(), "http://b");
        assert!(stream(&[], 0, HealthStatus::Unknown).current_url().is_err());
    }

    #[test]
    fn failure_on_primary_advances_to_backup() {
        let s = stream(&["http://p", "http://b"], 0, HealthStatus::Healthy);
        let eval = evaluate(&s, false, None, Duration::ZERO);
        assert_eq!(eval.new_index, 1);
        assert_eq!(
            eval.event,
            Some(RelayEvent::Failover {
                from_url: "http://p".into(),
                to_url: "http://b".into(),
                manual: false,
            })
        );
    }

    #[test]
    fn primary_recovery_snaps_back() {
        let s = stream(&["http://p", "http://b"], 1, HealthStatus::Healthy);
        let eval = evaluate(&s, true, Some(true), Duration::ZERO);
        assert_eq!(eval.new_index, 0);
        assert_eq!(
            eval.event,
            Some(RelayEvent::Recovered {
                url: "http://p".into()
            })
        );
    }

    #[test]
    fn no_recovery_while_primary_still_down() {
        let s = stream(&["http://p", "http://b"], 1, HealthStatus::Healthy);
        let eval = evaluate(&s, true, Some(false), Duration::ZERO);
        assert_eq!(eval.new_index, 1);
        assert!(eval.event.is_none());
    }

    #[test]
    fn grace_window_defers_failover() {
        let mut s = stream(&["http://p", "http://b"], 0, HealthStatus::Healthy);
        s.grace_ms = 5_000;

        let early = evaluate(&s, false, None, Duration::from_millis(1_000));
        assert_eq!(early.new_index, 0);
        assert_eq!(early.new_status, HealthStatus::Degraded);
        assert!(early.event.is_none());

        let late = evaluate(&s, false, None, Duration::from_millis(6_000));
        assert_eq!(late.new_index, 1);
        assert!(late.event.is_some());
    }

    #[test]
    fn exhausted_chain_without_auto_recover_stops() {
        let mut s = stream(&["http://p", "http://b"], 1, HealthStatus::Healthy);
        s.auto_recover = false;
        let eval = evaluate(&s, false, None, Duration::ZERO);
        assert_eq!(eval.new_index, 1);
        assert_eq!(eval.new_status, HealthStatus::Unhealthy);
        assert!(eval.event.is_none());
    }

    #[test]
    fn chain_wraps_to_primary_under_auto_recover() {
        let s = stream(&["http://p", "http://b"], 1, HealthStatus::Healthy);
        let eval = evaluate(&s, false, None, Duration::ZERO);
        assert_eq!(eval.new_index, 0);
        assert_eq!(
            eval.event,
            Some(RelayEvent::Failover {
                from_url: "http://b".into(),
                to_url: "http://p".into(),
                manual: false,
            })
        );
    }

    #[test]
    fn already_unhealthy_does_not_refire_failover() {
        let mut s = stream(&["http://p"], 0, HealthStatus::Unhealthy);
        s.auto_recover = false;
        let eval = evaluate(&s, false, None, Duration::ZERO);
        assert_eq!(eval.new_index, 0);
        assert!(eval.event.is_none());
    }

    #[tokio::test]
    async fn manual_failover_then_reset_restores_primary() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::arc();
        store.insert_webstream(stream(&["http://p", "http://b"], 0, HealthStatus::Healthy));

        let monitor = WebstreamMonitor::new(store.clone(), bus.clone());
        let mut events = bus.subscribe(EventType::WebstreamFailover);

        let after = monitor.trigger_failover("ws1").await.unwrap();
        assert_eq!(after.current_index, 1);
        assert_eq!(after.current_url().unwrap(), "http://b");
        match events.try_recv().unwrap() {
            BusEvent::WebstreamFailover { manual, to_url, .. } => {
                assert!(manual);
                assert_eq!(to_url, "http://b");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let after = monitor.reset_to_primary("ws1").await.unwrap();
        assert_eq!(after.current_index, 0);
        assert_eq!(after.current_url().unwrap(), "http://p");
    }

    #[tokio::test]
    async fn manual_failover_on_unknown_stream_errors() {
        let store = Arc::new(MemoryStore::new());
        let monitor = WebstreamMonitor::new(store, EventBus::arc());
        assert!(matches!(
            monitor.trigger_failover("nope").await,
            Err(GrimnirError::WebstreamNotFound(_))
        ));
    }
}
