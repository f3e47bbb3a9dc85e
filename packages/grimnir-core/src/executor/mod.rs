//! Per-station executor: realizes the arbiter's decisions by driving the
//! media engine and walking the lifecycle state machine.
//!
//! Each started station owns three background workers (heartbeat, priority
//! listener and, with a connected engine, telemetry) all hanging off one
//! cancellation token. Transitions are validated against the allowed-edge
//! table and serialized behind the per-station mutex; the row persists
//! through the store so state survives restarts. Media-engine failures
//! never corrupt the state machine: the transition commits, the error
//! surfaces, and a retry is scheduled.

pub mod state;

pub use state::{ExecutorPhase, ExecutorStateRow, Telemetry};

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, EventBus, EventType};
use crate::clock::SlotPlan;
use crate::error::{GrimnirError, GrimnirResult};
use crate::media::MediaEngine;
use crate::priority::{arbiter::PriorityArbiter, PriorityLevel, PrioritySource};
use crate::protocol_constants::{
    ENGINE_RETRY_DELAY, HEARTBEAT_HEALTHY_WITHIN, HEARTBEAT_INTERVAL,
};
use crate::store::Store;

/// One station's running executor.
pub struct StationExecutor {
    station_id: String,
    store: Arc<dyn Store>,
    engine: Arc<dyn MediaEngine>,
    bus: Arc<EventBus>,
    arbiter: Arc<PriorityArbiter>,
    /// Serializes transitions; never held across engine calls' retries.
    inner: Mutex<ExecutorStateRow>,
    cancel: CancellationToken,
}

impl StationExecutor {
    /// Initializes (or resumes) the station's state and starts the
    /// background workers.
    pub async fn start(
        station_id: &str,
        store: Arc<dyn Store>,
        engine: Arc<dyn MediaEngine>,
        bus: Arc<EventBus>,
        arbiter: Arc<PriorityArbiter>,
        cancel: CancellationToken,
    ) -> GrimnirResult<Arc<Self>> {
        let row = match store.executor_state(station_id).await? {
            Some(row) => row,
            None => {
                let row = ExecutorStateRow::idle(station_id);
                store.save_executor_state(&row).await?;
                row
            }
        };
        tracing::info!(
            station = station_id,
            phase = row.phase.as_str(),
            "executor starting"
        );

        let executor = Arc::new(Self {
            station_id: station_id.to_string(),
            store,
            engine,
            bus,
            arbiter,
            inner: Mutex::new(row),
            cancel,
        });
        executor.spawn_heartbeat();
        executor.spawn_priority_listener();
        if executor.engine.connected() {
            executor.spawn_telemetry();
        }
        Ok(executor)
    }

    #[must_use]
    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    /// Current state snapshot.
    pub async fn snapshot(&self) -> ExecutorStateRow {
        self.inner.lock().await.clone()
    }

    /// Healthy while the heartbeat is younger than the liveness window.
    pub async fn is_healthy(&self) -> bool {
        let row = self.inner.lock().await;
        Utc::now() - row.last_heartbeat
            < chrono::Duration::from_std(HEARTBEAT_HEALTHY_WITHIN).expect("window fits")
    }

    // ── Operations ──────────────────────────────────────────────────────

    /// Stages the next slot: `* → preloading` with `next_source` recorded.
    pub async fn preload(&self, plan: &SlotPlan) -> GrimnirResult<()> {
        {
            let mut row = self.inner.lock().await;
            self.transition(&mut row, ExecutorPhase::Preloading).await?;
            row.next_source = Some(plan.slot_id.clone());
            self.store.save_executor_state(&row).await?;
        }

        if let Err(e) = self.engine.preload(&self.station_id, plan).await {
            tracing::warn!(station = self.station_id, error = %e, "engine preload failed");
            return Err(e);
        }
        Ok(())
    }

    /// Starts playback of a source. The target phase follows the priority:
    /// emergency at 0, live at 1/2, playing otherwise.
    ///
    /// The state commits even when the engine call fails; the error is
    /// surfaced and the play is retried once after a short delay.
    pub async fn play(self: &Arc<Self>, source: &PrioritySource) -> GrimnirResult<()> {
        let target = ExecutorPhase::for_priority(source.priority);
        {
            let mut row = self.inner.lock().await;
            // Re-delivery of the current source is a no-op, not a self-edge.
            if row.phase == target && row.current_source.as_deref() == Some(&source.source_id) {
                return Ok(());
            }
            self.transition(&mut row, target).await?;
            row.priority = Some(source.priority);
            row.current_source = Some(source.source_id.clone());
            row.next_source = None;
            self.store.save_executor_state(&row).await?;
        }

        if let Err(e) = self.engine.play(&self.station_id, source).await {
            tracing::warn!(
                station = self.station_id,
                source = source.source_id,
                error = %e,
                "engine play failed, scheduling retry"
            );
            self.schedule_play_retry(source.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Begins a crossfade: `playing → fading` with the fade target stored.
    pub async fn fade(
        &self,
        next_source: &str,
        _next_priority: PriorityLevel,
        duration_ms: u64,
    ) -> GrimnirResult<()> {
        {
            let mut row = self.inner.lock().await;
            self.transition(&mut row, ExecutorPhase::Fading).await?;
            row.next_source = Some(next_source.to_string());
            self.store.save_executor_state(&row).await?;
        }

        if let Err(e) = self
            .engine
            .crossfade(&self.station_id, next_source, duration_ms)
            .await
        {
            tracing::warn!(station = self.station_id, error = %e, "engine crossfade failed");
            return Err(e);
        }
        Ok(())
    }

    /// Finishes a fade: promotes `next_source` to current. Valid only in
    /// `fading`; the target phase follows the arbiter's current priority.
    pub async fn complete_fade(&self) -> GrimnirResult<()> {
        let priority = self
            .arbiter
            .current(&self.station_id)
            .await?
            .map_or(PriorityLevel::Automation, |c| c.priority);

        let mut row = self.inner.lock().await;
        if row.phase != ExecutorPhase::Fading {
            return Err(GrimnirError::InvalidTransition {
                from: row.phase,
                to: ExecutorPhase::for_priority(priority),
            });
        }
        self.transition(&mut row, ExecutorPhase::for_priority(priority))
            .await?;
        row.priority = Some(priority);
        row.current_source = row.next_source.take();
        self.store.save_executor_state(&row).await?;
        Ok(())
    }

    /// Cancels the workers and parks the station in `idle`.
    pub async fn stop(&self) -> GrimnirResult<()> {
        {
            let mut row = self.inner.lock().await;
            if row.phase != ExecutorPhase::Idle {
                self.transition(&mut row, ExecutorPhase::Idle).await?;
            }
            row.priority = None;
            row.current_source = None;
            row.next_source = None;
            self.store.save_executor_state(&row).await?;
        }
        self.cancel.cancel();

        if let Err(e) = self.engine.stop(&self.station_id).await {
            tracing::debug!(station = self.station_id, error = %e, "engine stop failed");
        }
        Ok(())
    }

    /// Validates and applies a phase change; logs and publishes the edge.
    async fn transition(
        &self,
        row: &mut ExecutorStateRow,
        to: ExecutorPhase,
    ) -> GrimnirResult<()> {
        let from = row.phase;
        if !from.can_transition(to) {
            return Err(GrimnirError::InvalidTransition { from, to });
        }
        row.phase = to;
        tracing::info!(
            station = self.station_id,
            from = from.as_str(),
            to = to.as_str(),
            "executor transition"
        );
        self.bus.publish(&BusEvent::ExecutorTransition {
            station_id: self.station_id.clone(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
            source_id: row.current_source.clone(),
        });
        Ok(())
    }

    fn schedule_play_retry(self: &Arc<Self>, source: PrioritySource) {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = executor.cancel.cancelled() => {}
                _ = tokio::time::sleep(ENGINE_RETRY_DELAY) => {
                    if let Err(e) = executor.engine.play(&executor.station_id, &source).await {
                        tracing::warn!(
                            station = executor.station_id,
                            error = %e,
                            "engine play retry failed"
                        );
                    }
                }
            }
        });
    }

    // ── Workers ─────────────────────────────────────────────────────────

    fn spawn_heartbeat(self: &Arc<Self>) {
        let executor = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let row = {
                            let mut row = executor.inner.lock().await;
                            row.last_heartbeat = Utc::now();
                            row.clone()
                        };
                        if let Err(e) = executor.store.save_executor_state(&row).await {
                            // Heartbeat failures never change state.
                            tracing::warn!(
                                station = executor.station_id,
                                error = %e,
                                "heartbeat persist failed"
                            );
                        }
                    }
                }
            }
        });
    }

    fn spawn_priority_listener(self: &Arc<Self>) {
        let executor = Arc::clone(self);
        let cancel = self.cancel.child_token();
        let mut sub = self.bus.subscribe_many(&[
            EventType::PriorityChange,
            EventType::PriorityEmergency,
            EventType::PriorityReleased,
        ]);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = sub.recv() => {
                        let Some(event) = event else { return };
                        executor.handle_priority_event(event).await;
                    }
                }
            }
        });
    }

    /// Reacts to arbiter events for this station by playing whatever the
    /// arbiter now says is current.
    pub(crate) async fn handle_priority_event(self: &Arc<Self>, event: BusEvent) {
        let station_id = match &event {
            BusEvent::PriorityChange { station_id, .. }
            | BusEvent::PriorityEmergency { station_id, .. }
            | BusEvent::PriorityReleased { station_id, .. } => station_id,
            _ => return,
        };
        if station_id != &self.station_id {
            return;
        }

        // The event is a hint; the arbiter holds the truth. Re-reading it
        // collapses bursts onto the latest selection.
        let current = match self.arbiter.current(&self.station_id).await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(station = self.station_id, error = %e, "arbiter read failed");
                return;
            }
        };

        match current {
            Some(source) => {
                if let Err(e) = self.play(&source).await {
                    tracing::warn!(
                        station = self.station_id,
                        source = source.source_id,
                        error = %e,
                        "priority-driven play failed"
                    );
                }
            }
            None => {
                // Nothing claims the station; park it.
                let result = {
                    let mut row = self.inner.lock().await;
                    if row.phase == ExecutorPhase::Idle {
                        Ok(())
                    } else {
                        let result = self.transition(&mut row, ExecutorPhase::Idle).await;
                        if result.is_ok() {
                            row.priority = None;
                            row.current_source = None;
                            if let Err(e) = self.store.save_executor_state(&row).await {
                                tracing::warn!(
                                    station = self.station_id,
                                    error = %e,
                                    "idle persist failed"
                                );
                            }
                        }
                        result
                    }
                };
                if let Err(e) = result {
                    tracing::warn!(station = self.station_id, error = %e, "idle transition failed");
                }
                if let Err(e) = self.engine.stop(&self.station_id).await {
                    tracing::debug!(station = self.station_id, error = %e, "engine stop failed");
                }
            }
        }
    }

    fn spawn_telemetry(self: &Arc<Self>) {
        let executor = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                match executor.engine.telemetry(&executor.station_id).await {
                    Ok(mut stream) => loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            sample = futures::StreamExt::next(&mut stream) => {
                                let Some(sample) = sample else { break };
                                executor.inner.lock().await.telemetry = sample;
                            }
                        }
                    },
                    Err(e) => {
                        tracing::debug!(
                            station = executor.station_id,
                            error = %e,
                            "telemetry stream unavailable"
                        );
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(ENGINE_RETRY_DELAY) => {}
                }
            }
        });
    }
}

/// All running executors, one per started station.
pub struct ExecutorRegistry {
    store: Arc<dyn Store>,
    engine: Arc<dyn MediaEngine>,
    bus: Arc<EventBus>,
    arbiter: Arc<PriorityArbiter>,
    cancel: CancellationToken,
    executors: DashMap<String, Arc<StationExecutor>>,
}

impl ExecutorRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<dyn MediaEngine>,
        bus: Arc<EventBus>,
        arbiter: Arc<PriorityArbiter>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            engine,
            bus,
            arbiter,
            cancel,
            executors: DashMap::new(),
        })
    }

    /// Starts (or returns) the executor for a station.
    pub async fn start_station(&self, station_id: &str) -> GrimnirResult<Arc<StationExecutor>> {
        if let Some(existing) = self.executors.get(station_id) {
            return Ok(Arc::clone(existing.value()));
        }
        let executor = StationExecutor::start(
            station_id,
            self.store.clone(),
            self.engine.clone(),
            self.bus.clone(),
            self.arbiter.clone(),
            self.cancel.child_token(),
        )
        .await?;
        self.executors
            .insert(station_id.to_string(), Arc::clone(&executor));
        Ok(executor)
    }

    pub fn get(&self, station_id: &str) -> Option<Arc<StationExecutor>> {
        self.executors.get(station_id).map(|r| Arc::clone(r.value()))
    }

    pub async fn stop_station(&self, station_id: &str) -> GrimnirResult<()> {
        if let Some((_, executor)) = self.executors.remove(station_id) {
            executor.stop().await?;
        }
        Ok(())
    }

    /// Station ids with their health flags, for the liveness surface.
    pub async fn health(&self) -> Vec<(String, bool)> {
        // Snapshot the map first; awaiting under a shard lock is a hazard.
        let executors: Vec<(String, Arc<StationExecutor>)> = self
            .executors
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut out = Vec::with_capacity(executors.len());
        for (id, executor) in executors {
            out.push((id, executor.is_healthy().await));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::SourceType;
    use crate::store::MemoryStore;
    use futures::stream::BoxStream;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Engine double recording control calls; can be switched to fail.
    struct MockEngine {
        calls: SyncMutex<Vec<String>>,
        failing: AtomicBool,
    }

    impl MockEngine {
        fn arc() -> Arc<Self> {
            Arc::new(Self {
                calls: SyncMutex::new(Vec::new()),
                failing: AtomicBool::new(false),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn record(&self, call: String) -> GrimnirResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(GrimnirError::MediaEngineUnavailable("mock down".into()));
            }
            self.calls.lock().push(call);
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl MediaEngine for MockEngine {
        async fn ping(&self) -> GrimnirResult<()> {
            Ok(())
        }
        async fn preload(&self, station_id: &str, plan: &SlotPlan) -> GrimnirResult<()> {
            self.record(format!("preload:{station_id}:{}", plan.slot_id))
        }
        async fn play(&self, station_id: &str, source: &PrioritySource) -> GrimnirResult<()> {
            self.record(format!("play:{station_id}:{}", source.source_id))
        }
        async fn stop(&self, station_id: &str) -> GrimnirResult<()> {
            self.record(format!("stop:{station_id}"))
        }
        async fn crossfade(
            &self,
            station_id: &str,
            to_source: &str,
            _duration_ms: u64,
        ) -> GrimnirResult<()> {
            self.record(format!("crossfade:{station_id}:{to_source}"))
        }
        async fn inject_live_source(
            &self,
            _station_id: &str,
            _mount_id: &str,
        ) -> GrimnirResult<crate::media::LiveSink> {
            Err(GrimnirError::MediaEngineUnavailable("mock".into()))
        }
        async fn encoded_stream(
            &self,
            _mount_id: &str,
        ) -> GrimnirResult<crate::media::EncodedSource> {
            Err(GrimnirError::MediaEngineUnavailable("mock".into()))
        }
        async fn telemetry(
            &self,
            _station_id: &str,
        ) -> GrimnirResult<BoxStream<'static, Telemetry>> {
            Ok(futures::stream::pending().boxed())
        }
        fn connected(&self) -> bool {
            true
        }
    }

    use futures::StreamExt;

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: Arc<MockEngine>,
        bus: Arc<EventBus>,
        arbiter: Arc<PriorityArbiter>,
        executor: Arc<StationExecutor>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let engine = MockEngine::arc();
        let bus = EventBus::arc();
        let arbiter = PriorityArbiter::arc(store.clone(), bus.clone());
        let executor = StationExecutor::start(
            "st1",
            store.clone(),
            engine.clone(),
            bus.clone(),
            arbiter.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        Fixture {
            store,
            engine,
            bus,
            arbiter,
            executor,
        }
    }

    fn plan(slot_id: &str) -> SlotPlan {
        SlotPlan {
            slot_id: slot_id.into(),
            station_id: "st1".into(),
            starts_at: Utc::now(),
            ends_at: Utc::now(),
            duration_ms: 60_000,
            kind: crate::clock::SlotKind::Playlist,
            payload: serde_json::json!({}),
        }
    }

    fn source(id: &str, priority: PriorityLevel) -> PrioritySource {
        let ty = match priority {
            PriorityLevel::Emergency => SourceType::Emergency,
            PriorityLevel::LiveOverride | PriorityLevel::LiveScheduled => SourceType::Live,
            _ => SourceType::Media,
        };
        PrioritySource::new("st1", priority, ty, id)
    }

    #[tokio::test]
    async fn starts_idle_and_persists() {
        let f = fixture().await;
        let row = f.executor.snapshot().await;
        assert_eq!(row.phase, ExecutorPhase::Idle);
        assert!(f.store.executor_state("st1").await.unwrap().is_some());
        assert!(f.executor.is_healthy().await);
    }

    #[tokio::test]
    async fn preload_play_fade_complete_cycle() {
        let f = fixture().await;

        f.executor.preload(&plan("slot-1")).await.unwrap();
        let row = f.executor.snapshot().await;
        assert_eq!(row.phase, ExecutorPhase::Preloading);
        assert_eq!(row.next_source.as_deref(), Some("slot-1"));

        // Engine-facing calls only; no arbiter traffic so the background
        // priority worker stays quiet and the call log is exact.
        let auto = source("slot-1", PriorityLevel::Automation);
        f.executor.play(&auto).await.unwrap();
        let row = f.executor.snapshot().await;
        assert_eq!(row.phase, ExecutorPhase::Playing);
        assert_eq!(row.current_source.as_deref(), Some("slot-1"));

        f.executor
            .fade("slot-2", PriorityLevel::Automation, 400)
            .await
            .unwrap();
        let row = f.executor.snapshot().await;
        assert_eq!(row.phase, ExecutorPhase::Fading);
        assert_eq!(row.next_source.as_deref(), Some("slot-2"));

        f.executor.complete_fade().await.unwrap();
        let row = f.executor.snapshot().await;
        assert_eq!(row.phase, ExecutorPhase::Playing);
        assert_eq!(row.current_source.as_deref(), Some("slot-2"));
        assert!(row.next_source.is_none());

        assert_eq!(
            f.engine.calls(),
            vec![
                "preload:st1:slot-1",
                "play:st1:slot-1",
                "crossfade:st1:slot-2",
            ]
        );
    }

    #[tokio::test]
    async fn play_targets_phase_by_priority() {
        let f = fixture().await;

        f.executor
            .play(&source("dj-1", PriorityLevel::LiveOverride))
            .await
            .unwrap();
        assert_eq!(f.executor.snapshot().await.phase, ExecutorPhase::Live);

        f.executor
            .play(&source("alert-1", PriorityLevel::Emergency))
            .await
            .unwrap();
        assert_eq!(f.executor.snapshot().await.phase, ExecutorPhase::Emergency);
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected() {
        let f = fixture().await;

        // fade is only reachable from playing.
        let err = f
            .executor
            .fade("slot-2", PriorityLevel::Automation, 400)
            .await
            .unwrap_err();
        assert!(matches!(err, GrimnirError::InvalidTransition { .. }));

        // complete_fade outside fading is rejected.
        assert!(f.executor.complete_fade().await.is_err());

        // State did not move.
        assert_eq!(f.executor.snapshot().await.phase, ExecutorPhase::Idle);
    }

    #[tokio::test]
    async fn engine_failure_keeps_state_consistent() {
        let f = fixture().await;
        f.engine.set_failing(true);

        let err = f
            .executor
            .play(&source("slot-1", PriorityLevel::Automation))
            .await
            .unwrap_err();
        assert!(matches!(err, GrimnirError::MediaEngineUnavailable(_)));

        // The transition still happened and persisted.
        let row = f.executor.snapshot().await;
        assert_eq!(row.phase, ExecutorPhase::Playing);
        assert_eq!(row.current_source.as_deref(), Some("slot-1"));
        let persisted = f.store.executor_state("st1").await.unwrap().unwrap();
        assert_eq!(persisted.phase, ExecutorPhase::Playing);
    }

    #[tokio::test]
    async fn replayed_current_source_is_a_no_op() {
        let f = fixture().await;
        let auto = source("slot-1", PriorityLevel::Automation);
        f.executor.play(&auto).await.unwrap();
        f.executor.play(&auto).await.unwrap();
        // Exactly one engine play; a self-edge would have errored.
        assert_eq!(f.engine.calls(), vec!["play:st1:slot-1"]);
    }

    #[tokio::test]
    async fn emergency_preemption_and_release_round_trip() {
        let f = fixture().await;

        // Automation on air.
        let auto = source("auto-1", PriorityLevel::Automation);
        f.arbiter.request(auto.clone()).await.unwrap();
        f.executor
            .handle_priority_event(BusEvent::PriorityChange {
                station_id: "st1".into(),
                previous_source: None,
                source_id: "auto-1".into(),
                source_type: "media".into(),
                priority: 3,
            })
            .await;
        assert_eq!(f.executor.snapshot().await.phase, ExecutorPhase::Playing);

        // Operator emergency preempts.
        f.arbiter
            .request(source("alert-1", PriorityLevel::Emergency))
            .await
            .unwrap();
        f.executor
            .handle_priority_event(BusEvent::PriorityEmergency {
                station_id: "st1".into(),
                source_id: "alert-1".into(),
            })
            .await;
        let row = f.executor.snapshot().await;
        assert_eq!(row.phase, ExecutorPhase::Emergency);
        assert_eq!(row.current_source.as_deref(), Some("alert-1"));

        // Operator release resumes automation.
        f.arbiter.operator_release("st1", "alert-1").await.unwrap();
        f.executor
            .handle_priority_event(BusEvent::PriorityReleased {
                station_id: "st1".into(),
                source_id: "alert-1".into(),
                priority: 0,
            })
            .await;
        let row = f.executor.snapshot().await;
        assert_eq!(row.phase, ExecutorPhase::Playing);
        assert_eq!(row.current_source.as_deref(), Some("auto-1"));
    }

    #[tokio::test]
    async fn released_station_with_no_claims_goes_idle() {
        let f = fixture().await;
        let auto = source("auto-1", PriorityLevel::Automation);
        f.arbiter.request(auto.clone()).await.unwrap();
        f.executor.play(&auto).await.unwrap();

        f.arbiter.release("st1", "auto-1").await.unwrap();
        f.executor
            .handle_priority_event(BusEvent::PriorityReleased {
                station_id: "st1".into(),
                source_id: "auto-1".into(),
                priority: 3,
            })
            .await;

        let row = f.executor.snapshot().await;
        assert_eq!(row.phase, ExecutorPhase::Idle);
        assert!(row.current_source.is_none());
    }

    #[tokio::test]
    async fn events_for_other_stations_are_ignored() {
        let f = fixture().await;
        f.executor
            .handle_priority_event(BusEvent::PriorityChange {
                station_id: "st2".into(),
                previous_source: None,
                source_id: "other".into(),
                source_type: "media".into(),
                priority: 3,
            })
            .await;
        assert_eq!(f.executor.snapshot().await.phase, ExecutorPhase::Idle);
        assert!(f.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn priority_listener_worker_drives_the_engine() {
        let f = fixture().await;

        // Publish through the bus and let the worker pick it up.
        f.arbiter
            .request(source("auto-1", PriorityLevel::Automation))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(f.executor.snapshot().await.phase, ExecutorPhase::Playing);
        assert_eq!(f.engine.calls(), vec!["play:st1:auto-1"]);
    }

    #[tokio::test]
    async fn stop_parks_idle_and_cancels_workers() {
        let f = fixture().await;
        let auto = source("auto-1", PriorityLevel::Automation);
        f.executor.play(&auto).await.unwrap();

        f.executor.stop().await.unwrap();
        let row = f.executor.snapshot().await;
        assert_eq!(row.phase, ExecutorPhase::Idle);
        assert!(row.current_source.is_none());
        assert!(f.executor.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn registry_reuses_running_executors() {
        let store = Arc::new(MemoryStore::new());
        let engine = MockEngine::arc();
        let bus = EventBus::arc();
        let arbiter = PriorityArbiter::arc(store.clone(), bus.clone());
        let registry = ExecutorRegistry::new(
            store,
            engine,
            bus,
            arbiter,
            CancellationToken::new(),
        );

        let a = registry.start_station("st1").await.unwrap();
        let b = registry.start_station("st1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let health = registry.health().await;
        assert_eq!(health.len(), 1);
        assert!(health[0].1);

        registry.stop_station("st1").await.unwrap();
        assert!(registry.get("st1").is_none());
    }
}
