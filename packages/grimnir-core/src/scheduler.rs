//! Automation scheduler.
//!
//! Per started station, a planner task expands the station's clocks over a
//! rolling one-hour horizon and pushes the resulting slot plans onto a
//! bounded per-station queue; a consumer task preloads each slot shortly
//! before its boundary and requests an Automation-priority claim at the
//! boundary itself. The arbiter then publishes the change and the
//! executor's priority worker drives the media engine; the scheduler never
//! touches the engine directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::{planner::ClockPlanner, SlotPlan};
use crate::error::GrimnirResult;
use crate::executor::ExecutorRegistry;
use crate::priority::{arbiter::PriorityArbiter, PriorityLevel, PrioritySource, SourceType};
use crate::store::Store;

/// Planning horizon per compile round.
fn horizon() -> chrono::Duration {
    chrono::Duration::hours(1)
}

/// How far ahead of the slot boundary the preload fires.
const PRELOAD_LEAD: Duration = Duration::from_secs(5);

/// Per-station slot queue depth.
const SLOT_QUEUE_DEPTH: usize = 64;

pub struct Scheduler {
    store: Arc<dyn Store>,
    planner: ClockPlanner,
    arbiter: Arc<PriorityArbiter>,
    executors: Arc<ExecutorRegistry>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        arbiter: Arc<PriorityArbiter>,
        executors: Arc<ExecutorRegistry>,
    ) -> Arc<Self> {
        let planner = ClockPlanner::new(store.clone());
        Arc::new(Self {
            store,
            planner,
            arbiter,
            executors,
        })
    }

    /// Starts executors and scheduling loops for every active station.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> GrimnirResult<()> {
        let stations = self.store.active_stations().await?;
        tracing::info!(count = stations.len(), "starting station schedulers");
        for station in stations {
            self.executors.start_station(&station.id).await?;
            self.spawn_station(&station.id, cancel.child_token());
        }
        Ok(())
    }

    fn spawn_station(self: &Arc<Self>, station_id: &str, cancel: CancellationToken) {
        let (tx, rx) = mpsc::channel::<SlotPlan>(SLOT_QUEUE_DEPTH);

        // Planner half: refill the queue one horizon at a time.
        let scheduler = Arc::clone(self);
        let station = station_id.to_string();
        let plan_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut window_start = Utc::now();
            loop {
                let plans = match scheduler
                    .planner
                    .compile(&station, window_start, horizon())
                    .await
                {
                    Ok(plans) => plans,
                    Err(e) => {
                        tracing::warn!(station = station, error = %e, "clock compile failed");
                        Vec::new()
                    }
                };
                let window_end = window_start + horizon();
                for plan in plans {
                    // A full queue blocks the planner, not the consumer.
                    if tx.send(plan).await.is_err() {
                        return;
                    }
                }

                window_start = window_end;
                let until_next = (window_end - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = plan_cancel.cancelled() => return,
                    _ = tokio::time::sleep(until_next) => {}
                }
            }
        });

        // Consumer half: realize each plan at its boundary.
        let scheduler = Arc::clone(self);
        let station = station_id.to_string();
        tokio::spawn(async move {
            let mut rx = rx;
            let mut previous_slot: Option<String> = None;
            loop {
                let plan = tokio::select! {
                    _ = cancel.cancelled() => return,
                    plan = rx.recv() => match plan {
                        Some(plan) => plan,
                        None => return,
                    },
                };
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = scheduler.dispatch_plan(&station, &plan, previous_slot.take()) => {
                        if let Err(e) = result {
                            tracing::warn!(
                                station = station,
                                slot = plan.slot_id,
                                error = %e,
                                "slot dispatch failed"
                            );
                        }
                        previous_slot = Some(plan.slot_id.clone());
                    }
                }
            }
        });
    }

    /// Waits out a single plan's timeline: preload ahead of the boundary,
    /// then claim the station at Automation priority. The previous slot's
    /// claim is released after the new one takes over, so the station never
    /// gaps between slots.
    pub(crate) async fn dispatch_plan(
        &self,
        station_id: &str,
        plan: &SlotPlan,
        previous_slot: Option<String>,
    ) -> GrimnirResult<()> {
        let preload_at = plan.starts_at
            - chrono::Duration::from_std(PRELOAD_LEAD).expect("lead fits");
        sleep_until_wallclock(preload_at).await;

        if let Some(executor) = self.executors.get(station_id) {
            // Preload is best-effort; a live or emergency phase refuses it
            // and that is fine, the boundary claim below still queues.
            if let Err(e) = executor.preload(plan).await {
                tracing::debug!(station = station_id, slot = plan.slot_id, error = %e, "preload skipped");
            }
        }

        sleep_until_wallclock(plan.starts_at).await;

        let claim = PrioritySource::new(
            station_id,
            PriorityLevel::Automation,
            SourceType::Media,
            &plan.slot_id,
        )
        .with_metadata(plan.payload.clone());
        self.arbiter.request(claim).await?;

        if let Some(previous) = previous_slot {
            if previous != plan.slot_id {
                if let Err(e) = self.arbiter.release(station_id, &previous).await {
                    tracing::debug!(station = station_id, slot = previous, error = %e, "stale slot release failed");
                }
            }
        }
        Ok(())
    }
}

/// Sleeps until a wall-clock instant; past instants return immediately.
async fn sleep_until_wallclock(at: chrono::DateTime<Utc>) {
    let delta = at - Utc::now();
    if let Ok(wait) = delta.to_std() {
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::clock::SlotKind;
    use crate::executor::ExecutorPhase;
    use crate::media::NullMediaEngine;
    use crate::store::{MemoryStore, Station};

    struct Fixture {
        scheduler: Arc<Scheduler>,
        arbiter: Arc<PriorityArbiter>,
        executors: Arc<ExecutorRegistry>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.insert_station(Station {
            id: "st1".into(),
            name: "One".into(),
            timezone: "UTC".into(),
            active: true,
        });
        let bus = EventBus::arc();
        let arbiter = PriorityArbiter::arc(store.clone(), bus.clone());
        let executors = ExecutorRegistry::new(
            store.clone(),
            Arc::new(NullMediaEngine),
            bus,
            arbiter.clone(),
            CancellationToken::new(),
        );
        executors.start_station("st1").await.unwrap();
        let scheduler = Scheduler::new(store, arbiter.clone(), executors.clone());
        Fixture {
            scheduler,
            arbiter,
            executors,
        }
    }

    fn due_plan(slot_id: &str) -> SlotPlan {
        let now = Utc::now();
        SlotPlan {
            slot_id: slot_id.into(),
            station_id: "st1".into(),
            starts_at: now,
            ends_at: now + chrono::Duration::minutes(1),
            duration_ms: 60_000,
            kind: SlotKind::Playlist,
            payload: serde_json::json!({"playlist_id": "p1"}),
        }
    }

    #[tokio::test]
    async fn due_plan_claims_automation() {
        let f = fixture().await;
        f.scheduler
            .dispatch_plan("st1", &due_plan("slot-1"), None)
            .await
            .unwrap();

        let current = f.arbiter.current("st1").await.unwrap().unwrap();
        assert_eq!(current.source_id, "slot-1");
        assert_eq!(current.priority, PriorityLevel::Automation);
        assert_eq!(current.metadata["playlist_id"], "p1");
    }

    #[tokio::test]
    async fn successive_slots_rotate_the_claim() {
        let f = fixture().await;
        f.scheduler
            .dispatch_plan("st1", &due_plan("slot-1"), None)
            .await
            .unwrap();
        f.scheduler
            .dispatch_plan("st1", &due_plan("slot-2"), Some("slot-1".into()))
            .await
            .unwrap();

        let current = f.arbiter.current("st1").await.unwrap().unwrap();
        assert_eq!(current.source_id, "slot-2");
        // slot-1 was released; releasing it again reports not-found.
        assert!(f.arbiter.release("st1", "slot-1").await.is_err());
    }

    #[tokio::test]
    async fn automation_defers_to_live_claim() {
        let f = fixture().await;
        f.arbiter
            .request(PrioritySource::new(
                "st1",
                PriorityLevel::LiveOverride,
                SourceType::Live,
                "dj-1",
            ))
            .await
            .unwrap();

        f.scheduler
            .dispatch_plan("st1", &due_plan("slot-1"), None)
            .await
            .unwrap();

        // The DJ stays current; the slot claim sits dormant.
        let current = f.arbiter.current("st1").await.unwrap().unwrap();
        assert_eq!(current.source_id, "dj-1");
    }

    #[tokio::test]
    async fn preload_failure_does_not_block_the_claim() {
        // NullMediaEngine fails every preload; the claim still lands.
        let f = fixture().await;
        f.scheduler
            .dispatch_plan("st1", &due_plan("slot-1"), None)
            .await
            .unwrap();
        assert!(f.arbiter.current("st1").await.unwrap().is_some());

        // The executor went through preloading regardless of the engine.
        let executor = f.executors.get("st1").unwrap();
        let row = executor.snapshot().await;
        assert_ne!(row.phase, ExecutorPhase::Fading);
    }
}
