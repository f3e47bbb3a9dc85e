//! The authoritative selector of the currently-active source per station.
//!
//! All mutations persist through the store before the corresponding event is
//! published, so any observer that reads state after seeing the event sees
//! the new state. Per-station claims are serialized behind one async mutex;
//! the arbiter never calls the media engine; realizing a selection is the
//! executor's job.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::{PriorityLevel, PrioritySource};
use crate::bus::{BusEvent, EventBus};
use crate::error::{GrimnirError, GrimnirResult};
use crate::store::Store;

/// Per-station claim set. `current_id` always points into `claims`.
#[derive(Default)]
struct StationClaims {
    /// Active claims, the current one included; dormant claims wait here.
    claims: Vec<PrioritySource>,
    current_id: Option<String>,
    loaded: bool,
}

impl StationClaims {
    fn current(&self) -> Option<&PrioritySource> {
        let id = self.current_id.as_deref()?;
        self.claims.iter().find(|c| c.id == id)
    }

    /// Min-priority active claim; among equals the most recently activated
    /// wins, matching preemption semantics where an equal-priority request
    /// takes over.
    fn select(&self) -> Option<&PrioritySource> {
        self.claims
            .iter()
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.activated_at.cmp(&a.activated_at))
            })
    }
}

/// Station-scoped priority arbitration.
pub struct PriorityArbiter {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    stations: DashMap<String, Arc<Mutex<StationClaims>>>,
}

impl PriorityArbiter {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            stations: DashMap::new(),
        }
    }

    #[must_use]
    pub fn arc(store: Arc<dyn Store>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self::new(store, bus))
    }

    fn station_entry(&self, station_id: &str) -> Arc<Mutex<StationClaims>> {
        self.stations
            .entry(station_id.to_string())
            .or_default()
            .clone()
    }

    /// Recovers active claims from the store on first touch of a station
    /// after a restart.
    async fn ensure_loaded(&self, station_id: &str, claims: &mut StationClaims) -> GrimnirResult<()> {
        if claims.loaded {
            return Ok(());
        }
        let active = self.store.active_priority_sources(station_id).await?;
        claims.claims = active;
        claims.current_id = claims.select().map(|c| c.id.clone());
        claims.loaded = true;
        Ok(())
    }

    /// Marks a new source active.
    ///
    /// Preempts the current source when the new priority is numerically ≤
    /// the current one; otherwise the claim goes dormant and takes effect
    /// only when everything above it releases or expires.
    pub async fn request(&self, source: PrioritySource) -> GrimnirResult<()> {
        let entry = self.station_entry(&source.station_id);
        let mut claims = entry.lock().await;
        self.ensure_loaded(&source.station_id, &mut claims).await?;

        // Commit before any event leaves the process.
        self.store.insert_priority_source(&source).await?;

        let preempts = claims
            .current()
            .map_or(true, |current| source.priority <= current.priority);
        let previous = claims.current().map(|c| c.source_id.clone());

        claims.claims.push(source.clone());
        if !preempts {
            tracing::debug!(
                station = source.station_id,
                source = source.source_id,
                priority = source.priority.as_u8(),
                "priority request queued dormant"
            );
            return Ok(());
        }

        claims.current_id = Some(source.id.clone());
        drop(claims);

        self.publish_change(&source, previous);
        Ok(())
    }

    /// Deactivates the claim backing `source_id`.
    ///
    /// Emergency claims refuse the ordinary release path; use
    /// [`PriorityArbiter::operator_release`].
    pub async fn release(&self, station_id: &str, source_id: &str) -> GrimnirResult<()> {
        self.release_inner(station_id, source_id, false).await
    }

    /// Explicit operator release; the only way an Emergency claim ends.
    pub async fn operator_release(&self, station_id: &str, source_id: &str) -> GrimnirResult<()> {
        self.release_inner(station_id, source_id, true).await
    }

    async fn release_inner(
        &self,
        station_id: &str,
        source_id: &str,
        operator: bool,
    ) -> GrimnirResult<()> {
        let entry = self.station_entry(station_id);
        let mut claims = entry.lock().await;
        self.ensure_loaded(station_id, &mut claims).await?;

        let Some(position) = claims.claims.iter().position(|c| c.source_id == source_id) else {
            return Err(GrimnirError::SessionNotFound(format!(
                "no active priority source {source_id} on station {station_id}"
            )));
        };
        if claims.claims[position].priority == PriorityLevel::Emergency && !operator {
            return Err(GrimnirError::InvalidRequest(
                "emergency sources are released by operator action only".into(),
            ));
        }

        let released = claims.claims.remove(position);
        self.store
            .deactivate_priority_source(&released.id, Utc::now())
            .await?;

        let was_current = claims.current_id.as_deref() == Some(released.id.as_str());
        let mut change: Option<(PrioritySource, Option<String>)> = None;
        if was_current {
            // Re-select: automation resumes, or fallback, or nothing.
            let next = claims.select().cloned();
            claims.current_id = next.as_ref().map(|c| c.id.clone());
            if let Some(next) = next {
                change = Some((next, Some(released.source_id.clone())));
            }
        }
        drop(claims);

        self.bus.publish(&BusEvent::PriorityReleased {
            station_id: station_id.to_string(),
            source_id: released.source_id.clone(),
            priority: released.priority.as_u8(),
        });
        if operator && released.priority == PriorityLevel::Emergency {
            self.bus.publish(&BusEvent::Audit {
                station_id: Some(station_id.to_string()),
                action: "emergency_released".into(),
                detail: released.source_id.clone(),
            });
        }
        if let Some((next, previous)) = change {
            self.publish_change(&next, previous);
        }
        Ok(())
    }

    /// The station's current source, if any. `None` means the executor must
    /// drive fallback or stay idle.
    pub async fn current(&self, station_id: &str) -> GrimnirResult<Option<PrioritySource>> {
        let entry = self.station_entry(station_id);
        let mut claims = entry.lock().await;
        self.ensure_loaded(station_id, &mut claims).await?;
        Ok(claims.current().cloned())
    }

    fn publish_change(&self, new: &PrioritySource, previous: Option<String>) {
        self.bus.publish(&BusEvent::PriorityChange {
            station_id: new.station_id.clone(),
            previous_source: previous,
            source_id: new.source_id.clone(),
            source_type: new.source_type.as_str().to_string(),
            priority: new.priority.as_u8(),
        });

        match new.priority {
            PriorityLevel::Emergency => {
                self.bus.publish(&BusEvent::PriorityEmergency {
                    station_id: new.station_id.clone(),
                    source_id: new.source_id.clone(),
                });
                self.bus.publish(&BusEvent::Audit {
                    station_id: Some(new.station_id.clone()),
                    action: "emergency_takeover".into(),
                    detail: new.source_id.clone(),
                });
            }
            PriorityLevel::LiveOverride | PriorityLevel::LiveScheduled => {
                self.bus.publish(&BusEvent::PriorityOverride {
                    station_id: new.station_id.clone(),
                    source_id: new.source_id.clone(),
                    priority: new.priority.as_u8(),
                });
            }
            _ => {}
        }
    }
}
