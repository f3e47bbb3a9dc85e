//! Executor phases, the allowed-transition table, and the persisted
//! per-station state row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::priority::PriorityLevel;

/// Lifecycle phase of a station's executor.
///
/// `Idle` is both the initial and the quiescent phase; there is no terminal
/// phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorPhase {
    Idle,
    Preloading,
    Playing,
    Fading,
    Live,
    Emergency,
}

impl ExecutorPhase {
    /// Whether the transition `self -> to` is allowed.
    #[must_use]
    pub fn can_transition(self, to: ExecutorPhase) -> bool {
        use ExecutorPhase::*;
        matches!(
            (self, to),
            (Idle, Preloading | Playing | Live | Emergency)
                | (Preloading, Idle | Playing | Live | Emergency)
                | (Playing, Idle | Preloading | Fading | Live | Emergency)
                | (Fading, Playing | Live | Emergency)
                | (Live, Idle | Fading | Playing | Emergency)
                | (Emergency, Idle | Playing | Live)
        )
    }

    /// Phase a source of the given priority plays in.
    #[must_use]
    pub fn for_priority(priority: PriorityLevel) -> Self {
        match priority {
            PriorityLevel::Emergency => Self::Emergency,
            PriorityLevel::LiveOverride | PriorityLevel::LiveScheduled => Self::Live,
            PriorityLevel::Automation | PriorityLevel::Fallback => Self::Playing,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preloading => "preloading",
            Self::Playing => "playing",
            Self::Fading => "fading",
            Self::Live => "live",
            Self::Emergency => "emergency",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "preloading" => Some(Self::Preloading),
            "playing" => Some(Self::Playing),
            "fading" => Some(Self::Fading),
            "live" => Some(Self::Live),
            "emergency" => Some(Self::Emergency),
            _ => None,
        }
    }
}

/// 1 Hz loudness/buffer telemetry from the media engine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Telemetry {
    /// Left channel peak level (dBFS).
    pub left_level: f32,
    /// Right channel peak level (dBFS).
    pub right_level: f32,
    /// Integrated loudness (LUFS).
    pub lufs: f32,
    /// Encoder-side buffer depth (milliseconds).
    pub buffer_depth_ms: u32,
    /// Cumulative underrun count for the running pipeline.
    pub underruns: u64,
}

/// Persisted executor state, one row per station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorStateRow {
    pub station_id: String,
    pub phase: ExecutorPhase,
    pub priority: Option<PriorityLevel>,
    pub current_source: Option<String>,
    /// Set while preloading or fading toward the next source.
    pub next_source: Option<String>,
    pub telemetry: Telemetry,
    pub last_heartbeat: DateTime<Utc>,
}

impl ExecutorStateRow {
    /// Fresh idle row for a station that has never run.
    pub fn idle(station_id: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            phase: ExecutorPhase::Idle,
            priority: None,
            current_source: None,
            next_source: None,
            telemetry: Telemetry::default(),
            last_heartbeat: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutorPhase::*;

    const ALL: [ExecutorPhase; 6] = [Idle, Preloading, Playing, Fading, Live, Emergency];

    /// The full table from the design: rows are `from`, entries the allowed
    /// targets. Everything else must be rejected.
    #[test]
    fn transition_table_is_exact() {
        let allowed: &[(ExecutorPhase, &[ExecutorPhase])] = &[
            (Idle, &[Preloading, Playing, Live, Emergency]),
            (Preloading, &[Idle, Playing, Live, Emergency]),
            (Playing, &[Idle, Preloading, Fading, Live, Emergency]),
            (Fading, &[Playing, Live, Emergency]),
            (Live, &[Idle, Fading, Playing, Emergency]),
            (Emergency, &[Idle, Playing, Live]),
        ];

        for (from, targets) in allowed {
            for to in ALL {
                assert_eq!(
                    from.can_transition(to),
                    targets.contains(&to),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn no_self_transitions() {
        for phase in ALL {
            assert!(!phase.can_transition(phase), "{phase:?} -> {phase:?}");
        }
    }

    #[test]
    fn priority_maps_to_target_phase() {
        assert_eq!(
            ExecutorPhase::for_priority(PriorityLevel::Emergency),
            Emergency
        );
        assert_eq!(ExecutorPhase::for_priority(PriorityLevel::LiveOverride), Live);
        assert_eq!(
            ExecutorPhase::for_priority(PriorityLevel::LiveScheduled),
            Live
        );
        assert_eq!(ExecutorPhase::for_priority(PriorityLevel::Automation), Playing);
        assert_eq!(ExecutorPhase::for_priority(PriorityLevel::Fallback), Playing);
    }

    #[test]
    fn phase_string_round_trip() {
        for phase in ALL {
            assert_eq!(ExecutorPhase::from_str(phase.as_str()), Some(phase));
        }
        assert_eq!(ExecutorPhase::from_str("paused"), None);
    }
}
