//! Grimnir Core - shared library for the Grimnir Radio playout platform.
//!
//! This crate provides the per-station core runtime: the priority arbiter
//! and executor state machine that decide and realize what is on air, the
//! clock planner and scheduler that feed them, the Icecast-compatible
//! harbor ingest for live DJ hand-offs, and the mount broadcast layer that
//! fans encoded audio out to HTTP listeners.
//!
//! # Architecture
//!
//! The crate is organized into subsystem modules:
//!
//! - [`bus`]: in-process typed pub/sub with optional Redis cross-node fan-out
//! - [`buffer`]: fixed-capacity recent-audio ring
//! - [`mount`]: per-mount producer→listener broadcast and priming
//! - [`clock`]: clock templates and slot-plan expansion
//! - [`priority`]: the priority ladder and per-station arbiter
//! - [`executor`]: per-station lifecycle state machine and workers
//! - [`scheduler`]: clock plans → automation claims
//! - [`live`]: DJ session tokens and lifecycle
//! - [`harbor`]: Icecast-compatible live ingest
//! - [`webstream`]: relay health checking and failover
//! - [`webhook`]: show-transition detection and signed delivery
//! - [`media`]: the remote media-engine RPC contract
//! - [`store`]: persistence access behind the [`Store`](store::Store) trait
//! - [`api`]: listener streaming and thin operator endpoints
//! - [`bootstrap`]: the composition root
//!
//! Collaborators are injected through constructors; the [`store::Store`]
//! and [`media::MediaEngine`] traits have in-memory / null implementations
//! for tests and engine-less deployments.

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod buffer;
pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod harbor;
pub mod live;
pub mod media;
pub mod mount;
pub mod priority;
pub mod protocol_constants;
pub mod scheduler;
pub mod store;
pub mod webhook;
pub mod webstream;

// Re-export commonly used types at the crate root
pub use bootstrap::{bootstrap, BootstrappedServices};
pub use buffer::RingBuffer;
pub use bus::{BusEvent, BusSubscription, EventBus, EventType, ListenerChange};
pub use clock::{planner::ClockPlanner, ClockHour, ClockSlot, SlotKind, SlotPlan};
pub use config::{Config, ConfigError, DbBackend, HarborConfig, RuntimeEnv};
pub use error::{GrimnirError, GrimnirResult};
pub use executor::{ExecutorPhase, ExecutorRegistry, ExecutorStateRow, StationExecutor, Telemetry};
pub use harbor::HarborServer;
pub use live::{ConnectInfo, LiveSession, LiveSessionRegistry};
pub use media::{MediaEngine, NullMediaEngine, RpcMediaEngine};
pub use mount::{Mount, MountConfig, MountRegistry};
pub use priority::{arbiter::PriorityArbiter, PriorityLevel, PrioritySource, SourceType};
pub use scheduler::Scheduler;
pub use store::{MemoryStore, ShowInstance, SqlStore, Station, Store};
pub use webhook::{WebhookDispatcher, WebhookTarget};
pub use webstream::{HealthCheckMethod, HealthStatus, Webstream, WebstreamMonitor};

// Re-export API types
pub use api::{router, start_server, AppState};
