//! Application bootstrap and dependency wiring.
//!
//! The composition root: every service is instantiated and wired here, so
//! dependency relationships stay visible in one place and the binary (and
//! tests) can swap implementations. Store and engine handles are injected
//! through constructors; nothing reaches for globals.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::bus::{remote::RemoteEventBus, EventBus};
use crate::config::{Config, DbBackend};
use crate::error::{GrimnirError, GrimnirResult};
use crate::executor::ExecutorRegistry;
use crate::harbor::HarborServer;
use crate::live::LiveSessionRegistry;
use crate::media::{MediaEngine, NullMediaEngine, RpcMediaEngine};
use crate::mount::MountRegistry;
use crate::priority::arbiter::PriorityArbiter;
use crate::scheduler::Scheduler;
use crate::store::{MemoryStore, SqlStore, Store};
use crate::webhook::WebhookDispatcher;
use crate::webstream::WebstreamMonitor;

/// Container for all bootstrapped services.
pub struct BootstrappedServices {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub bus: Arc<EventBus>,
    pub remote_bus: Option<Arc<RemoteEventBus>>,
    pub engine: Arc<dyn MediaEngine>,
    pub arbiter: Arc<PriorityArbiter>,
    pub live: Arc<LiveSessionRegistry>,
    pub mounts: Arc<MountRegistry>,
    pub executors: Arc<ExecutorRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub webstreams: Arc<WebstreamMonitor>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub harbor: Option<Arc<HarborServer>>,
    /// Root cancellation token; every worker holds a child.
    pub cancel: CancellationToken,
}

/// Opens the configured store.
///
/// `memory://` runs the in-memory store for development. Postgres is the
/// wired SQL backend; the other enum values are accepted by config parsing
/// but rejected here.
async fn open_store(config: &Config) -> GrimnirResult<Arc<dyn Store>> {
    if config.db_dsn == "memory://" {
        tracing::warn!("using in-memory store; nothing will persist");
        return Ok(Arc::new(MemoryStore::new()));
    }
    match config.db_backend {
        DbBackend::Postgres => Ok(Arc::new(SqlStore::connect(&config.db_dsn).await?)),
        DbBackend::Mysql | DbBackend::Sqlite => Err(GrimnirError::Database(
            "database backend not enabled in this build (postgres or memory:// only)".into(),
        )),
    }
}

fn redis_url(config: &Config) -> Option<String> {
    let addr = config.cluster.redis_addr.as_ref()?;
    let auth = config
        .cluster
        .redis_password
        .as_ref()
        .map(|p| format!(":{p}@"))
        .unwrap_or_default();
    Some(format!("redis://{auth}{addr}/{}", config.cluster.redis_db))
}

/// Bootstraps all services with their dependencies.
pub async fn bootstrap(config: Config) -> GrimnirResult<BootstrappedServices> {
    let cancel = CancellationToken::new();
    let store = open_store(&config).await?;
    let bus = EventBus::arc();

    let remote_bus = match redis_url(&config) {
        Some(url) => {
            let bridge = RemoteEventBus::connect(
                bus.clone(),
                &url,
                "grimnir:events",
                config.cluster.instance_id.clone(),
            )
            .await?;
            bridge.spawn_subscriber(cancel.child_token());
            tracing::info!("remote event bus connected");
            Some(bridge)
        }
        None => None,
    };

    let engine: Arc<dyn MediaEngine> = match &config.media_engine_url {
        Some(url) => {
            let engine = RpcMediaEngine::new(url.clone())?;
            if let Err(e) = engine.ping().await {
                // The engine may come up later; executors stay consistent
                // without it.
                tracing::warn!(error = %e, "media engine not reachable at boot");
            }
            Arc::new(engine)
        }
        None => {
            tracing::warn!("no media engine configured; executors run state-only");
            Arc::new(NullMediaEngine)
        }
    };

    let arbiter = PriorityArbiter::arc(store.clone(), bus.clone());
    let live = LiveSessionRegistry::arc(store.clone(), arbiter.clone(), bus.clone());
    let mounts = MountRegistry::load(bus.clone(), store.as_ref()).await?;
    let executors = ExecutorRegistry::new(
        store.clone(),
        engine.clone(),
        bus.clone(),
        arbiter.clone(),
        cancel.child_token(),
    );
    let scheduler = Scheduler::new(store.clone(), arbiter.clone(), executors.clone());
    let webstreams = WebstreamMonitor::new(store.clone(), bus.clone());
    let webhooks = WebhookDispatcher::new(store.clone(), bus.clone());

    let harbor = config.harbor.enabled.then(|| {
        HarborServer::new(
            config.harbor.clone(),
            config.decoder_command.clone(),
            store.clone(),
            live.clone(),
            mounts.clone(),
            engine.clone(),
        )
    });

    Ok(BootstrappedServices {
        config,
        store,
        bus,
        remote_bus,
        engine,
        arbiter,
        live,
        mounts,
        executors,
        scheduler,
        webstreams,
        webhooks,
        harbor,
        cancel,
    })
}

impl BootstrappedServices {
    /// Starts the long-running workers: station schedulers and executors,
    /// webstream health checkers, the webhook dispatcher, encoder feed
    /// pumps and the harbor listener.
    pub async fn start_background_tasks(&self) -> GrimnirResult<()> {
        self.scheduler.start(self.cancel.child_token()).await?;
        self.webstreams.start(self.cancel.child_token()).await?;
        self.webhooks.start(self.cancel.child_token());

        if self.engine.connected() {
            self.start_feed_pumps();
        }

        if let Some(harbor) = &self.harbor {
            let harbor = Arc::clone(harbor);
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) = harbor.run(cancel).await {
                    tracing::error!(error = %e, "harbor server exited");
                }
            });
        }
        Ok(())
    }

    /// One pump per mount: the engine's encoded output is the mount's
    /// producer feed. Sibling ring buffers are cleared before each new feed
    /// generation so quality variants stay in sync.
    fn start_feed_pumps(&self) {
        for mount in self.mounts.all() {
            let engine = self.engine.clone();
            let mounts = self.mounts.clone();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                let config = mount.config().clone();
                loop {
                    if cancel.is_cancelled() {
                        return;
                    }
                    match engine.encoded_stream(&config.id).await {
                        Ok(reader) => {
                            mounts.clear_station_buffers(&config.station_id);
                            tracing::info!(mount = config.name, "encoder feed starting");
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                result = mount.feed_from(reader) => {
                                    if let Err(e) = result {
                                        tracing::warn!(mount = config.name, error = %e, "encoder feed failed");
                                    } else {
                                        tracing::info!(mount = config.name, "encoder feed ended");
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            tracing::debug!(mount = config.name, error = %e, "encoder stream unavailable");
                        }
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
                    }
                }
            });
        }
    }

    /// App state for the HTTP server.
    #[must_use]
    pub fn app_state(&self) -> AppState {
        AppState {
            mounts: self.mounts.clone(),
            executors: self.executors.clone(),
            arbiter: self.arbiter.clone(),
            live: self.live.clone(),
            webstreams: self.webstreams.clone(),
            webhooks: self.webhooks.clone(),
            bus: self.bus.clone(),
        }
    }

    /// Graceful shutdown: signal cancellation, give workers a bounded
    /// moment to drain, then close listener connections.
    pub async fn shutdown(&self) {
        tracing::info!("beginning graceful shutdown");
        self.cancel.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        self.mounts.close_all();
        tracing::info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn memory_config() -> Config {
        let env: HashMap<String, String> = HashMap::from([
            ("GRIMNIR_DB_DSN".into(), "memory://".into()),
            ("GRIMNIR_JWT_SIGNING_KEY".into(), "secret".into()),
            ("GRIMNIR_HARBOR_ENABLED".into(), "false".into()),
        ]);
        Config::from_lookup(&|key| env.get(key).cloned()).unwrap()
    }

    #[tokio::test]
    async fn memory_dsn_bootstraps_without_external_services() {
        let services = bootstrap(memory_config()).await.unwrap();
        assert!(services.remote_bus.is_none());
        assert!(services.harbor.is_none());
        assert!(!services.engine.connected());

        services.start_background_tasks().await.unwrap();
        services.shutdown().await;
        assert!(services.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn unwired_backend_is_rejected() {
        let env: HashMap<String, String> = HashMap::from([
            ("GRIMNIR_DB_DSN".into(), "sqlite://grimnir.db".into()),
            ("GRIMNIR_DB_BACKEND".into(), "sqlite".into()),
            ("GRIMNIR_JWT_SIGNING_KEY".into(), "secret".into()),
        ]);
        let config = Config::from_lookup(&|key| env.get(key).cloned()).unwrap();
        assert!(bootstrap(config).await.is_err());
    }
}
