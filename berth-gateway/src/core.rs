//! Process wiring for the port layer.
//!
//! [`Core`] owns every long-lived component: the event bus, the container
//! cache, the committer, the network context, and the metric collector,
//! plus the background tasks that feed them. Startup order matters: the
//! cache subscription is registered suspended, the cache is synced from
//! the infrastructure, and only then is event delivery resumed, so no
//! event observed during sync is lost or applied to a stale cache.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use berth_core::{CoreConfig, CoreError};
use berth_driver::InfraDriver;
use berth_events::{spawn_collector, spawn_sampler, EventBus, MetricsCollector, Topic};
use berth_exec::{start_event_pipeline, Committer, ContainerCache, CACHE_SUBSCRIBER};
use berth_extraconfig::keys::{map_entry, Scope};
use berth_extraconfig::{MigrationManager, MigrationError, Plugin, Target};
use berth_net::NetworkContext;
use tokio::task::JoinHandle;

static INSTANCE: OnceLock<Arc<Core>> = OnceLock::new();

/// The assembled port layer.
pub struct Core {
    pub config: CoreConfig,
    pub driver: Arc<dyn InfraDriver>,
    pub bus: Arc<EventBus>,
    pub cache: Arc<ContainerCache>,
    pub migrator: Arc<MigrationManager>,
    pub committer: Committer,
    pub network: NetworkContext,
    pub metrics: Arc<MetricsCollector>,
    background: Vec<JoinHandle<()>>,
}

impl Core {
    /// Builds and starts the port layer against `driver`.
    ///
    /// # Errors
    /// Fails when the configured networks are inconsistent or the initial
    /// cache sync cannot enumerate the resource pool.
    pub async fn start(
        config: CoreConfig,
        driver: Arc<dyn InfraDriver>,
    ) -> Result<Arc<Self>, CoreError> {
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(ContainerCache::new());
        let migrator = Arc::new(container_migrations()?);
        let network = NetworkContext::new(&config)?;

        // Registered suspended; events arriving during sync are buffered
        // and replayed once the cache is authoritative.
        let pipeline = start_event_pipeline(
            Arc::clone(&cache),
            Arc::clone(&driver),
            Arc::clone(&migrator),
            Arc::clone(&bus),
        );
        cache.sync(&driver, &migrator).await?;
        bus.resume(Topic::VmEvents, CACHE_SUBSCRIBER);
        tracing::info!(containers = cache.len(), "cache synced");

        let collector = spawn_collector(Arc::clone(&driver), Arc::clone(&bus), 0);
        let metrics = Arc::new(MetricsCollector::new(Arc::clone(&driver)));
        let sampler = spawn_sampler(Arc::clone(&metrics));

        let committer = Committer::new(
            Arc::clone(&driver),
            Arc::clone(&cache),
            Arc::clone(&bus),
            Arc::clone(&migrator),
            config.clone(),
        );

        Ok(Arc::new(Self {
            config,
            driver,
            bus,
            cache,
            migrator,
            committer,
            network,
            metrics,
            background: vec![pipeline, collector, sampler],
        }))
    }

    /// Stops the background tasks. Idempotent.
    pub fn shutdown(&self) {
        for task in &self.background {
            task.abort();
        }
    }

    /// Publishes `core` as the process-wide instance.
    ///
    /// # Errors
    /// [`CoreError::InvalidArgument`] if a core was already installed.
    pub fn install(core: Arc<Self>) -> Result<(), CoreError> {
        INSTANCE
            .set(core)
            .map_err(|_| CoreError::InvalidArgument("core already initialized".into()))
    }

    /// The installed process-wide instance, if any.
    #[must_use]
    pub fn global() -> Option<Arc<Self>> {
        INSTANCE.get().cloned()
    }
}

/// Builds the container migration chain.
///
/// # Errors
/// Surfaces [`MigrationError`] from registration; only reachable if the
/// chain itself is malformed.
pub fn container_migrations() -> Result<MigrationManager, MigrationError> {
    let mut manager = MigrationManager::new();
    manager.register(Target::Container, 1, Arc::new(SessionNameBackfill))?;
    Ok(manager)
}

/// Version 1: older records persisted sessions without a `common.name`,
/// which rename support relies on. Backfill it from the session id.
struct SessionNameBackfill;

impl Plugin for SessionNameBackfill {
    fn migrate(&self, data: &mut BTreeMap<String, String>) -> Result<(), String> {
        let sessions_root = Scope::ReadWrite.root("sessions");
        let Some(index) = data.get(&sessions_root).cloned() else {
            return Ok(());
        };
        for id in index.split('|').filter(|s| !s.is_empty()) {
            let entry = map_entry(&sessions_root, id);
            let name_key = Scope::ReadWrite.child(&entry, "name");
            let missing = data
                .get(&name_key)
                .is_none_or(|v| v.is_empty() || v == berth_extraconfig::keys::NIL_VALUE);
            if missing {
                data.insert(name_key, id.to_owned());
            }
        }
        Ok(())
    }
}
