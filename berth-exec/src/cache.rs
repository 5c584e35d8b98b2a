//! The container cache.
//!
//! Two indices over the same set of containers: by container id and by
//! backing VM ref. A single read/write lock guards the maps; it is never
//! held across driver calls or container locks, so lookups stay O(1) and
//! uncontended.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use berth_core::{ContainerId, CoreError, State, VmRef};
use berth_driver::InfraDriver;
use berth_extraconfig::MigrationManager;

use crate::container::{decode_with_migration, derive_state, Container};

#[derive(Default)]
struct Indices {
    by_id: HashMap<ContainerId, Arc<Container>>,
    by_ref: HashMap<VmRef, Arc<Container>>,
}

/// Authoritative map of live containers.
#[derive(Default)]
pub struct ContainerCache {
    indices: RwLock<Indices>,
}

impl ContainerCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Indices> {
        match self.indices.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Indices> {
        match self.indices.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Inserts or replaces `container`, indexing under its id and, when
    /// known, its VM ref.
    pub async fn put(&self, container: Arc<Container>) {
        let vm = container.lock().await.vm.clone();
        let mut indices = self.write();
        indices
            .by_id
            .insert(container.id.clone(), Arc::clone(&container));
        if let Some(vm) = vm {
            indices.by_ref.insert(vm, container);
        }
    }

    /// Evicts a container under both indices.
    pub async fn remove(&self, container: &Arc<Container>) {
        let vm = container.lock().await.vm.clone();
        let mut indices = self.write();
        indices.by_id.remove(&container.id);
        if let Some(vm) = vm {
            indices.by_ref.remove(&vm);
        }
    }

    /// Point lookup by container id.
    #[must_use]
    pub fn get(&self, id: &ContainerId) -> Option<Arc<Container>> {
        self.read().by_id.get(id).cloned()
    }

    /// Point lookup by backing VM ref.
    #[must_use]
    pub fn get_by_ref(&self, vm: &VmRef) -> Option<Arc<Container>> {
        self.read().by_ref.get(vm).cloned()
    }

    /// Accepts either a full container id or a unique prefix of one.
    #[must_use]
    pub fn resolve(&self, name_or_id: &str) -> Option<Arc<Container>> {
        let indices = self.read();
        if let Some(c) = indices.by_id.get(&ContainerId::from(name_or_id.to_owned())) {
            return Some(Arc::clone(c));
        }
        let mut matches = indices
            .by_id
            .iter()
            .filter(|(id, _)| id.to_string().starts_with(name_or_id));
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(Arc::clone(first.1))
    }

    /// Snapshot of all containers, optionally filtered by state.
    #[must_use]
    pub fn containers(&self, states: Option<&[State]>) -> Vec<Arc<Container>> {
        self.read()
            .by_id
            .values()
            .filter(|c| states.is_none_or(|states| states.contains(&c.state())))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().by_id.is_empty()
    }

    /// Populates the cache from the driver's VM inventory. Idempotent:
    /// existing entries are replaced with fresh snapshots. Callers must
    /// keep the VM event subscription suspended until this returns.
    ///
    /// # Errors
    /// Propagates the inventory read; individual undecodable VMs are
    /// loaded with `migration_error` set rather than failing the sync.
    pub async fn sync(
        &self,
        driver: &Arc<dyn InfraDriver>,
        migrator: &MigrationManager,
    ) -> Result<(), CoreError> {
        let vms = driver.list_vms().await.map_err(CoreError::from)?;
        for (vm, props) in vms {
            let decoded = decode_with_migration(&props.config.extra_config, migrator);
            let (exec_config, migration_error) = match decoded.result {
                Ok(cfg) => (cfg, None),
                Err(e) => {
                    tracing::warn!(vm = %vm, error = %e, "sync: undecodable vm record");
                    (berth_core::ExecConfig::default(), Some(e.to_string()))
                }
            };
            let id = if exec_config.common.id.is_empty() {
                // Not one of ours by key shape; index under the ref.
                ContainerId::from(vm.to_string())
            } else {
                ContainerId::from(exec_config.common.id.clone())
            };
            let state = derive_state(props.runtime.power_state, &exec_config);
            let container = Container::new(id, exec_config, state);
            {
                let mut inner = container.lock().await;
                inner.vm = Some(vm.clone());
                inner.data_version = decoded.data_version;
                inner.migration_error = migration_error;
                inner.config = props.config;
                inner.runtime = Some(props.runtime);
            }
            self.put(container).await;
            tracing::debug!(vm = %vm, "synced container");
        }
        tracing::info!(count = self.len(), "cache sync complete");
        Ok(())
    }
}
