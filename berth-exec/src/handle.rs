//! Handles: short-lived mutation tokens.
//!
//! A handle snapshots a container's decoded configuration plus the
//! caller's pending intent. Mutations touch only the handle's working
//! copy; nothing reaches the VM until commit. Handles live in a bounded
//! LRU keyed by a random opaque token, so an abandoned handle ages out
//! instead of leaking.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use berth_core::{
    CoreError, ExecConfig, HandleKey, NetworkEndpoint, SessionConfig, State,
};
use berth_driver::{DeviceChange, VmConfigInfo, VmRuntimeInfo};
use berth_extraconfig::RENAME_SUPPORTED_VERSION;

use crate::container::Container;

/// Capacity of the handle store.
pub const HANDLE_CAPACITY: usize = 1000;

/// Hardware parameters for a container that does not exist yet.
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub num_cpus: u32,
    pub memory_mb: u64,
}

/// A pending mutation of one container.
pub struct Handle {
    pub key: HandleKey,
    /// Absent for a container being created.
    pub container: Option<Arc<Container>>,
    /// Working copy the caller mutates.
    pub exec_config: ExecConfig,
    /// Config snapshot taken at handle creation; its change version is
    /// the commit's optimistic-concurrency base.
    pub config: VmConfigInfo,
    pub runtime: Option<VmRuntimeInfo>,
    pub data_version: i32,
    pub create: Option<CreateParams>,
    pub target_state: Option<State>,
    /// State override applied at commit without a power operation.
    pub new_state: Option<State>,
    pub device_changes: Vec<DeviceChange>,
    /// Raw extra-config deltas beyond the encoded configuration.
    pub extra_config: BTreeMap<String, String>,
    /// Ask the guest to re-read its configuration after commit.
    pub reload: bool,
}

impl Handle {
    /// A handle for a brand new container.
    #[must_use]
    pub fn new_create(exec_config: ExecConfig, params: CreateParams) -> Self {
        Self {
            key: HandleKey::generate(),
            container: None,
            exec_config,
            config: VmConfigInfo::default(),
            runtime: None,
            data_version: 0,
            create: Some(params),
            target_state: Some(State::Created),
            new_state: None,
            device_changes: Vec::new(),
            extra_config: BTreeMap::new(),
            reload: false,
        }
    }

    /// A handle snapshotting an existing container.
    pub async fn from_container(container: &Arc<Container>) -> Self {
        let inner = container.lock().await;
        Self {
            key: HandleKey::generate(),
            container: Some(Arc::clone(container)),
            exec_config: inner.exec_config.clone(),
            config: inner.config.clone(),
            runtime: inner.runtime.clone(),
            data_version: inner.data_version,
            create: None,
            target_state: None,
            new_state: None,
            device_changes: Vec::new(),
            extra_config: BTreeMap::new(),
            reload: false,
        }
    }

    pub fn set_target_state(&mut self, state: State) {
        self.target_state = Some(state);
    }

    /// Sets the recorded state directly, without a power transition.
    pub fn change_state(&mut self, state: State) {
        self.new_state = Some(state);
    }

    /// Renames the container.
    ///
    /// # Errors
    /// [`CoreError::InvalidArgument`] when the record predates rename
    /// support and its identity keys cannot be rewritten safely.
    pub fn rename(&mut self, new_name: impl Into<String>) -> Result<(), CoreError> {
        if self.container.is_some() && self.data_version < RENAME_SUPPORTED_VERSION {
            return Err(CoreError::InvalidArgument(format!(
                "container data version {} does not support rename",
                self.data_version
            )));
        }
        self.exec_config.common.name = new_name.into();
        Ok(())
    }

    /// Appends a pending network endpoint.
    ///
    /// # Errors
    /// [`CoreError::Duplicate`] when the scope is already attached.
    pub fn add_network_endpoint(
        &mut self,
        scope_name: impl Into<String>,
        endpoint: NetworkEndpoint,
    ) -> Result<(), CoreError> {
        let scope_name = scope_name.into();
        if self.exec_config.networks.contains_key(&scope_name) {
            return Err(CoreError::Duplicate {
                kind: "endpoint",
                id: scope_name,
            });
        }
        self.exec_config.networks.insert(scope_name, endpoint);
        Ok(())
    }

    /// Drops a pending network endpoint.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] when the scope is not attached.
    pub fn remove_network_endpoint(&mut self, scope_name: &str) -> Result<NetworkEndpoint, CoreError> {
        self.exec_config
            .networks
            .shift_remove(scope_name)
            .ok_or_else(|| CoreError::NotFound {
                kind: "endpoint",
                id: scope_name.to_owned(),
            })
    }

    /// Adds a one-shot task session.
    ///
    /// # Errors
    /// [`CoreError::Duplicate`] on task id collision.
    pub fn add_task(&mut self, id: impl Into<String>, task: SessionConfig) -> Result<(), CoreError> {
        let id = id.into();
        if self.exec_config.execs.contains_key(&id) || self.exec_config.sessions.contains_key(&id) {
            return Err(CoreError::Duplicate { kind: "task", id });
        }
        self.exec_config.execs.insert(id, task);
        Ok(())
    }

    /// Removes a task session.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] for an unknown task id.
    pub fn remove_task(&mut self, id: &str) -> Result<(), CoreError> {
        self.exec_config
            .execs
            .shift_remove(id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound {
                kind: "task",
                id: id.to_owned(),
            })
    }

    /// Attaches serial ports backed by datastore files for guest logging.
    pub fn add_logging_serial_ports(&mut self) {
        let id = &self.exec_config.common.id;
        self.device_changes.push(DeviceChange::AddSerialPort {
            label: "tether".to_owned(),
            file: format!("{id}/tether.debug"),
        });
        self.device_changes.push(DeviceChange::AddSerialPort {
            label: "output".to_owned(),
            file: format!("{id}/output.log"),
        });
    }

    /// Merges raw extra-config deltas into the commit.
    pub fn update_extra_config(&mut self, delta: BTreeMap<String, String>) {
        self.extra_config.extend(delta);
    }

    pub fn add_virtual_disk(&mut self, path: impl Into<String>) {
        self.device_changes.push(DeviceChange::AddDisk { path: path.into() });
    }
}

struct Entry {
    handle: Arc<Mutex<Handle>>,
    tick: u64,
}

struct StoreInner {
    entries: HashMap<HandleKey, Entry>,
    /// Recency index: tick -> key. Ticks are unique and monotonic.
    order: BTreeMap<u64, HandleKey>,
    next_tick: u64,
    capacity: usize,
}

/// Bounded LRU of live handles.
pub struct HandleStore {
    inner: Mutex<StoreInner>,
}

impl Default for HandleStore {
    fn default() -> Self {
        Self::with_capacity(HANDLE_CAPACITY)
    }
}

impl HandleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_tick: 0,
                capacity,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stores `handle`, evicting the least recently used entry when at
    /// capacity. Returns the handle's key.
    pub fn put(&self, handle: Handle) -> HandleKey {
        let key = handle.key.clone();
        let mut inner = self.lock();
        while inner.entries.len() >= inner.capacity {
            let Some((_, evicted)) = inner.order.pop_first() else {
                break;
            };
            inner.entries.remove(&evicted);
            tracing::debug!(handle = %evicted, "evicted handle");
        }
        let tick = inner.next_tick;
        inner.next_tick += 1;
        inner.order.insert(tick, key.clone());
        inner.entries.insert(
            key.clone(),
            Entry {
                handle: Arc::new(Mutex::new(handle)),
                tick,
            },
        );
        key
    }

    /// Fetches a handle, refreshing its recency.
    #[must_use]
    pub fn get(&self, key: &HandleKey) -> Option<Arc<Mutex<Handle>>> {
        let mut inner = self.lock();
        let tick = inner.next_tick;
        inner.next_tick += 1;
        let entry = inner.entries.get_mut(key)?;
        let old_tick = entry.tick;
        entry.tick = tick;
        let handle = Arc::clone(&entry.handle);
        inner.order.remove(&old_tick);
        inner.order.insert(tick, key.clone());
        Some(handle)
    }

    /// Removes a handle, typically after a successful commit.
    pub fn remove(&self, key: &HandleKey) -> Option<Arc<Mutex<Handle>>> {
        let mut inner = self.lock();
        let entry = inner.entries.remove(key)?;
        inner.order.remove(&entry.tick);
        Some(entry.handle)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}
