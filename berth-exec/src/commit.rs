//! Commit: applying a handle's pending intent to the infrastructure.
//!
//! All VM mutations funnel through here. A commit snapshots the handle
//! into a plan, runs the plan through the per-VM batcher so concurrent
//! commits against one VM serialize, and performs create, reconfigure,
//! and power transitions in the right order for the handle's target
//! state. Optimistic concurrency rides on the VM change version captured
//! when the handle was created.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use berth_core::{
    Common, ContainerId, CoreConfig, CoreError, ExecConfig, HandleKey, SessionCmd, SessionConfig,
    State, VmRef,
};
use berth_driver::{
    DriverError, GuestAuth, InfraDriver, LogStream, PowerState, VmCreateSpec, VmReconfigSpec,
};
use berth_events::{BusEvent, ContainerEvent, EventBus, Topic};
use berth_extraconfig::{encode, session_started_key, EncodeScope, MigrationManager, Target};
use chrono::Utc;
use indexmap::IndexMap;

use crate::batcher::{Assessment, Assessor, Batcher, BatcherConfig, Processor};
use crate::cache::ContainerCache;
use crate::container::{is_repairable_fault, Container};
use crate::events::repair_and_return;
use crate::handle::{CreateParams, Handle, HandleStore};

/// How long a start waits for the guest to report its sessions launched.
pub const START_WAIT: Duration = Duration::from_secs(180);

/// Grace period after the escalation KILL before hard power-off.
const KILL_WAIT: Duration = Duration::from_secs(10);

/// Grace period after the container's stop signal when the caller does
/// not supply one.
pub const DEFAULT_STOP_WAIT: Duration = Duration::from_secs(10);

const DEFAULT_STOP_SIGNAL: &str = "TERM";

/// Caller-facing parameters for a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerCreateConfig {
    /// Immutable container id, caller supplied.
    pub id: String,
    pub name: String,
    pub num_cpus: u32,
    pub memory_mb: u64,
    /// Main process.
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub dir: String,
    pub tty: bool,
    pub attach: bool,
    pub stop_signal: String,
    pub annotations: IndexMap<String, String>,
}

/// Everything a commit needs, captured from the handle under its lock.
struct CommitPlan {
    container: Option<Arc<Container>>,
    exec_config: ExecConfig,
    /// Change version the handle was created against.
    base_change_version: String,
    /// VM display name when the handle was created.
    original_name: String,
    power_state: Option<PowerState>,
    target_state: Option<State>,
    new_state: Option<State>,
    create: Option<CreateParams>,
    device_changes: Vec<berth_driver::DeviceChange>,
    extra_config: BTreeMap<String, String>,
    apply_spec: bool,
    wait_time: Duration,
}

struct Engine {
    driver: Arc<dyn InfraDriver>,
    cache: Arc<ContainerCache>,
    bus: Arc<EventBus>,
    migrator: Arc<MigrationManager>,
    config: CoreConfig,
}

/// The commit front end: owns the handle store and the per-VM batcher.
#[derive(Clone)]
pub struct Committer {
    engine: Arc<Engine>,
    handles: Arc<HandleStore>,
    batcher: Batcher<CommitPlan, ()>,
}

impl Committer {
    #[must_use]
    pub fn new(
        driver: Arc<dyn InfraDriver>,
        cache: Arc<ContainerCache>,
        bus: Arc<EventBus>,
        migrator: Arc<MigrationManager>,
        config: CoreConfig,
    ) -> Self {
        let engine = Arc::new(Engine {
            driver,
            cache,
            bus,
            migrator,
            config,
        });
        let assessor: Assessor<CommitPlan> = Arc::new(|plan: &CommitPlan| {
            if let Some(container) = &plan.container {
                let state = container.state();
                if matches!(state, State::Removing | State::Removed) {
                    return Assessment::RejectImmediate(CoreError::InvalidState {
                        op: "commit",
                        state,
                    });
                }
            }
            Assessment::Accept
        });
        let processor: Processor<CommitPlan, ()> = {
            let engine = Arc::clone(&engine);
            Arc::new(move |plans| {
                let engine = Arc::clone(&engine);
                Box::pin(async move { engine.process_batch(plans).await })
            })
        };
        Self {
            engine,
            handles: Arc::new(HandleStore::new()),
            batcher: Batcher::new(BatcherConfig::default(), assessor, processor),
        }
    }

    /// Builds a handle for a container that does not exist yet.
    ///
    /// # Errors
    /// [`CoreError::InvalidArgument`] on missing identity or command.
    pub fn create_handle(&self, create: ContainerCreateConfig) -> Result<HandleKey, CoreError> {
        if create.id.is_empty() {
            return Err(CoreError::InvalidArgument("container id is empty".into()));
        }
        if create.name.is_empty() {
            return Err(CoreError::InvalidArgument("container name is empty".into()));
        }
        if create.path.is_empty() {
            return Err(CoreError::InvalidArgument("command path is empty".into()));
        }
        if let Some(existing) = self.engine.cache.get(&ContainerId::new(create.id.clone())) {
            return Err(CoreError::Duplicate {
                kind: "container",
                id: existing.id.to_string(),
            });
        }

        let mut exec_config = ExecConfig::new(&create.id, &create.name);
        exec_config.version = self.engine.migrator.latest_version(Target::Container);
        exec_config.annotations = create.annotations;
        exec_config.sessions.insert(
            create.id.clone(),
            SessionConfig {
                common: Common {
                    id: create.id.clone(),
                    name: create.name.clone(),
                    notes: String::new(),
                },
                cmd: SessionCmd {
                    path: create.path,
                    args: create.args,
                    env: create.env,
                    dir: create.dir,
                },
                tty: create.tty,
                attach: create.attach,
                run_block: create.attach,
                stop_signal: create.stop_signal,
                ..SessionConfig::default()
            },
        );

        let mut handle = Handle::new_create(
            exec_config,
            CreateParams {
                num_cpus: create.num_cpus.max(1),
                memory_mb: create.memory_mb.max(512),
            },
        );
        handle.add_logging_serial_ports();
        Ok(self.handles.put(handle))
    }

    /// Builds a handle snapshotting `container`.
    pub async fn handle_for(&self, container: &Arc<Container>) -> HandleKey {
        self.handles.put(Handle::from_container(container).await)
    }

    /// Looks up a live handle, refreshing its recency.
    #[must_use]
    pub fn handle(&self, key: &HandleKey) -> Option<Arc<Mutex<Handle>>> {
        self.handles.get(key)
    }

    /// Commits the handle: reconfigure plus any power transition its
    /// target state requires. The handle is consumed on success and left
    /// in place on failure so the caller can inspect or retry.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] for an unknown or expired handle,
    /// [`CoreError::InvalidState`] when the target state is not reachable
    /// from the container's current state, and
    /// [`CoreError::ConcurrentAccess`] when another commit landed first.
    pub async fn commit(
        &self,
        key: &HandleKey,
        wait_time: Option<Duration>,
    ) -> Result<(), CoreError> {
        self.commit_inner(key, wait_time, true).await
    }

    /// Commits only the handle's power transitions, leaving the VM
    /// configuration untouched.
    ///
    /// # Errors
    /// As [`Committer::commit`], minus the reconfigure failures.
    pub async fn commit_without_spec(
        &self,
        key: &HandleKey,
        wait_time: Option<Duration>,
    ) -> Result<(), CoreError> {
        self.commit_inner(key, wait_time, false).await
    }

    async fn commit_inner(
        &self,
        key: &HandleKey,
        wait_time: Option<Duration>,
        apply_spec: bool,
    ) -> Result<(), CoreError> {
        let handle = self.handles.get(key).ok_or_else(|| CoreError::NotFound {
            kind: "handle",
            id: key.to_string(),
        })?;

        let (group, plan) = {
            let mut h = lock_handle(&handle);

            if let (Some(container), Some(target)) = (&h.container, h.target_state) {
                match target {
                    State::Running => container.state().check_start()?,
                    State::Stopped => container.state().check_stop()?,
                    _ => {}
                }
            }

            // Run state bookkeeping is stamped at commit time, not when
            // the caller set the target, so restarts get fresh markers.
            let now = Utc::now().timestamp();
            match h.target_state {
                Some(State::Running) => {
                    for session in h.exec_config.sessions.values_mut() {
                        session.clear_run_state(now);
                    }
                }
                Some(State::Stopped) => {
                    for session in h.exec_config.sessions.values_mut() {
                        session.stop_time = now;
                    }
                }
                _ => {}
            }

            let plan = CommitPlan {
                container: h.container.clone(),
                exec_config: h.exec_config.clone(),
                base_change_version: h.config.change_version.clone(),
                original_name: h.config.name.clone(),
                power_state: h.runtime.as_ref().map(|r| r.power_state),
                target_state: h.target_state,
                new_state: h.new_state,
                create: h.create.clone(),
                device_changes: h.device_changes.clone(),
                extra_config: h.extra_config.clone(),
                apply_spec,
                wait_time: wait_time.unwrap_or(DEFAULT_STOP_WAIT),
            };
            (h.exec_config.common.id.clone(), plan)
        };

        self.batcher.queue_sync(group, plan, None).await?;
        self.handles.remove(key);
        Ok(())
    }

    /// Removes a container: destroys its VM and evicts it from the
    /// cache.
    ///
    /// # Errors
    /// [`CoreError::InvalidState`] while the container is running, and
    /// [`CoreError::DeviceInUse`] when another VM holds one of its disks.
    pub async fn remove_container(&self, container: &Arc<Container>) -> Result<(), CoreError> {
        let (vm, prior) = {
            let mut inner = container.lock().await;
            inner.state.check_remove()?;
            let prior = inner.state;
            container.set_state(&mut inner, State::Removing);
            (inner.vm.clone(), prior)
        };

        if let Some(vm) = &vm {
            match self.engine.driver.destroy_vm(vm).await {
                // Someone else already destroyed it; eviction still applies.
                Ok(()) | Err(DriverError::NotFound(_)) => {}
                Err(e) => {
                    let mut inner = container.lock().await;
                    container.set_state(&mut inner, prior);
                    return Err(e.into());
                }
            }
        }

        self.engine.cache.remove(container).await;
        {
            let mut inner = container.lock().await;
            container.close_followers(&mut inner);
            container.set_state(&mut inner, State::Removed);
        }
        self.engine.bus.publish(
            Topic::ContainerEvents,
            &BusEvent::Container(ContainerEvent {
                id: container.id.clone(),
                vm,
                event: "destroy".to_owned(),
                created: Utc::now(),
            }),
        );
        Ok(())
    }

    /// Delivers `signal` to the container's main process.
    ///
    /// # Errors
    /// [`CoreError::InvalidState`] unless the container is running.
    pub async fn signal(&self, container: &Arc<Container>, signal: &str) -> Result<(), CoreError> {
        let vm = {
            let inner = container.lock().await;
            if !inner.state.is_running() {
                return Err(CoreError::InvalidState {
                    op: "signal",
                    state: inner.state,
                });
            }
            inner.vm.clone()
        };
        let Some(vm) = vm else {
            return Err(CoreError::InfrastructureFault(
                "container has no backing vm".into(),
            ));
        };
        self.engine
            .driver
            .start_guest_program(&vm, "kill", &[signal.to_owned()], &GuestAuth::default())
            .await
            .map_err(CoreError::from)
    }

    /// Opens the container's output log. A followed stream is registered
    /// on the container so stop closes it.
    ///
    /// # Errors
    /// Driver faults opening the datastore file.
    pub async fn logs(
        &self,
        container: &Arc<Container>,
        tail: Option<usize>,
        follow: bool,
    ) -> Result<LogStream, CoreError> {
        let vm = container
            .lock()
            .await
            .vm
            .clone()
            .ok_or_else(|| CoreError::InfrastructureFault("container has no backing vm".into()))?;
        let stream = self
            .engine
            .driver
            .open_log(&vm, "output.log", tail, follow)
            .await
            .map_err(CoreError::from)?;
        if follow {
            container
                .lock()
                .await
                .log_followers
                .push(stream.closer.clone());
        }
        Ok(stream)
    }
}

fn lock_handle(handle: &Arc<Mutex<Handle>>) -> std::sync::MutexGuard<'_, Handle> {
    match handle.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Datastore path of a container VM's files. vSAN tracks files by UUID,
/// so only the datastore is named and the folder is left to it.
fn vmx_path(config: &CoreConfig, id: &str) -> String {
    if config.vsan {
        format!("[{}]", config.datastore)
    } else {
        format!("[{}] {id}/{id}.vmx", config.datastore)
    }
}

/// VM display name: container name plus enough id to disambiguate.
fn display_name(exec_config: &ExecConfig) -> String {
    let short = ContainerId::new(exec_config.common.id.clone());
    format!("{}-{}", exec_config.common.name, short.truncated())
}

impl Engine {
    async fn process_batch(&self, plans: Vec<CommitPlan>) -> Result<(), CoreError> {
        for plan in plans {
            self.process_plan(plan).await?;
        }
        Ok(())
    }

    async fn process_plan(&self, plan: CommitPlan) -> Result<(), CoreError> {
        match plan.container.clone() {
            None => self.process_create(plan).await,
            Some(container) => self.process_existing(&container, &plan).await,
        }
    }

    async fn process_create(&self, plan: CommitPlan) -> Result<(), CoreError> {
        let Some(params) = plan.create.clone() else {
            return Err(CoreError::InvalidArgument(
                "create commit without hardware parameters".into(),
            ));
        };
        let id = ContainerId::new(plan.exec_config.common.id.clone());
        if self.cache.get(&id).is_some() {
            return Err(CoreError::Duplicate {
                kind: "container",
                id: id.to_string(),
            });
        }

        let mut extra_config = encode(&plan.exec_config, EncodeScope::Full);
        extra_config.extend(plan.extra_config.clone());
        let spec = VmCreateSpec {
            name: display_name(&plan.exec_config),
            vmx_path: vmx_path(&self.config, id.as_str()),
            num_cpus: params.num_cpus,
            memory_mb: params.memory_mb,
            extra_config,
            devices: plan.device_changes.clone(),
        };
        let vm = self.driver.create_vm(&spec).await.map_err(CoreError::from)?;
        tracing::info!(container = %id, vm = %vm, "created container vm");

        let container = Container::new(id, plan.exec_config.clone(), State::Created);
        {
            let mut inner = container.lock().await;
            inner.vm = Some(vm.clone());
            if let Err(e) = self.refresh(&container, &mut inner).await {
                tracing::warn!(container = %container.id, error = %e, "post-create refresh failed");
            }
        }
        self.cache.put(Arc::clone(&container)).await;
        self.bus.publish(
            Topic::ContainerEvents,
            &BusEvent::Container(ContainerEvent {
                id: container.id.clone(),
                vm: Some(vm.clone()),
                event: "create".to_owned(),
                created: Utc::now(),
            }),
        );

        if plan.target_state == Some(State::Running) {
            let session_ids: Vec<String> = plan.exec_config.sessions.keys().cloned().collect();
            self.start(&container, &vm, &session_ids).await?;
        }
        Ok(())
    }

    async fn process_existing(
        &self,
        container: &Arc<Container>,
        plan: &CommitPlan,
    ) -> Result<(), CoreError> {
        let vm = container
            .lock()
            .await
            .vm
            .clone()
            .ok_or_else(|| CoreError::InfrastructureFault("container has no backing vm".into()))?;

        let powered_on = plan.power_state == Some(PowerState::PoweredOn);
        let powered_off = matches!(plan.power_state, Some(PowerState::PoweredOff) | None);
        let stopping = plan.target_state == Some(State::Stopped);
        let starting = plan.target_state == Some(State::Running);

        // Power down before applying a full spec; a powered-on VM only
        // accepts the volatile key set.
        if stopping && !powered_off {
            self.stop(container, &vm, plan).await?;
        }

        if plan.apply_spec {
            let scope = if powered_on && !stopping {
                EncodeScope::Volatile
            } else {
                EncodeScope::Full
            };
            let mut extra_config = encode(&plan.exec_config, scope);
            extra_config.extend(plan.extra_config.clone());

            let display = display_name(&plan.exec_config);
            let name = (!plan.original_name.is_empty() && display != plan.original_name)
                .then_some(display);

            let spec = VmReconfigSpec {
                change_version: Some(plan.base_change_version.clone()),
                name,
                extra_config,
                device_changes: plan.device_changes.clone(),
            };
            if !spec.is_empty() {
                match self.driver.reconfigure_vm(&vm, spec).await {
                    Ok(()) => {}
                    Err(e) if is_repairable_fault(&e) => {
                        return Err(repair_and_return(container, &self.driver, e).await);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if starting && !powered_on {
            let session_ids: Vec<String> = plan.exec_config.sessions.keys().cloned().collect();
            self.start(container, &vm, &session_ids).await?;
        }
        if stopping && powered_off {
            let mut inner = container.lock().await;
            container.close_followers(&mut inner);
            container.set_state(&mut inner, State::Stopped);
        }
        if let Some(state) = plan.new_state {
            let mut inner = container.lock().await;
            container.set_state(&mut inner, state);
        }

        {
            let mut inner = container.lock().await;
            if let Err(e) = self.refresh(container, &mut inner).await {
                tracing::warn!(container = %container.id, error = %e, "post-commit refresh failed");
            }
        }
        self.cache.put(Arc::clone(container)).await;
        Ok(())
    }

    async fn refresh(
        &self,
        container: &Arc<Container>,
        inner: &mut crate::container::ContainerInner,
    ) -> Result<(), CoreError> {
        container.refresh(inner, &self.driver, &self.migrator).await
    }

    /// Powers on and waits for the guest to report every session
    /// launched. A guest that never reports leaves the container in
    /// `Starting` for the event stream to resolve.
    async fn start(
        &self,
        container: &Arc<Container>,
        vm: &VmRef,
        session_ids: &[String],
    ) -> Result<(), CoreError> {
        {
            let mut inner = container.lock().await;
            container.set_state(&mut inner, State::Starting);
        }

        match self.driver.power_on(vm).await {
            Ok(()) => {}
            Err(DriverError::InvalidPowerState {
                existing: PowerState::PoweredOn,
            }) => {}
            Err(e) if is_repairable_fault(&e) => {
                return Err(repair_and_return(container, &self.driver, e).await);
            }
            Err(e) => return Err(e.into()),
        }

        let wait_all = async {
            let mut reported = Vec::with_capacity(session_ids.len());
            for id in session_ids {
                let value = self
                    .driver
                    .wait_for_extra_config_key(vm, &session_started_key(id))
                    .await?;
                reported.push((id.clone(), value));
            }
            Ok::<_, DriverError>(reported)
        };
        match tokio::time::timeout(START_WAIT, wait_all).await {
            Err(_) => {
                tracing::warn!(container = %container.id, "guest did not report session launch");
                return Ok(());
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(reported)) => {
                for (id, value) in reported {
                    if value != "true" {
                        return Err(CoreError::InfrastructureFault(format!(
                            "session {id} failed to launch: {value}"
                        )));
                    }
                }
            }
        }

        let mut inner = container.lock().await;
        container.set_state(&mut inner, State::Running);
        Ok(())
    }

    /// The stop ladder: container's stop signal, then KILL, then hard
    /// power-off. Faults that mean the VM is already off count as
    /// success.
    async fn stop(
        &self,
        container: &Arc<Container>,
        vm: &VmRef,
        plan: &CommitPlan,
    ) -> Result<(), CoreError> {
        {
            let mut inner = container.lock().await;
            container.set_state(&mut inner, State::Stopping);
        }

        let signal = plan
            .exec_config
            .sessions
            .values()
            .find(|s| !s.stop_signal.is_empty())
            .map_or_else(|| DEFAULT_STOP_SIGNAL.to_owned(), |s| s.stop_signal.clone());

        let mut off = false;
        for (signal, wait) in [(signal, plan.wait_time), ("KILL".to_owned(), KILL_WAIT)] {
            if let Err(e) = self
                .driver
                .start_guest_program(vm, "kill", std::slice::from_ref(&signal), &GuestAuth::default())
                .await
            {
                tracing::debug!(container = %container.id, %signal, error = %e, "guest kill failed");
                break;
            }
            let powered_off = tokio::time::timeout(
                wait,
                self.driver.wait_for_power_state(vm, PowerState::PoweredOff),
            )
            .await;
            if powered_off.is_ok_and(|r| r.is_ok()) {
                off = true;
                break;
            }
            tracing::info!(container = %container.id, %signal, "container did not exit in time");
        }

        if !off {
            match self.driver.power_off(vm).await {
                Ok(()) => {}
                Err(e) if e.power_off_succeeded() => {}
                Err(e) if is_repairable_fault(&e) => {
                    return Err(repair_and_return(container, &self.driver, e).await);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut inner = container.lock().await;
        container.close_followers(&mut inner);
        container.set_state(&mut inner, State::Stopped);
        Ok(())
    }
}
