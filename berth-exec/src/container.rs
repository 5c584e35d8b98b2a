//! The authoritative container record.
//!
//! A [`Container`] is the cache's live view of one VM-backed container.
//! Its mutable fields sit behind an async mutex held across refreshes so
//! readers never observe a half-applied update; the current state is
//! additionally mirrored into a watch channel so `wait_for_state` does
//! not need the lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use berth_core::{ContainerId, CoreError, ExecConfig, State, VmRef};
use berth_driver::{DriverError, InfraDriver, LogCloser, PowerState, VmConfigInfo, VmRuntimeInfo};
use berth_extraconfig::{MigrationManager, Target};
use serde::Serialize;

/// Timeout for property refreshes triggered by events and commits.
pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(180);

/// Mutable portion of a container, guarded by the container mutex.
pub struct ContainerInner {
    pub vm: Option<VmRef>,
    pub exec_config: ExecConfig,
    pub state: State,
    /// State to restore when repair completes.
    pub prior_state: Option<State>,
    pub config: VmConfigInfo,
    pub runtime: Option<VmRuntimeInfo>,
    /// Migration version found in the persisted map before migration ran.
    pub data_version: i32,
    pub migration_error: Option<String>,
    /// Live log tails; closed when the container stops.
    pub log_followers: Vec<LogCloser>,
}

/// One cached container.
pub struct Container {
    pub id: ContainerId,
    state_tx: tokio::sync::watch::Sender<State>,
    inner: tokio::sync::Mutex<ContainerInner>,
}

impl Container {
    #[must_use]
    pub fn new(id: ContainerId, exec_config: ExecConfig, state: State) -> Arc<Self> {
        let (state_tx, _) = tokio::sync::watch::channel(state);
        Arc::new(Self {
            id,
            state_tx,
            inner: tokio::sync::Mutex::new(ContainerInner {
                vm: None,
                exec_config,
                state,
                prior_state: None,
                config: VmConfigInfo::default(),
                runtime: None,
                data_version: 0,
                migration_error: None,
                log_followers: Vec::new(),
            }),
        })
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ContainerInner> {
        self.inner.lock().await
    }

    /// Current state without taking the container lock.
    #[must_use]
    pub fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    /// Records a state change. Call with the inner guard held so the
    /// state field and the watch mirror move together.
    pub fn set_state(&self, inner: &mut ContainerInner, state: State) {
        if inner.state != state {
            tracing::info!(container = %self.id, from = %inner.state, to = %state, "state change");
        }
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Waits until the container reaches `desired`.
    ///
    /// # Errors
    /// [`CoreError::Timeout`] when `timeout` elapses first.
    ///
    /// # Cancel Safety
    /// Purely observational; dropping the future has no effect.
    pub async fn wait_for_state(&self, desired: State, timeout: Duration) -> Result<(), CoreError> {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == desired))
            .await
            .map_err(|_| CoreError::Timeout {
                what: "container state",
                timeout,
            })?
            .map_err(|_| CoreError::NotFound {
                kind: "container",
                id: self.id.to_string(),
            })?;
        Ok(())
    }

    /// Re-reads config and runtime from the driver and re-decodes the
    /// persisted configuration through migration. Bounded by
    /// [`REFRESH_TIMEOUT`].
    ///
    /// # Errors
    /// Driver faults and decode failures; a migration failure is recorded
    /// on the container instead of propagating, so a too-old record still
    /// loads.
    pub async fn refresh(
        &self,
        inner: &mut ContainerInner,
        driver: &Arc<dyn InfraDriver>,
        migrator: &MigrationManager,
    ) -> Result<(), CoreError> {
        let Some(vm) = inner.vm.clone() else {
            return Ok(());
        };
        let props = tokio::time::timeout(REFRESH_TIMEOUT, driver.properties(&vm))
            .await
            .map_err(|_| CoreError::Timeout {
                what: "vm properties",
                timeout: REFRESH_TIMEOUT,
            })?
            .map_err(CoreError::from)?;

        let decoded = decode_with_migration(&props.config.extra_config, migrator);
        inner.data_version = decoded.data_version;
        match decoded.result {
            Ok(exec_config) => {
                inner.exec_config = exec_config;
                inner.migration_error = None;
            }
            Err(e) => {
                tracing::warn!(container = %self.id, error = %e, "config load failed");
                inner.migration_error = Some(e.to_string());
            }
        }
        inner.config = props.config;
        inner.runtime = Some(props.runtime);
        Ok(())
    }

    /// Closes and clears all attached log followers.
    pub fn close_followers(&self, inner: &mut ContainerInner) {
        for follower in inner.log_followers.drain(..) {
            follower.close();
        }
    }

    /// Snapshot for API responses.
    pub async fn info(&self) -> ContainerInfo {
        let inner = self.lock().await;
        ContainerInfo {
            id: self.id.clone(),
            name: inner.exec_config.common.name.clone(),
            // A container whose record failed migration is reported as
            // errored rather than surfacing a bogus lifecycle state.
            state: if inner.migration_error.is_some() {
                "error".to_owned()
            } else {
                inner.state.to_string()
            },
            vm: inner.vm.clone(),
            cpus: inner.config.num_cpus,
            memory_mb: inner.config.memory_mb,
            data_version: inner.data_version,
            migration_error: inner.migration_error.clone(),
        }
    }
}

/// Serializable container summary.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub name: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<VmRef>,
    pub cpus: u32,
    pub memory_mb: u64,
    pub data_version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_error: Option<String>,
}

/// Outcome of migrating and decoding a persisted map.
pub struct DecodedConfig {
    /// Version found before migration ran.
    pub data_version: i32,
    pub result: Result<ExecConfig, CoreError>,
}

/// Runs migration on a copy of `map` and decodes the result. The
/// reported version is the pre-migration one, so callers can gate
/// operations on how old the record originally was.
#[must_use]
pub fn decode_with_migration(
    map: &BTreeMap<String, String>,
    migrator: &MigrationManager,
) -> DecodedConfig {
    let data_version = berth_extraconfig::data_version(map);
    let mut migrated = map.clone();
    let result = match migrator.migrate(Target::Container, data_version, &mut migrated) {
        Ok(_) => berth_extraconfig::decode(&migrated),
        Err(e) => Err(e.into()),
    };
    DecodedConfig {
        data_version,
        result,
    }
}

/// Derives the lifecycle state of a discovered VM from its power state
/// and session markers.
#[must_use]
pub fn derive_state(power: PowerState, exec_config: &ExecConfig) -> State {
    let any_started = exec_config
        .sessions
        .values()
        .any(|s| !s.started.is_empty());
    match power {
        PowerState::PoweredOn if any_started => State::Running,
        PowerState::PoweredOn => State::Starting,
        PowerState::PoweredOff if any_started => State::Stopped,
        PowerState::PoweredOff => State::Created,
        PowerState::Suspended => State::Suspended,
    }
}

/// Classifies a driver fault from a power task as one that warrants the
/// automatic repair path.
#[must_use]
pub fn is_repairable_fault(err: &DriverError) -> bool {
    matches!(err, DriverError::VmConfigFault { .. }) && !err.power_off_succeeded()
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::SessionConfig;

    fn with_session(started: &str) -> ExecConfig {
        let mut cfg = ExecConfig::new("c1", "web");
        cfg.sessions.insert(
            "c1".into(),
            SessionConfig {
                started: started.to_owned(),
                ..SessionConfig::default()
            },
        );
        cfg
    }

    #[test]
    fn sync_state_derivation_table() {
        assert_eq!(derive_state(PowerState::PoweredOn, &with_session("true")), State::Running);
        assert_eq!(derive_state(PowerState::PoweredOn, &with_session("")), State::Starting);
        assert_eq!(derive_state(PowerState::PoweredOff, &with_session("true")), State::Stopped);
        assert_eq!(derive_state(PowerState::PoweredOff, &with_session("")), State::Created);
        assert_eq!(derive_state(PowerState::Suspended, &with_session("true")), State::Suspended);
    }

    #[tokio::test]
    async fn wait_for_state_observes_transitions() {
        let container = Container::new(
            ContainerId::from("c1".to_owned()),
            ExecConfig::new("c1", "web"),
            State::Created,
        );
        let waiter = {
            let container = Arc::clone(&container);
            tokio::spawn(async move {
                container
                    .wait_for_state(State::Running, Duration::from_secs(5))
                    .await
            })
        };
        {
            let mut inner = container.lock().await;
            container.set_state(&mut inner, State::Running);
        }
        waiter.await.expect("join").expect("reached state");
    }

    #[tokio::test]
    async fn wait_for_state_times_out() {
        let container = Container::new(
            ContainerId::from("c1".to_owned()),
            ExecConfig::new("c1", "web"),
            State::Created,
        );
        let result = container
            .wait_for_state(State::Running, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(CoreError::Timeout { .. })));
    }

    #[tokio::test]
    async fn migration_error_reported_as_error_state() {
        let container = Container::new(
            ContainerId::from("c1".to_owned()),
            ExecConfig::new("c1", "web"),
            State::Stopped,
        );
        {
            let mut inner = container.lock().await;
            inner.migration_error = Some("plugin failed".to_owned());
        }
        let info = container.info().await;
        assert_eq!(info.state, "error");
    }

    #[tokio::test]
    async fn close_followers_drains_the_list() {
        let container = Container::new(
            ContainerId::from("c1".to_owned()),
            ExecConfig::new("c1", "web"),
            State::Running,
        );
        let closer = LogCloser::new();
        {
            let mut inner = container.lock().await;
            inner.log_followers.push(closer.clone());
            container.close_followers(&mut inner);
            assert!(inner.log_followers.is_empty());
        }
        assert!(closer.is_closed());
    }
}
