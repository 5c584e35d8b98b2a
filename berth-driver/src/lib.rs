//! Infrastructure driver abstraction.
//!
//! The execution layer never talks to the hypervisor directly; it goes
//! through [`InfraDriver`], which exposes exactly the operations the core
//! depends on. Production wires in a hypervisor-backed implementation;
//! tests use [`sim::SimDriver`].

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod sim;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use berth_core::VmRef;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};

pub use error::{DriverError, PowerState, VM_NOT_SUSPENDED_KEY};

/// Static configuration of a VM.
#[derive(Debug, Clone, Default)]
pub struct VmConfigInfo {
    pub name: String,
    /// Monotonic token bumped by every reconfigure. Optimistic concurrency
    /// compares this.
    pub change_version: String,
    pub num_cpus: u32,
    pub memory_mb: u64,
    pub extra_config: BTreeMap<String, String>,
}

/// Runtime state of a VM.
#[derive(Debug, Clone)]
pub struct VmRuntimeInfo {
    pub power_state: PowerState,
    pub host: String,
}

impl Default for VmRuntimeInfo {
    fn default() -> Self {
        Self {
            power_state: PowerState::PoweredOff,
            host: String::new(),
        }
    }
}

/// A property-collector read of one VM.
#[derive(Debug, Clone, Default)]
pub struct VmProperties {
    pub config: VmConfigInfo,
    pub runtime: VmRuntimeInfo,
}

/// Specification for creating a VM.
#[derive(Debug, Clone, Default)]
pub struct VmCreateSpec {
    pub name: String,
    /// Datastore path of the VM's files, e.g. `[ds1] abc/abc.vmx`.
    pub vmx_path: String,
    pub num_cpus: u32,
    pub memory_mb: u64,
    pub extra_config: BTreeMap<String, String>,
    pub devices: Vec<DeviceChange>,
}

/// Specification for reconfiguring a VM.
#[derive(Debug, Clone, Default)]
pub struct VmReconfigSpec {
    /// When set, the reconfigure fails with
    /// [`DriverError::ConcurrentAccess`] unless it matches the VM's
    /// current change version.
    pub change_version: Option<String>,
    pub name: Option<String>,
    pub extra_config: BTreeMap<String, String>,
    pub device_changes: Vec<DeviceChange>,
}

impl VmReconfigSpec {
    /// A spec that carries nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.extra_config.is_empty() && self.device_changes.is_empty()
    }
}

/// A virtual hardware change within a reconfigure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChange {
    AddNic {
        label: String,
        slot: u32,
        network_ref: String,
    },
    RemoveNic {
        slot: u32,
    },
    AddDisk {
        path: String,
    },
    AddSerialPort {
        label: String,
        file: String,
    },
}

/// Guest credentials for in-guest program execution.
#[derive(Debug, Clone, Default)]
pub struct GuestAuth {
    pub user: String,
    pub password: String,
}

/// A VM lifecycle event from the hypervisor's event stream.
#[derive(Debug, Clone)]
pub struct VmEvent {
    /// Monotonic event key; collectors resume from the last key seen.
    pub key: u64,
    pub vm: VmRef,
    pub kind: VmEventKind,
    pub created: DateTime<Utc>,
}

/// The event kinds the core reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum VmEventKind {
    PoweredOn,
    PoweredOff,
    Suspended,
    Removed,
    Migrated,
    Relocated,
    HostEnteringMaintenance,
    HostEnteredMaintenance,
    HostExitMaintenance,
    Reconfigured,
}

impl VmEventKind {
    /// Maps to the container power event, if this kind implies one.
    #[must_use]
    pub fn power_event(self) -> Option<berth_core::PowerEvent> {
        match self {
            VmEventKind::PoweredOn => Some(berth_core::PowerEvent::PoweredOn),
            VmEventKind::PoweredOff => Some(berth_core::PowerEvent::PoweredOff),
            VmEventKind::Suspended => Some(berth_core::PowerEvent::Suspended),
            VmEventKind::Removed => Some(berth_core::PowerEvent::Removed),
            _ => None,
        }
    }
}

impl std::fmt::Display for VmEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmEventKind::PoweredOn => "powered on",
            VmEventKind::PoweredOff => "powered off",
            VmEventKind::Suspended => "suspended",
            VmEventKind::Removed => "removed",
            VmEventKind::Migrated => "migrated",
            VmEventKind::Relocated => "relocated",
            VmEventKind::HostEnteringMaintenance => "host entering maintenance",
            VmEventKind::HostEnteredMaintenance => "host entered maintenance",
            VmEventKind::HostExitMaintenance => "host exited maintenance",
            VmEventKind::Reconfigured => "reconfigured",
        };
        f.write_str(s)
    }
}

/// One counter's samples for one VM instance from a perf query.
#[derive(Debug, Clone)]
pub struct MetricSeries {
    pub vm: VmRef,
    /// Counter name, e.g. `cpu.usagemhz.average`.
    pub counter: String,
    /// Per-CPU instance id, or empty for the aggregate entry.
    pub instance: String,
    pub interval_secs: u32,
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: Vec<i64>,
}

/// Cancels a log follow from the consumer side.
#[derive(Debug, Clone, Default)]
pub struct LogCloser {
    closed: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl LogCloser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`LogCloser::close`] has been called.
    pub async fn closed(&self) {
        loop {
            // Register before checking so a close between the check and
            // the await is not missed.
            let notified = self.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// A log file tail. Chunks arrive on `rx`; dropping or closing the
/// closer stops the producer.
#[derive(Debug)]
pub struct LogStream {
    pub rx: mpsc::Receiver<Vec<u8>>,
    pub closer: LogCloser,
}

/// Hypervisor operations the core depends on.
#[async_trait]
pub trait InfraDriver: Send + Sync + 'static {
    /// Creates a powered-off VM from `spec`.
    async fn create_vm(&self, spec: &VmCreateSpec) -> Result<VmRef, DriverError>;

    /// Applies `spec` to an existing VM.
    ///
    /// # Errors
    /// [`DriverError::ConcurrentAccess`] when the spec's change version is
    /// stale.
    async fn reconfigure_vm(&self, vm: &VmRef, spec: VmReconfigSpec) -> Result<(), DriverError>;

    async fn power_on(&self, vm: &VmRef) -> Result<(), DriverError>;

    /// # Errors
    /// Surfaces [`DriverError::InvalidPowerState`] and
    /// [`DriverError::VmConfigFault`] distinctly so stop can classify
    /// them.
    async fn power_off(&self, vm: &VmRef) -> Result<(), DriverError>;

    /// Destroys the VM and deletes its files.
    async fn destroy_vm(&self, vm: &VmRef) -> Result<(), DriverError>;

    /// Runs a named program inside the guest.
    async fn start_guest_program(
        &self,
        vm: &VmRef,
        program: &str,
        args: &[String],
        auth: &GuestAuth,
    ) -> Result<(), DriverError>;

    /// Blocks until the VM reaches `desired` or the caller's timeout
    /// cancels the future.
    ///
    /// # Cancel Safety
    /// Safe to race against a timeout; no state is held across the wait.
    async fn wait_for_power_state(
        &self,
        vm: &VmRef,
        desired: PowerState,
    ) -> Result<(), DriverError>;

    /// Blocks until `key` appears in the VM's extra-config with a
    /// non-empty value, returning the value.
    async fn wait_for_extra_config_key(
        &self,
        vm: &VmRef,
        key: &str,
    ) -> Result<String, DriverError>;

    async fn properties(&self, vm: &VmRef) -> Result<VmProperties, DriverError>;

    /// Enumerates VMs in the managing resource pool.
    async fn list_vms(&self) -> Result<Vec<(VmRef, VmProperties)>, DriverError>;

    /// Returns up to `page_size` events with keys after `after_key`,
    /// oldest first.
    async fn next_events(
        &self,
        after_key: u64,
        page_size: u32,
    ) -> Result<Vec<VmEvent>, DriverError>;

    /// Batched perf query for `counters` across `vms`.
    async fn perf_sample(
        &self,
        vms: &[VmRef],
        counters: &[&str],
        max_samples: u32,
        interval_secs: u32,
    ) -> Result<Vec<MetricSeries>, DriverError>;

    /// Opens a datastore log file. `tail` limits replay to the last N
    /// lines; `follow` keeps the stream open for appended data.
    async fn open_log(
        &self,
        vm: &VmRef,
        file: &str,
        tail: Option<usize>,
        follow: bool,
    ) -> Result<LogStream, DriverError>;

    /// Repairs a VM that faulted into an invalid state.
    async fn repair_vm(&self, vm: &VmRef) -> Result<(), DriverError>;
}
