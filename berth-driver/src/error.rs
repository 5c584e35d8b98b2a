//! Driver fault taxonomy.
//!
//! The hypervisor reports failures as faults; the driver surfaces the
//! handful the core reacts to distinctly and folds everything else into
//! [`DriverError::Fault`].

use berth_core::State;

/// Errors surfaced by [`crate::InfraDriver`] operations.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum DriverError {
    /// The VM's change version advanced since the caller read it.
    #[error("concurrent access: change version moved past {change_version}")]
    ConcurrentAccess { change_version: String },

    /// A power operation found the VM already in some power state.
    #[error("invalid power state: VM is already {existing}")]
    InvalidPowerState { existing: PowerState },

    /// A VirtualMachine config fault, identified by its message keys.
    #[error("vm config fault: {}", message_keys.join(", "))]
    VmConfigFault { message_keys: Vec<String> },

    #[error("vm {0} not found")]
    NotFound(String),

    /// A disk is locked by another VM.
    #[error("device in use: {}", device_ids.join(", "))]
    DeviceInUse { device_ids: Vec<String> },

    #[error("wait for {what} timed out")]
    Timeout { what: &'static str },

    #[error("hypervisor fault: {0}")]
    Fault(String),
}

/// Fault message key the hypervisor emits when powering off a VM that was
/// never suspended. Stop treats it as success.
pub const VM_NOT_SUSPENDED_KEY: &str = "msg.suspend.powerOff.notsuspended";

impl DriverError {
    /// Whether a power-off that failed with this error still left the VM
    /// powered off.
    #[must_use]
    pub fn power_off_succeeded(&self) -> bool {
        match self {
            DriverError::InvalidPowerState { existing } => *existing == PowerState::PoweredOff,
            DriverError::VmConfigFault { message_keys } => {
                message_keys.iter().any(|k| k == VM_NOT_SUSPENDED_KEY)
            }
            _ => false,
        }
    }
}

/// Power state of a VM as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl PowerState {
    /// Container state a freshly observed VM in this power state maps to.
    #[must_use]
    pub fn container_state(self) -> State {
        match self {
            PowerState::PoweredOn => State::Running,
            PowerState::PoweredOff => State::Stopped,
            PowerState::Suspended => State::Suspended,
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Suspended => "suspended",
        })
    }
}

impl From<DriverError> for berth_core::CoreError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::ConcurrentAccess { change_version } => {
                berth_core::CoreError::ConcurrentAccess { change_version }
            }
            DriverError::NotFound(id) => berth_core::CoreError::NotFound { kind: "vm", id },
            DriverError::DeviceInUse { device_ids } => {
                berth_core::CoreError::DeviceInUse { ids: device_ids }
            }
            DriverError::Timeout { what } => berth_core::CoreError::Timeout {
                what,
                timeout: std::time::Duration::ZERO,
            },
            other => berth_core::CoreError::InfrastructureFault(other.to_string()),
        }
    }
}
