//! Error types shared across the port layer.

use crate::state::State;

/// Errors produced by port-layer operations.
///
/// `Clone` so a single failure can be fanned out to every waiter on a
/// batched operation.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A named entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// A named entity already exists.
    #[error("{kind} {id} already exists")]
    Duplicate { kind: &'static str, id: String },

    /// The caller supplied something malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the container's current state.
    #[error("cannot {op} container in state {state}")]
    InvalidState { op: &'static str, state: State },

    /// The entity changed underneath the caller's snapshot. Retryable:
    /// refresh the handle and reapply the mutation.
    #[error("concurrent modification detected (change version {change_version})")]
    ConcurrentAccess { change_version: String },

    /// A bounded wait expired.
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout {
        what: &'static str,
        timeout: std::time::Duration,
    },

    /// The infrastructure reported a fault.
    #[error("infrastructure fault: {0}")]
    InfrastructureFault(String),

    /// A data migration plugin failed. `version` is the highest version
    /// that applied cleanly before the failure.
    #[error("data migration failed at version {version}: {detail}")]
    MigrationFailed { version: i32, detail: String },

    /// Persisted key/value data could not be decoded.
    #[error("data decode failed: {0}")]
    DataDecode(String),

    /// A device cannot be removed while containers still use it.
    #[error("device in use by {}", ids.join(", "))]
    DeviceInUse { ids: Vec<String> },
}

impl CoreError {
    /// Returns `true` for faults worth retrying after a backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::ConcurrentAccess { .. } | CoreError::InfrastructureFault(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_entity() {
        let err = CoreError::NotFound {
            kind: "container",
            id: "deadbeef".into(),
        };
        assert_eq!(err.to_string(), "container deadbeef not found");
    }

    #[test]
    fn concurrent_access_is_transient() {
        let err = CoreError::ConcurrentAccess {
            change_version: "12".into(),
        };
        assert!(err.is_transient());
        assert!(!CoreError::InvalidArgument("x".into()).is_transient());
    }
}
