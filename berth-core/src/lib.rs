//! Core types for the Berth container host layer.
//!
//! Defines the fundamental domain types: container and handle identifiers,
//! the container lifecycle state machine, the decoded executor configuration,
//! semantic error kinds, and the commit retry policy.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod error;
pub mod id;
pub mod ipv4;
pub mod retry;
pub mod state;

pub use config::{
    Common, ContainerNetwork, CoreConfig, Diagnostics, ExecConfig, NetworkEndpoint, PortBinding,
    Protocol, SessionCmd, SessionConfig,
};
pub use error::CoreError;
pub use id::{ContainerId, HandleKey, VmRef};
pub use ipv4::{Ipv4Net, Ipv4Range};
pub use retry::{retry_with_backoff, Backoff};
pub use state::{PowerEvent, State};
