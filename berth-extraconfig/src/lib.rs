//! Persisted configuration codec and data migration.
//!
//! Container configuration is stored as a flat string map in the VM's
//! extra-configuration. This crate owns that wire shape: [`encode`] and
//! [`decode`] translate between the map and [`berth_core::ExecConfig`],
//! and [`MigrationManager`] upgrades maps written by older releases
//! before they are decoded.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod decode;
pub mod encode;
pub mod keys;
pub mod migration;

pub use decode::{data_version, decode};
pub use encode::{encode, EncodeScope};
pub use keys::{session_started_key, APPLIANCE_VERSION_KEY, CONTAINER_VERSION_KEY};
pub use migration::{
    MigrationError, MigrationManager, Plugin, Target, MAX_PLUGIN_VERSION, RENAME_SUPPORTED_VERSION,
};
