//! Container execution layer.
//!
//! Owns the authoritative in-memory view of every container VM and the
//! only path for mutating one. Reads go through [`ContainerCache`];
//! writes are staged on a [`Handle`] and applied by the [`Committer`],
//! which batches and serializes commits per VM. VM lifecycle events flow
//! back through [`events::start_event_pipeline`] to keep the cache
//! converged with the infrastructure.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod batcher;
pub mod cache;
pub mod commit;
pub mod container;
pub mod events;
pub mod handle;

pub use batcher::{Assessment, Batcher, BatcherConfig};
pub use cache::ContainerCache;
pub use commit::{Committer, ContainerCreateConfig, DEFAULT_STOP_WAIT, START_WAIT};
pub use container::{
    derive_state, is_repairable_fault, Container, ContainerInfo, ContainerInner, REFRESH_TIMEOUT,
};
pub use events::{start_event_pipeline, CACHE_SUBSCRIBER};
pub use handle::{CreateParams, Handle, HandleStore, HANDLE_CAPACITY};
