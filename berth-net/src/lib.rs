//! Network context for container VMs.
//!
//! A [`Scope`] is an isolated layer-2 segment with its own subnet and
//! address pools; bridge scopes are carved out of a configured pool,
//! external scopes map pre-existing infrastructure networks. The
//! [`NetworkContext`] owns all scopes, reserves addresses when a
//! container binds, and answers name lookups for embedded DNS.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod address_space;
pub mod alias;
pub mod context;
pub mod scope;

pub use address_space::AddressSpace;
pub use alias::Alias;
pub use context::{AddContainerOptions, EndpointInfo, NetworkContext, NewScopeConfig};
pub use scope::{Scope, ScopeInfo, ScopeType};
