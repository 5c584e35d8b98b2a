//! Scopes: named network segments with their own IPAM.

use std::net::Ipv4Addr;

use berth_core::{Common, ContainerNetwork, CoreError, Ipv4Net, Ipv4Range};
use serde::Serialize;

use crate::address_space::AddressSpace;

/// How a scope connects containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    /// Private segment on the bridge network, addressed by this process.
    Bridge,
    /// Pre-existing infrastructure network.
    External,
}

impl std::fmt::Display for ScopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ScopeType::Bridge => "bridge",
            ScopeType::External => "external",
        })
    }
}

/// A named network segment.
#[derive(Debug, Clone)]
pub struct Scope {
    pub id: String,
    pub name: String,
    pub scope_type: ScopeType,
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    /// Pool ranges as configured, for endpoint snapshots.
    pub pool_ranges: Vec<Ipv4Range>,
    /// Live allocation state, one space per pool range.
    pub(crate) pools: Vec<AddressSpace>,
    pub builtin: bool,
    /// Hypervisor network backing this scope.
    pub network_ref: String,
    /// Subnet was carved from the default bridge pool and returns to it
    /// on deletion.
    pub(crate) carved: bool,
}

impl Scope {
    /// A dynamic scope has no pools of its own; addressing comes from
    /// the infrastructure and is absorbed back from the guest.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.scope_type == ScopeType::External && self.pools.is_empty()
    }

    /// Reserves `requested`, or the next free address when `None`.
    ///
    /// # Errors
    /// [`CoreError::InvalidArgument`] when `requested` is in no pool,
    /// [`CoreError::Duplicate`] when it is taken, and
    /// [`CoreError::InfrastructureFault`] when every pool is exhausted.
    pub fn reserve(&mut self, requested: Option<Ipv4Addr>) -> Result<Ipv4Addr, CoreError> {
        match requested {
            Some(ip) => {
                let pool = self
                    .pools
                    .iter_mut()
                    .find(|p| p.contains(ip))
                    .ok_or_else(|| {
                        CoreError::InvalidArgument(format!(
                            "{ip} is not in any pool of scope {}",
                            self.name
                        ))
                    })?;
                pool.reserve_ip(ip)?;
                Ok(ip)
            }
            None => {
                for pool in &mut self.pools {
                    if let Ok(ip) = pool.reserve_next_ip() {
                        return Ok(ip);
                    }
                }
                Err(CoreError::InfrastructureFault(format!(
                    "scope {} has no free addresses",
                    self.name
                )))
            }
        }
    }

    /// Returns `ip` to whichever pool owns it.
    ///
    /// # Errors
    /// [`CoreError::InvalidArgument`] when no pool owns `ip` or it was
    /// not reserved.
    pub fn release(&mut self, ip: Ipv4Addr) -> Result<(), CoreError> {
        let pool = self
            .pools
            .iter_mut()
            .find(|p| p.contains(ip))
            .ok_or_else(|| {
                CoreError::InvalidArgument(format!(
                    "{ip} is not in any pool of scope {}",
                    self.name
                ))
            })?;
        pool.release_ip(ip)
    }

    /// Network snapshot embedded into an endpoint's configuration.
    #[must_use]
    pub fn container_network(&self, aliases: Vec<String>) -> ContainerNetwork {
        ContainerNetwork {
            common: Common {
                id: self.id.clone(),
                name: self.name.clone(),
                notes: String::new(),
            },
            gateway: Some(self.gateway),
            subnet: Some(self.subnet),
            nameservers: self.dns.clone(),
            pools: self.pool_ranges.clone(),
            destinations: Vec::new(),
            aliases,
        }
    }

    /// Serializable summary for API responses.
    #[must_use]
    pub fn info(&self, containers: Vec<String>) -> ScopeInfo {
        ScopeInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            scope_type: self.scope_type,
            subnet: self.subnet.to_string(),
            gateway: self.gateway.to_string(),
            dns: self.dns.iter().map(ToString::to_string).collect(),
            pools: self.pool_ranges.iter().map(ToString::to_string).collect(),
            builtin: self.builtin,
            containers,
        }
    }
}

/// API-facing scope summary.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub scope_type: ScopeType,
    pub subnet: String,
    pub gateway: String,
    pub dns: Vec<String>,
    pub pools: Vec<String>,
    pub builtin: bool,
    pub containers: Vec<String>,
}
