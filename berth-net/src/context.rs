//! The network context: process-wide scope set, name resolution, and
//! endpoint binding.
//!
//! One mutex guards everything; it is taken per operation and never held
//! across driver calls. Binding is transactional: either every endpoint
//! of a handle gets its address and name entries, or nothing changes.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use berth_core::{
    Common, ContainerId, ContainerNetwork, CoreConfig, CoreError, Ipv4Net, Ipv4Range, PortBinding,
};
use berth_exec::Handle;
use berth_driver::DeviceChange;
use indexmap::IndexMap;
use serde::Serialize;

use crate::address_space::AddressSpace;
use crate::alias::Alias;
use crate::scope::{Scope, ScopeInfo, ScopeType};

/// Parameters for creating a scope.
#[derive(Debug, Clone)]
pub struct NewScopeConfig {
    pub scope_type: ScopeType,
    pub name: String,
    pub subnet: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub pools: Vec<Ipv4Range>,
    /// Hypervisor network backing the scope; defaults to the bridge
    /// network for bridge scopes.
    pub network_ref: String,
}

impl NewScopeConfig {
    /// A bridge scope with everything defaulted.
    #[must_use]
    pub fn bridge(name: impl Into<String>) -> Self {
        Self {
            scope_type: ScopeType::Bridge,
            name: name.into(),
            subnet: None,
            gateway: None,
            dns: Vec::new(),
            pools: Vec::new(),
            network_ref: String::new(),
        }
    }
}

/// Parameters for attaching a container to a scope.
#[derive(Debug, Clone)]
pub struct AddContainerOptions {
    pub scope: String,
    /// Static address; `None` reserves dynamically at bind.
    pub ip: Option<Ipv4Addr>,
    pub ports: Vec<PortBinding>,
    pub aliases: Vec<String>,
}

impl AddContainerOptions {
    #[must_use]
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ip: None,
            ports: Vec::new(),
            aliases: Vec::new(),
        }
    }
}

/// Outcome of binding or unbinding one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<Ipv4Net>,
    pub is_default: bool,
    pub ports: Vec<PortBinding>,
}

struct ContextInner {
    scopes: IndexMap<String, Scope>,
    /// Pool bridge-scope subnets are carved from.
    default_pool: AddressSpace,
    default_pool_net: Ipv4Net,
    scope_prefix: u8,
    bridge_network: String,
    /// Resolvable names: long id, short id, container name, aliases.
    names: HashMap<String, ContainerId>,
    /// Containers with bound endpoints, per scope.
    scope_containers: HashMap<String, HashSet<ContainerId>>,
    /// Gateway addresses installed on the bridge link.
    bridge_link: HashSet<Ipv4Addr>,
}

/// Process-wide network state.
pub struct NetworkContext {
    inner: Mutex<ContextInner>,
}

impl NetworkContext {
    /// Builds the context with the builtin bridge scope and any
    /// pre-declared external networks from `config`.
    ///
    /// # Errors
    /// [`CoreError::InvalidArgument`] when configured networks collide
    /// or their addressing is inconsistent.
    pub fn new(config: &CoreConfig) -> Result<Self, CoreError> {
        let default_pool_net = config.bridge_pool;
        let mut inner = ContextInner {
            scopes: IndexMap::new(),
            default_pool: AddressSpace::from_range(Ipv4Range::from(default_pool_net)),
            default_pool_net,
            scope_prefix: config.bridge_scope_prefix,
            bridge_network: config.bridge_network.clone(),
            names: HashMap::new(),
            scope_containers: HashMap::new(),
            bridge_link: HashSet::new(),
        };

        Self::create_scope(
            &mut inner,
            NewScopeConfig::bridge(config.bridge_network.clone()),
            true,
        )?;

        for (name, network) in &config.container_networks {
            Self::create_external(&mut inner, name, network)?;
        }

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContextInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a pre-declared external network as a builtin scope. A
    /// network without a subnet is dynamic: the infrastructure addresses
    /// it and the guest reports what it got.
    fn create_external(
        inner: &mut ContextInner,
        name: &str,
        network: &ContainerNetwork,
    ) -> Result<(), CoreError> {
        match network.subnet {
            Some(subnet) => Self::create_scope(
                inner,
                NewScopeConfig {
                    scope_type: ScopeType::External,
                    name: name.to_owned(),
                    subnet: Some(subnet),
                    gateway: network.gateway,
                    dns: network.nameservers.clone(),
                    pools: if network.pools.is_empty() {
                        vec![Ipv4Range::from(subnet)]
                    } else {
                        network.pools.clone()
                    },
                    network_ref: network.common.name.clone(),
                },
                true,
            )
            .map(|_| ()),
            None => {
                if inner.scopes.contains_key(name) {
                    return Err(CoreError::Duplicate {
                        kind: "scope",
                        id: name.to_owned(),
                    });
                }
                inner.scopes.insert(
                    name.to_owned(),
                    Scope {
                        id: uuid::Uuid::new_v4().to_string(),
                        name: name.to_owned(),
                        scope_type: ScopeType::External,
                        subnet: Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0)?,
                        gateway: Ipv4Addr::UNSPECIFIED,
                        dns: network.nameservers.clone(),
                        pool_ranges: Vec::new(),
                        pools: Vec::new(),
                        builtin: true,
                        network_ref: network.common.name.clone(),
                        carved: false,
                    },
                );
                Ok(())
            }
        }
    }

    /// Creates a scope.
    ///
    /// # Errors
    /// [`CoreError::Duplicate`] on a name collision or subnet overlap
    /// with an existing scope, [`CoreError::InvalidArgument`] for
    /// inconsistent addressing, and [`CoreError::InfrastructureFault`]
    /// when the default pool is exhausted. All reservations roll back on
    /// failure.
    pub fn new_scope(&self, config: NewScopeConfig) -> Result<ScopeInfo, CoreError> {
        let mut inner = self.lock();
        Self::create_scope(&mut inner, config, false)
    }

    fn create_scope(
        inner: &mut ContextInner,
        config: NewScopeConfig,
        builtin: bool,
    ) -> Result<ScopeInfo, CoreError> {
        if inner.scopes.contains_key(&config.name) {
            return Err(CoreError::Duplicate {
                kind: "scope",
                id: config.name,
            });
        }

        let (subnet, carved) = match (config.scope_type, config.subnet) {
            (ScopeType::Bridge, Some(subnet)) => {
                Self::check_overlap(inner, &subnet, &config.name)?;
                if inner.default_pool_net.overlaps(&subnet) {
                    // Inside the default pool: carve so later defaulted
                    // scopes cannot collide with it.
                    inner.default_pool.reserve_net(&subnet)?;
                    (subnet, true)
                } else {
                    (subnet, false)
                }
            }
            (ScopeType::Bridge, None) => {
                let subnet = inner.default_pool.reserve_next_net(inner.scope_prefix)?;
                (subnet, true)
            }
            (ScopeType::External, Some(subnet)) => {
                if inner.default_pool_net.overlaps(&subnet) {
                    return Err(CoreError::InvalidArgument(format!(
                        "external subnet {subnet} overlaps the bridge pool {}",
                        inner.default_pool_net
                    )));
                }
                Self::check_overlap(inner, &subnet, &config.name)?;
                if config.gateway.is_none() || config.pools.is_empty() {
                    return Err(CoreError::InvalidArgument(
                        "external scopes require a gateway and address pools".into(),
                    ));
                }
                (subnet, false)
            }
            (ScopeType::External, None) => {
                return Err(CoreError::InvalidArgument(
                    "external scopes require a subnet".into(),
                ));
            }
        };

        let result = Self::finish_scope(inner, &config, subnet, carved, builtin);
        if result.is_err() && carved {
            // Roll back the carve; the subnet was valid when reserved.
            let _ = inner.default_pool.release_net(&subnet);
        }
        result
    }

    fn finish_scope(
        inner: &mut ContextInner,
        config: &NewScopeConfig,
        subnet: Ipv4Net,
        carved: bool,
        builtin: bool,
    ) -> Result<ScopeInfo, CoreError> {
        let mut pool_ranges = Vec::new();
        let mut pools = Vec::new();
        if config.pools.is_empty() {
            let space = AddressSpace::from_net(&subnet)?;
            pool_ranges.push(*space.range());
            pools.push(space);
        } else {
            for range in &config.pools {
                if !subnet.contains(range.first) || !subnet.contains(range.last) {
                    return Err(CoreError::InvalidArgument(format!(
                        "pool {range} is outside subnet {subnet}"
                    )));
                }
                pool_ranges.push(*range);
                pools.push(AddressSpace::from_range(*range));
            }
        }

        // An all-zeros gateway means "pick one".
        let gateway = match config.gateway.filter(|g| !g.is_unspecified()) {
            Some(gateway) => {
                if !subnet.contains(gateway) {
                    return Err(CoreError::InvalidArgument(format!(
                        "gateway {gateway} is not routable in {subnet}"
                    )));
                }
                if let Some(pool) = pools.iter_mut().find(|p| p.contains(gateway)) {
                    pool.reserve_ip(gateway)?;
                }
                gateway
            }
            None => pools
                .first_mut()
                .ok_or_else(|| {
                    CoreError::InvalidArgument(format!("scope {} has no pools", config.name))
                })?
                .reserve_next_ip()?,
        };

        for &dns in &config.dns {
            if let Some(pool) = pools.iter_mut().find(|p| p.contains(dns)) {
                // Sharing an address with the gateway is fine.
                match pool.reserve_ip(dns) {
                    Ok(()) | Err(CoreError::Duplicate { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let network_ref = if config.network_ref.is_empty() {
            inner.bridge_network.clone()
        } else {
            config.network_ref.clone()
        };

        let scope = Scope {
            id: uuid::Uuid::new_v4().to_string(),
            name: config.name.clone(),
            scope_type: config.scope_type,
            subnet,
            gateway,
            dns: config.dns.clone(),
            pool_ranges,
            pools,
            builtin,
            network_ref,
            carved,
        };
        if scope.scope_type == ScopeType::Bridge {
            inner.bridge_link.insert(gateway);
        }
        tracing::info!(scope = %scope.name, %subnet, %gateway, kind = %scope.scope_type, "scope created");
        let info = scope.info(Vec::new());
        inner.scopes.insert(config.name.clone(), scope);
        Ok(info)
    }

    fn check_overlap(
        inner: &ContextInner,
        subnet: &Ipv4Net,
        name: &str,
    ) -> Result<(), CoreError> {
        for scope in inner.scopes.values() {
            if !scope.subnet.is_unspecified() && scope.subnet.overlaps(subnet) {
                return Err(CoreError::Duplicate {
                    kind: "subnet",
                    id: format!("{subnet} overlaps scope {} ({name})", scope.name),
                });
            }
        }
        Ok(())
    }

    /// Deletes a scope.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] for an unknown name,
    /// [`CoreError::InvalidArgument`] for builtin scopes or scopes with
    /// bound endpoints.
    pub fn delete_scope(&self, name: &str) -> Result<(), CoreError> {
        let mut inner = self.lock();
        let scope = inner.scopes.get(name).ok_or_else(|| CoreError::NotFound {
            kind: "scope",
            id: name.to_owned(),
        })?;
        if scope.builtin {
            return Err(CoreError::InvalidArgument(format!(
                "scope {name} is builtin"
            )));
        }
        if inner
            .scope_containers
            .get(name)
            .is_some_and(|c| !c.is_empty())
        {
            return Err(CoreError::InvalidArgument(format!(
                "scope {name} has bound endpoints"
            )));
        }

        let scope = inner
            .scopes
            .shift_remove(name)
            .ok_or_else(|| CoreError::NotFound {
                kind: "scope",
                id: name.to_owned(),
            })?;
        if scope.scope_type == ScopeType::Bridge {
            // A gateway missing from the link is not an error.
            inner.bridge_link.remove(&scope.gateway);
        }
        if scope.carved {
            if let Err(e) = inner.default_pool.release_net(&scope.subnet) {
                tracing::warn!(scope = name, error = %e, "failed to return subnet to pool");
            }
        }
        inner.scope_containers.remove(name);
        tracing::info!(scope = name, "scope deleted");
        Ok(())
    }

    /// Lists all scopes, or the named ones.
    #[must_use]
    pub fn scopes(&self, names: Option<&[String]>) -> Vec<ScopeInfo> {
        let inner = self.lock();
        inner
            .scopes
            .values()
            .filter(|s| names.is_none_or(|names| names.iter().any(|n| *n == s.name)))
            .map(|s| {
                let containers = inner
                    .scope_containers
                    .get(&s.name)
                    .map(|ids| ids.iter().map(ToString::to_string).collect())
                    .unwrap_or_default();
                s.info(containers)
            })
            .collect()
    }

    /// Appends a pending endpoint for `options.scope` to the handle.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] for an unknown scope,
    /// [`CoreError::Duplicate`] when the scope is already attached, and
    /// [`CoreError::InvalidArgument`] for a second external scope or a
    /// static address outside the subnet.
    pub fn add_container(
        &self,
        handle: &mut Handle,
        options: &AddContainerOptions,
    ) -> Result<(), CoreError> {
        let inner = self.lock();
        let scope = inner
            .scopes
            .get(&options.scope)
            .ok_or_else(|| CoreError::NotFound {
                kind: "scope",
                id: options.scope.clone(),
            })?;

        if handle.exec_config.networks.contains_key(&options.scope) {
            return Err(CoreError::Duplicate {
                kind: "endpoint",
                id: options.scope.clone(),
            });
        }
        if scope.scope_type == ScopeType::External {
            let has_external = handle
                .exec_config
                .networks
                .keys()
                .filter_map(|name| inner.scopes.get(name))
                .any(|s| s.scope_type == ScopeType::External);
            if has_external {
                return Err(CoreError::InvalidArgument(
                    "container is already attached to an external scope".into(),
                ));
            }
        }
        if let Some(ip) = options.ip {
            if !scope.subnet.contains(ip) {
                return Err(CoreError::InvalidArgument(format!(
                    "{ip} is not in subnet {}",
                    scope.subnet
                )));
            }
        }

        let slot = Self::pick_slot(&inner, handle, scope);
        let nic_pending = handle.exec_config.networks.values().any(|e| {
            e.common.id == slot.to_string()
        }) || handle
            .device_changes
            .iter()
            .any(|d| matches!(d, DeviceChange::AddNic { slot: s, .. } if *s == slot));
        if !nic_pending {
            handle.device_changes.push(DeviceChange::AddNic {
                label: format!("ethernet-{slot}"),
                slot,
                network_ref: scope.network_ref.clone(),
            });
        }

        let endpoint = berth_core::NetworkEndpoint {
            common: Common {
                id: slot.to_string(),
                name: options.scope.clone(),
                notes: String::new(),
            },
            network: scope.container_network(options.aliases.clone()),
            static_ip: options.ip,
            assigned: None,
            ports: options.ports.clone(),
        };
        drop(inner);
        handle.add_network_endpoint(&options.scope, endpoint)
    }

    /// A bridge endpoint shares the handle's existing bridge NIC; any
    /// other endpoint gets the lowest slot not already in use.
    fn pick_slot(inner: &ContextInner, handle: &Handle, scope: &Scope) -> u32 {
        if scope.scope_type == ScopeType::Bridge {
            let shared = handle
                .exec_config
                .networks
                .iter()
                .filter(|(name, _)| {
                    inner
                        .scopes
                        .get(*name)
                        .is_some_and(|s| s.scope_type == ScopeType::Bridge)
                })
                .filter_map(|(_, e)| e.common.id.parse::<u32>().ok())
                .min();
            if let Some(slot) = shared {
                return slot;
            }
        }
        let used: HashSet<u32> = handle
            .exec_config
            .networks
            .values()
            .filter_map(|e| e.common.id.parse().ok())
            .chain(handle.device_changes.iter().filter_map(|d| match d {
                DeviceChange::AddNic { slot, .. } => Some(*slot),
                _ => None,
            }))
            .collect();
        (0..).find(|slot| !used.contains(slot)).unwrap_or(0)
    }

    /// Drops the pending endpoint for `scope` from the handle, removing
    /// the NIC when no other endpoint still uses its slot.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] when the scope is not attached.
    pub fn remove_container(&self, handle: &mut Handle, scope: &str) -> Result<(), CoreError> {
        let endpoint = handle.remove_network_endpoint(scope)?;
        let Ok(slot) = endpoint.common.id.parse::<u32>() else {
            return Ok(());
        };
        let slot_in_use = handle
            .exec_config
            .networks
            .values()
            .any(|e| e.common.id == endpoint.common.id);
        if !slot_in_use {
            // An add-then-remove in the same handle cancels out instead
            // of producing both device operations.
            let pending = handle.device_changes.iter().position(
                |d| matches!(d, DeviceChange::AddNic { slot: s, .. } if *s == slot),
            );
            if let Some(idx) = pending {
                handle.device_changes.remove(idx);
            } else {
                handle.device_changes.push(DeviceChange::RemoveNic { slot });
            }
        }
        Ok(())
    }

    /// Reserves addresses and installs names for every endpoint on the
    /// handle. All or nothing: a failure releases everything reserved by
    /// this call.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] for a vanished scope, plus reservation
    /// failures from the scope's pools.
    pub fn bind_container(&self, handle: &mut Handle) -> Result<Vec<EndpointInfo>, CoreError> {
        let mut inner = self.lock();
        let container = ContainerId::new(handle.exec_config.common.id.clone());
        let container_name = handle.exec_config.common.name.clone();

        let mut reserved: Vec<(String, Ipv4Addr)> = Vec::new();
        let mut infos: Vec<EndpointInfo> = Vec::new();
        let mut aliases: Vec<Alias> = Vec::new();

        let mut failure: Option<CoreError> = None;
        for (scope_name, endpoint) in &mut handle.exec_config.networks {
            let Some(scope) = inner.scopes.get_mut(scope_name) else {
                failure = Some(CoreError::NotFound {
                    kind: "scope",
                    id: scope_name.clone(),
                });
                break;
            };
            let ip = if scope.is_dynamic() {
                None
            } else {
                match scope.reserve(endpoint.static_ip) {
                    Ok(ip) => Some(ip),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            };
            if let Some(ip) = ip {
                endpoint.assigned = Some(ip);
                reserved.push((scope_name.clone(), ip));
            }
            aliases.extend(endpoint.network.aliases.iter().map(|a| Alias::parse(a)));
            infos.push(EndpointInfo {
                scope: scope_name.clone(),
                ip,
                gateway: endpoint.network.gateway,
                subnet: endpoint.network.subnet,
                is_default: false,
                ports: endpoint.ports.clone(),
            });
        }

        if let Some(e) = failure {
            for (scope_name, ip) in reserved {
                if let Some(scope) = inner.scopes.get_mut(&scope_name) {
                    let _ = scope.release(ip);
                }
            }
            for endpoint in handle.exec_config.networks.values_mut() {
                endpoint.assigned = None;
            }
            return Err(e);
        }

        // The default endpoint is the first external one, else the first
        // in configured order.
        if !infos.is_empty() {
            let default_idx = infos
                .iter()
                .position(|i| {
                    inner
                        .scopes
                        .get(&i.scope)
                        .is_some_and(|s| s.scope_type == ScopeType::External)
                })
                .unwrap_or(0);
            infos[default_idx].is_default = true;
        }

        inner.names.insert(container.to_string(), container.clone());
        inner
            .names
            .insert(container.truncated().to_owned(), container.clone());
        if !container_name.is_empty() {
            inner.names.insert(container_name, container.clone());
        }
        for alias in aliases {
            // A bare alias names this container; "who:what" names the
            // container "who" resolves to.
            let target = if alias.is_self() || alias.who == handle.exec_config.common.name {
                container.clone()
            } else if let Some(id) = inner.names.get(&alias.who) {
                id.clone()
            } else {
                tracing::warn!(who = %alias.who, what = %alias.what, "alias target unknown, skipping");
                continue;
            };
            inner.names.insert(alias.what, target);
        }

        for info in &infos {
            inner
                .scope_containers
                .entry(info.scope.clone())
                .or_default()
                .insert(container.clone());
        }

        Ok(infos)
    }

    /// Releases addresses and removes name entries for every endpoint on
    /// the handle.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] for a vanished scope.
    pub fn unbind_container(&self, handle: &mut Handle) -> Result<Vec<EndpointInfo>, CoreError> {
        let mut inner = self.lock();
        let container = ContainerId::new(handle.exec_config.common.id.clone());

        let mut infos = Vec::new();
        for (scope_name, endpoint) in &mut handle.exec_config.networks {
            let Some(scope) = inner.scopes.get_mut(scope_name) else {
                return Err(CoreError::NotFound {
                    kind: "scope",
                    id: scope_name.clone(),
                });
            };
            if let Some(ip) = endpoint.assigned.take() {
                if let Err(e) = scope.release(ip) {
                    tracing::warn!(scope = %scope_name, %ip, error = %e, "release failed");
                }
            }
            if let Some(containers) = inner.scope_containers.get_mut(scope_name.as_str()) {
                containers.remove(&container);
            }
            infos.push(EndpointInfo {
                scope: scope_name.clone(),
                ip: None,
                gateway: endpoint.network.gateway,
                subnet: endpoint.network.subnet,
                is_default: false,
                ports: endpoint.ports.clone(),
            });
        }

        inner.names.retain(|_, id| *id != container);
        Ok(infos)
    }

    /// Absorbs guest-reported addressing into dynamic scopes.
    pub fn update_container(&self, handle: &Handle) {
        let mut inner = self.lock();
        for (scope_name, endpoint) in &handle.exec_config.networks {
            let Some(scope) = inner.scopes.get_mut(scope_name) else {
                continue;
            };
            if !scope.is_dynamic() {
                continue;
            }
            if let Some(subnet) = endpoint.network.subnet {
                scope.subnet = subnet;
            }
            if let Some(gateway) = endpoint.network.gateway {
                scope.gateway = gateway;
            }
        }
    }

    /// Resolves a name (id, short id, container name, or alias) for DNS.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<ContainerId> {
        self.lock().names.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::ExecConfig;
    use berth_exec::CreateParams;

    fn context() -> NetworkContext {
        NetworkContext::new(&CoreConfig::default()).expect("context should build")
    }

    fn handle(id: &str, name: &str) -> Handle {
        Handle::new_create(
            ExecConfig::new(id, name),
            CreateParams {
                num_cpus: 1,
                memory_mb: 512,
            },
        )
    }

    fn net(s: &str) -> Ipv4Net {
        s.parse().expect("valid subnet")
    }

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().expect("valid address")
    }

    fn bridge_scope(ctx: &NetworkContext, name: &str, subnet: &str, gateway: &str) -> ScopeInfo {
        ctx.new_scope(NewScopeConfig {
            subnet: Some(net(subnet)),
            gateway: Some(addr(gateway)),
            ..NewScopeConfig::bridge(name)
        })
        .expect("scope should be created")
    }

    #[test]
    fn builtin_bridge_scope_takes_the_first_pool_subnet() {
        let ctx = context();
        let scopes = ctx.scopes(None);
        assert_eq!(scopes.len(), 1, "only the builtin bridge exists");
        assert_eq!(scopes[0].name, "bridge");
        assert_eq!(scopes[0].subnet, "172.16.0.0/16");
        assert_eq!(scopes[0].gateway, "172.16.0.1");
        assert!(scopes[0].builtin, "bridge scope is builtin");
    }

    #[test]
    fn defaulted_bridge_scope_carves_the_next_block() {
        let ctx = context();
        let info = ctx
            .new_scope(NewScopeConfig::bridge("apps"))
            .expect("scope should be created");
        assert_eq!(info.subnet, "172.17.0.0/16");
        assert_eq!(info.gateway, "172.17.0.1");
    }

    #[test]
    fn supplied_gateway_of_zero_means_pick_one() {
        let ctx = context();
        let info = ctx
            .new_scope(NewScopeConfig {
                subnet: Some(net("172.20.0.0/16")),
                gateway: Some(Ipv4Addr::UNSPECIFIED),
                ..NewScopeConfig::bridge("s1")
            })
            .expect("scope should be created");
        assert_eq!(info.gateway, "172.20.0.1");
    }

    #[test]
    fn overlapping_subnet_is_rejected() {
        let ctx = context();
        bridge_scope(&ctx, "s1", "172.20.0.0/16", "172.20.0.1");
        let err = ctx
            .new_scope(NewScopeConfig {
                subnet: Some(net("172.20.1.0/24")),
                ..NewScopeConfig::bridge("s2")
            })
            .expect_err("overlap must be rejected");
        assert!(
            matches!(err, CoreError::Duplicate { kind: "subnet", .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn supplied_subnet_blocks_later_carving() {
        let ctx = context();
        bridge_scope(&ctx, "s1", "172.17.0.0/16", "172.17.0.1");
        let info = ctx
            .new_scope(NewScopeConfig::bridge("s2"))
            .expect("scope should be created");
        assert_eq!(info.subnet, "172.18.0.0/16", "carve skips the used block");
    }

    #[test]
    fn external_scope_requires_full_addressing() {
        let ctx = context();
        let err = ctx
            .new_scope(NewScopeConfig {
                scope_type: ScopeType::External,
                subnet: Some(net("10.10.0.0/24")),
                gateway: None,
                pools: Vec::new(),
                ..NewScopeConfig::bridge("ext")
            })
            .expect_err("missing gateway and pools must be rejected");
        assert!(matches!(err, CoreError::InvalidArgument(_)), "got {err:?}");
    }

    #[test]
    fn builtin_scope_cannot_be_deleted() {
        let ctx = context();
        let err = ctx
            .delete_scope("bridge")
            .expect_err("builtin delete must be rejected");
        assert!(matches!(err, CoreError::InvalidArgument(_)), "got {err:?}");
    }

    #[test]
    fn deleted_scope_returns_its_subnet_to_the_pool() {
        let ctx = context();
        ctx.new_scope(NewScopeConfig::bridge("apps"))
            .expect("scope should be created");
        ctx.delete_scope("apps").expect("delete should succeed");
        let info = ctx
            .new_scope(NewScopeConfig::bridge("jobs"))
            .expect("scope should be created");
        assert_eq!(info.subnet, "172.17.0.0/16", "released block is reused");
    }

    #[test]
    fn scope_with_bound_endpoints_cannot_be_deleted() {
        let ctx = context();
        bridge_scope(&ctx, "s1", "172.20.0.0/16", "172.20.0.1");
        let mut h = handle("cafe00017e57", "web");
        ctx.add_container(&mut h, &AddContainerOptions::new("s1"))
            .expect("add should succeed");
        ctx.bind_container(&mut h).expect("bind should succeed");
        let err = ctx
            .delete_scope("s1")
            .expect_err("live scope delete must be rejected");
        assert!(matches!(err, CoreError::InvalidArgument(_)), "got {err:?}");

        ctx.unbind_container(&mut h).expect("unbind should succeed");
        ctx.delete_scope("s1").expect("delete after unbind");
    }

    #[test]
    fn add_container_records_an_endpoint_and_a_nic() {
        let ctx = context();
        let mut h = handle("cafe00017e57", "web");
        ctx.add_container(&mut h, &AddContainerOptions::new("bridge"))
            .expect("add should succeed");
        let endpoint = h
            .exec_config
            .networks
            .get("bridge")
            .expect("endpoint recorded");
        assert_eq!(endpoint.common.id, "0");
        assert_eq!(endpoint.network.common.name, "bridge");
        assert!(
            matches!(
                h.device_changes.as_slice(),
                [DeviceChange::AddNic { slot: 0, .. }]
            ),
            "got {:?}",
            h.device_changes
        );
    }

    #[test]
    fn duplicate_scope_attachment_is_rejected() {
        let ctx = context();
        let mut h = handle("cafe00017e57", "web");
        ctx.add_container(&mut h, &AddContainerOptions::new("bridge"))
            .expect("first add should succeed");
        let err = ctx
            .add_container(&mut h, &AddContainerOptions::new("bridge"))
            .expect_err("second add must be rejected");
        assert!(
            matches!(err, CoreError::Duplicate { kind: "endpoint", .. }),
            "got {err:?}"
        );
        assert_eq!(h.device_changes.len(), 1, "no stray device change");
    }

    #[test]
    fn second_external_scope_is_rejected() {
        let ctx = context();
        for (name, subnet, gateway, pool_first, pool_last) in [
            ("ext1", "10.10.0.0/24", "10.10.0.1", "10.10.0.10", "10.10.0.20"),
            ("ext2", "10.20.0.0/24", "10.20.0.1", "10.20.0.10", "10.20.0.20"),
        ] {
            ctx.new_scope(NewScopeConfig {
                scope_type: ScopeType::External,
                subnet: Some(net(subnet)),
                gateway: Some(addr(gateway)),
                pools: vec![Ipv4Range::new(addr(pool_first), addr(pool_last))
                    .expect("valid range")],
                network_ref: "uplink".into(),
                ..NewScopeConfig::bridge(name)
            })
            .expect("scope should be created");
        }
        let mut h = handle("cafe00017e57", "web");
        ctx.add_container(&mut h, &AddContainerOptions::new("ext1"))
            .expect("first external add should succeed");
        let err = ctx
            .add_container(&mut h, &AddContainerOptions::new("ext2"))
            .expect_err("second external must be rejected");
        assert!(matches!(err, CoreError::InvalidArgument(_)), "got {err:?}");
    }

    #[test]
    fn remove_container_cancels_a_pending_nic() {
        let ctx = context();
        let mut h = handle("cafe00017e57", "web");
        ctx.add_container(&mut h, &AddContainerOptions::new("bridge"))
            .expect("add should succeed");
        ctx.remove_container(&mut h, "bridge")
            .expect("remove should succeed");
        assert!(h.exec_config.networks.is_empty(), "endpoint removed");
        assert!(
            h.device_changes.is_empty(),
            "add and remove cancel out, got {:?}",
            h.device_changes
        );
    }

    #[test]
    fn bind_assigns_addresses_in_pool_order() {
        let ctx = context();
        bridge_scope(&ctx, "s1", "172.20.0.0/16", "0.0.0.0");

        let mut first = handle("cafe00017e57", "web");
        ctx.add_container(&mut first, &AddContainerOptions::new("s1"))
            .expect("add should succeed");
        let infos = ctx.bind_container(&mut first).expect("bind should succeed");
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].ip, Some(addr("172.20.0.2")), "gateway took .1");
        assert!(infos[0].is_default, "sole endpoint is the default");
        assert_eq!(
            first.exec_config.networks["s1"].assigned,
            Some(addr("172.20.0.2"))
        );

        let mut second = handle("beef00017e57", "db");
        let mut opts = AddContainerOptions::new("s1");
        opts.ip = Some(addr("172.20.0.5"));
        ctx.add_container(&mut second, &opts).expect("add should succeed");
        let infos = ctx.bind_container(&mut second).expect("bind should succeed");
        assert_eq!(infos[0].ip, Some(addr("172.20.0.5")), "static address honored");
    }

    #[test]
    fn bind_rolls_back_on_exhaustion() {
        let ctx = context();
        // A /30 has two usable hosts and the gateway takes one.
        bridge_scope(&ctx, "tiny", "172.20.0.0/30", "0.0.0.0");
        bridge_scope(&ctx, "wide", "172.21.0.0/16", "0.0.0.0");

        let mut filler = handle("feed00017e57", "filler");
        ctx.add_container(&mut filler, &AddContainerOptions::new("tiny"))
            .expect("add should succeed");
        ctx.bind_container(&mut filler).expect("bind should succeed");

        let mut h = handle("cafe00017e57", "web");
        ctx.add_container(&mut h, &AddContainerOptions::new("wide"))
            .expect("add should succeed");
        ctx.add_container(&mut h, &AddContainerOptions::new("tiny"))
            .expect("add should succeed");
        let err = ctx
            .bind_container(&mut h)
            .expect_err("exhausted pool must fail the bind");
        assert!(matches!(err, CoreError::InfrastructureFault(_)), "got {err:?}");
        assert!(
            h.exec_config.networks.values().all(|e| e.assigned.is_none()),
            "partial assignments rolled back"
        );

        // The wide reservation was released, so the next bind gets the
        // same address again.
        let mut other = handle("beef00017e57", "db");
        ctx.add_container(&mut other, &AddContainerOptions::new("wide"))
            .expect("add should succeed");
        let infos = ctx.bind_container(&mut other).expect("bind should succeed");
        assert_eq!(infos[0].ip, Some(addr("172.21.0.2")));
    }

    #[test]
    fn unbind_releases_the_address_for_reuse() {
        let ctx = context();
        bridge_scope(&ctx, "s1", "172.20.0.0/16", "0.0.0.0");
        let mut h = handle("cafe00017e57", "web");
        ctx.add_container(&mut h, &AddContainerOptions::new("s1"))
            .expect("add should succeed");
        ctx.bind_container(&mut h).expect("bind should succeed");
        ctx.unbind_container(&mut h).expect("unbind should succeed");
        assert!(h.exec_config.networks["s1"].assigned.is_none());

        let mut other = handle("beef00017e57", "db");
        ctx.add_container(&mut other, &AddContainerOptions::new("s1"))
            .expect("add should succeed");
        let infos = ctx.bind_container(&mut other).expect("bind should succeed");
        assert_eq!(infos[0].ip, Some(addr("172.20.0.2")), "released address reused");
    }

    #[test]
    fn bound_container_resolves_by_id_name_and_alias() {
        let ctx = context();
        let mut h = handle("cafe00017e57beef", "web");
        let mut opts = AddContainerOptions::new("bridge");
        opts.aliases = vec!["www".into()];
        ctx.add_container(&mut h, &opts).expect("add should succeed");
        ctx.bind_container(&mut h).expect("bind should succeed");

        let id = ContainerId::new("cafe00017e57beef");
        assert_eq!(ctx.resolve("cafe00017e57beef"), Some(id.clone()));
        assert_eq!(ctx.resolve("cafe00017e57"), Some(id.clone()), "short id");
        assert_eq!(ctx.resolve("web"), Some(id.clone()));
        assert_eq!(ctx.resolve("www"), Some(id), "self alias");
        assert_eq!(ctx.resolve("nope"), None);

        ctx.unbind_container(&mut h).expect("unbind should succeed");
        assert_eq!(ctx.resolve("web"), None, "names removed on unbind");
    }

    #[test]
    fn bridge_endpoints_share_a_nic_slot() {
        let ctx = context();
        ctx.new_scope(NewScopeConfig::bridge("apps"))
            .expect("scope should be created");
        let mut h = handle("cafe00017e57", "web");
        ctx.add_container(&mut h, &AddContainerOptions::new("bridge"))
            .expect("add should succeed");
        ctx.add_container(&mut h, &AddContainerOptions::new("apps"))
            .expect("add should succeed");
        assert_eq!(h.exec_config.networks["bridge"].common.id, "0");
        assert_eq!(
            h.exec_config.networks["apps"].common.id, "0",
            "second bridge endpoint reuses the slot"
        );
        assert_eq!(h.device_changes.len(), 1, "one NIC serves both scopes");
    }

    #[test]
    fn dynamic_scope_absorbs_guest_addressing() {
        let mut config = CoreConfig::default();
        config.container_networks.insert(
            "uplink".into(),
            ContainerNetwork {
                common: Common {
                    id: String::new(),
                    name: "VM Network".into(),
                    notes: String::new(),
                },
                ..ContainerNetwork::default()
            },
        );
        let ctx = NetworkContext::new(&config).expect("context should build");

        let mut h = handle("cafe00017e57", "web");
        ctx.add_container(&mut h, &AddContainerOptions::new("uplink"))
            .expect("add should succeed");
        let infos = ctx.bind_container(&mut h).expect("bind should succeed");
        assert_eq!(infos[0].ip, None, "dynamic scope assigns nothing");

        let endpoint = h
            .exec_config
            .networks
            .get_mut("uplink")
            .expect("endpoint present");
        endpoint.network.subnet = Some(net("10.0.0.0/24"));
        endpoint.network.gateway = Some(addr("10.0.0.1"));
        ctx.update_container(&h);

        let scopes = ctx.scopes(Some(&["uplink".to_owned()]));
        assert_eq!(scopes[0].subnet, "10.0.0.0/24");
        assert_eq!(scopes[0].gateway, "10.0.0.1");
    }
}
