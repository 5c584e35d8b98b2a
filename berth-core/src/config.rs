//! Decoded container configuration and process-scoped settings.
//!
//! [`ExecConfig`] is the authoritative per-container record. It is encoded
//! into the VM's extra-configuration keys on commit and decoded back on
//! refresh, so its maps use [`IndexMap`] to keep deterministic ordering
//! across the round trip.

use std::net::Ipv4Addr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ipv4::{Ipv4Net, Ipv4Range};

/// Identity fields shared by containers, sessions, and endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Common {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub notes: String,
}

/// The command a session runs inside the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCmd {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub dir: String,
}

/// A single process the guest supervises: the main process, or a task
/// added to a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub common: Common,
    pub cmd: SessionCmd,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub attach: bool,
    #[serde(default)]
    pub run_block: bool,
    #[serde(default)]
    pub stop_signal: String,
    /// Marker written by the guest once the process launched, or the
    /// launch error message. Empty until then.
    #[serde(default)]
    pub started: String,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub stop_time: i64,
    #[serde(default)]
    pub exit_status: i32,
}

impl SessionConfig {
    /// Resets launch bookkeeping before a (re)start is committed.
    pub fn clear_run_state(&mut self, start_time: i64) {
        self.started.clear();
        self.start_time = start_time;
        self.exit_status = 0;
    }
}

/// Transport protocol for a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

impl std::str::FromStr for Protocol {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(crate::error::CoreError::InvalidArgument(format!(
                "unknown protocol {other}"
            ))),
        }
    }
}

/// A port the container exposes on its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortBinding {
    pub port: u16,
    pub proto: Protocol,
}

impl std::fmt::Display for PortBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.port, self.proto)
    }
}

impl std::str::FromStr for PortBinding {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, proto) = s
            .split_once('/')
            .ok_or_else(|| crate::error::CoreError::InvalidArgument(format!("bad port spec {s}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| crate::error::CoreError::InvalidArgument(format!("bad port in {s}")))?;
        Ok(Self {
            port,
            proto: proto.parse()?,
        })
    }
}

/// Scope-level network settings carried on each endpoint so the guest can
/// configure its interface without calling back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerNetwork {
    pub common: Common,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub subnet: Option<Ipv4Net>,
    #[serde(default)]
    pub nameservers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub pools: Vec<Ipv4Range>,
    /// Subnets reachable through this network's gateway.
    #[serde(default)]
    pub destinations: Vec<Ipv4Net>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// A container's attachment to one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    /// `common.id` carries the PCI slot of the backing NIC once assigned.
    pub common: Common,
    pub network: ContainerNetwork,
    /// IP requested by the caller at attach time, if any.
    #[serde(default)]
    pub static_ip: Option<Ipv4Addr>,
    /// IP actually bound, written back by the network context.
    #[serde(default)]
    pub assigned: Option<Ipv4Addr>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
}

impl NetworkEndpoint {
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.static_ip.is_some()
    }
}

/// Per-container diagnostic settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    #[serde(default)]
    pub debug_level: i32,
    /// Times the container has been repaired after an infrastructure fault.
    #[serde(default)]
    pub resurrections: u32,
}

/// The full decoded configuration of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    pub common: Common,
    /// Data migration version this record was last written at.
    #[serde(default)]
    pub version: i32,
    /// Primary sessions, keyed by session id.
    #[serde(default)]
    pub sessions: IndexMap<String, SessionConfig>,
    /// One-shot tasks added after creation, keyed by task id.
    #[serde(default)]
    pub execs: IndexMap<String, SessionConfig>,
    /// Network endpoints keyed by scope name.
    #[serde(default)]
    pub networks: IndexMap<String, NetworkEndpoint>,
    /// Volume mounts, label to datastore URI.
    #[serde(default)]
    pub mounts: IndexMap<String, String>,
    #[serde(default)]
    pub annotations: IndexMap<String, String>,
    #[serde(default)]
    pub diagnostics: Diagnostics,
}

impl ExecConfig {
    /// Creates a configuration with only identity filled in.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            common: Common {
                id: id.into(),
                name: name.into(),
                notes: String::new(),
            },
            ..Self::default()
        }
    }

    /// Returns the session or task with the given id, if present.
    #[must_use]
    pub fn session(&self, id: &str) -> Option<&SessionConfig> {
        self.sessions.get(id).or_else(|| self.execs.get(id))
    }

    /// Mutable variant of [`ExecConfig::session`].
    pub fn session_mut(&mut self, id: &str) -> Option<&mut SessionConfig> {
        if self.sessions.contains_key(id) {
            self.sessions.get_mut(id)
        } else {
            self.execs.get_mut(id)
        }
    }
}

/// Process-scoped configuration for the port layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Image store URIs. Only the first is used; extras are logged and
    /// ignored.
    #[serde(default)]
    pub image_stores: Vec<String>,
    /// Volume store name to backing URI (`nfs://` or `ds://`).
    #[serde(default)]
    pub volume_stores: IndexMap<String, String>,
    /// Name of the hypervisor network backing the bridge.
    pub bridge_network: String,
    /// Address pool bridge scopes are carved from.
    #[serde(default = "CoreConfig::default_bridge_pool")]
    pub bridge_pool: Ipv4Net,
    /// Prefix length of each bridge scope carved from the pool.
    #[serde(default = "CoreConfig::default_scope_prefix")]
    pub bridge_scope_prefix: u8,
    /// Pre-declared external networks, keyed by name.
    #[serde(default)]
    pub container_networks: IndexMap<String, ContainerNetwork>,
    /// Datastore path of the guest bootstrap image.
    pub bootstrap_image_path: String,
    #[serde(default)]
    pub resource_pool_path: String,
    #[serde(default)]
    pub datacenter: String,
    #[serde(default)]
    pub cluster: String,
    pub datastore: String,
    #[serde(default)]
    pub host: String,
    /// Datastore is vSAN backed, which changes VM file naming.
    #[serde(default)]
    pub vsan: bool,
    #[serde(default)]
    pub sdk_endpoint: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub keepalive_secs: u64,
    #[serde(default)]
    pub user_agent_suffix: String,
    /// 0 is quiet, >0 verbose, >2 full structure dumps.
    #[serde(default)]
    pub debug_level: i32,
}

impl CoreConfig {
    fn default_bridge_pool() -> Ipv4Net {
        // 172.16.0.0/12
        Ipv4Net::new(Ipv4Addr::new(172, 16, 0, 0), 12).unwrap_or_else(|_| unreachable!())
    }

    fn default_scope_prefix() -> u8 {
        16
    }

    /// Returns the image store actually in use, logging any extras.
    #[must_use]
    pub fn primary_image_store(&self) -> Option<&str> {
        if self.image_stores.len() > 1 {
            tracing::info!(
                extra = self.image_stores.len() - 1,
                "multiple image stores configured, using only the first"
            );
        }
        self.image_stores.first().map(String::as_str)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            image_stores: Vec::new(),
            volume_stores: IndexMap::new(),
            bridge_network: "bridge".into(),
            bridge_pool: Self::default_bridge_pool(),
            bridge_scope_prefix: Self::default_scope_prefix(),
            container_networks: IndexMap::new(),
            bootstrap_image_path: String::new(),
            resource_pool_path: String::new(),
            datacenter: String::new(),
            cluster: String::new(),
            datastore: "datastore1".into(),
            host: String::new(),
            vsan: false,
            sdk_endpoint: String::new(),
            insecure: false,
            keepalive_secs: 0,
            user_agent_suffix: String::new(),
            debug_level: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bridge_pool_is_rfc1918_slash_12() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.bridge_pool.to_string(), "172.16.0.0/12");
        assert_eq!(cfg.bridge_scope_prefix, 16);
    }

    #[test]
    fn session_lookup_covers_tasks() {
        let mut cfg = ExecConfig::new("abc", "web");
        cfg.sessions.insert("abc".into(), SessionConfig::default());
        cfg.execs.insert("task1".into(), SessionConfig::default());
        assert!(cfg.session("abc").is_some());
        assert!(cfg.session("task1").is_some());
        assert!(cfg.session("nope").is_none());
    }

    #[test]
    fn clear_run_state_resets_markers() {
        let mut s = SessionConfig {
            started: "true".into(),
            exit_status: 137,
            ..SessionConfig::default()
        };
        s.clear_run_state(42);
        assert!(s.started.is_empty());
        assert_eq!(s.start_time, 42);
        assert_eq!(s.exit_status, 0);
    }

    #[test]
    fn exec_config_json_round_trip() {
        let mut cfg = ExecConfig::new("deadbeef", "web");
        cfg.networks.insert(
            "bridge".into(),
            NetworkEndpoint {
                static_ip: Some(Ipv4Addr::new(172, 16, 0, 5)),
                ports: vec![PortBinding {
                    port: 8080,
                    proto: Protocol::Tcp,
                }],
                ..NetworkEndpoint::default()
            },
        );
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: ExecConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, back);
    }
}
