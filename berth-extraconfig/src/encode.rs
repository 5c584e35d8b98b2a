//! Encoding of [`ExecConfig`] into the flat extra-configuration map.

use std::collections::BTreeMap;
use std::fmt::Display;

use berth_core::{ExecConfig, NetworkEndpoint, SessionConfig};

use crate::keys::{self, Scope, CONTAINER_VERSION_KEY};

/// Which subset of keys to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeScope {
    /// Every key. Valid only when the VM is powered off or being stopped.
    Full,
    /// Only keys that may be rewritten while the VM is powered on: the
    /// hidden and read-write scopes.
    Volatile,
}

struct Encoder {
    out: BTreeMap<String, String>,
    only_volatile: bool,
}

impl Encoder {
    fn put(&mut self, scope: Scope, key: String, value: &str) {
        if self.only_volatile && !scope.is_volatile() {
            return;
        }
        self.out.insert(key, keys::encode_value(value));
    }

    fn put_display(&mut self, scope: Scope, key: String, value: &impl Display) {
        self.put(scope, key, &value.to_string());
    }

    /// Primitive slice: joined values at `<key>~`, length at `<key>`.
    fn put_slice(&mut self, scope: Scope, key: &str, values: &[String]) {
        if values.is_empty() {
            return;
        }
        self.put(scope, key.to_owned(), &values.len().to_string());
        self.put(scope, keys::slice_values(key), &values.join("|"));
    }

    /// String map: values at `<key>|<mapkey>`, sorted key index at `<key>`.
    fn put_string_map<'a, I>(&mut self, scope: Scope, key: &str, entries: I)
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut sorted: Vec<(&String, &String)> = entries.into_iter().collect();
        if sorted.is_empty() {
            return;
        }
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        let index: Vec<&str> = sorted.iter().map(|(k, _)| k.as_str()).collect();
        self.put(scope, key.to_owned(), &index.join("|"));
        for (k, v) in sorted {
            self.put(scope, keys::map_entry(key, k), v);
        }
    }

    fn put_session(&mut self, entry: &str, session: &SessionConfig) {
        let s = Scope::ReadWrite;
        self.put(s, s.child(entry, "id"), &session.common.id);
        self.put(s, s.child(entry, "name"), &session.common.name);
        self.put(s, s.child(entry, "path"), &session.cmd.path);
        self.put_slice(s, &s.child(entry, "args"), &session.cmd.args);
        self.put_slice(s, &s.child(entry, "env"), &session.cmd.env);
        self.put(s, s.child(entry, "dir"), &session.cmd.dir);
        self.put_display(s, s.child(entry, "tty"), &session.tty);
        self.put_display(s, s.child(entry, "attach"), &session.attach);
        self.put_display(s, s.child(entry, "runblock"), &session.run_block);
        self.put(s, s.child(entry, "stopSignal"), &session.stop_signal);
        self.put(s, s.child(entry, "started"), &session.started);
        self.put_display(s, s.child(entry, "startTime"), &session.start_time);
        self.put_display(s, s.child(entry, "stopTime"), &session.stop_time);
        self.put_display(s, s.child(entry, "exitStatus"), &session.exit_status);
    }

    fn put_sessions(
        &mut self,
        root_field: &str,
        sessions: &indexmap::IndexMap<String, SessionConfig>,
    ) {
        if sessions.is_empty() {
            return;
        }
        let s = Scope::ReadWrite;
        let root = s.root(root_field);
        let mut ids: Vec<&str> = sessions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        self.put(s, root.clone(), &ids.join("|"));
        for id in ids {
            if let Some(session) = sessions.get(id) {
                self.put_session(&keys::map_entry(&root, id), session);
            }
        }
    }

    fn put_endpoint(&mut self, entry: &str, scope_name: &str, endpoint: &NetworkEndpoint) {
        let s = Scope::ReadOnly;
        self.put(s, s.child(entry, "id"), &endpoint.common.id);
        self.put(s, s.child(entry, "name"), &endpoint.common.name);
        if let Some(gw) = endpoint.network.gateway {
            self.put_display(s, s.child(entry, "gateway"), &gw);
        }
        if let Some(subnet) = endpoint.network.subnet {
            self.put_display(s, s.child(entry, "subnet"), &subnet);
        }
        self.put_slice(
            s,
            &s.child(entry, "nameservers"),
            &endpoint
                .network
                .nameservers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
        );
        self.put_slice(
            s,
            &s.child(entry, "pools"),
            &endpoint
                .network
                .pools
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
        );
        self.put_slice(
            s,
            &s.child(entry, "destinations"),
            &endpoint
                .network
                .destinations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
        );
        self.put_slice(s, &s.child(entry, "aliases"), &endpoint.network.aliases);
        if let Some(ip) = endpoint.static_ip {
            self.put_display(s, s.child(entry, "static"), &ip);
        }
        self.put_slice(
            s,
            &s.child(entry, "ports"),
            &endpoint.ports.iter().map(ToString::to_string).collect::<Vec<_>>(),
        );
        // Written back by the guest and the network context at runtime.
        if let Some(ip) = endpoint.assigned {
            let rw = Scope::ReadWrite;
            let networks = rw.root("networks");
            self.put_display(
                rw,
                rw.child(&keys::map_entry(&networks, scope_name), "assigned"),
                &ip,
            );
        }
    }
}

/// Encodes `config` into flat key/value pairs.
#[must_use]
pub fn encode(config: &ExecConfig, scope: EncodeScope) -> BTreeMap<String, String> {
    let mut enc = Encoder {
        out: BTreeMap::new(),
        only_volatile: scope == EncodeScope::Volatile,
    };

    let ro = Scope::ReadOnly;
    let common = ro.root("common");
    enc.put(ro, ro.child(&common, "id"), &config.common.id);
    enc.put(ro, ro.child(&common, "name"), &config.common.name);
    enc.put(ro, ro.child(&common, "notes"), &config.common.notes);
    enc.put(ro, CONTAINER_VERSION_KEY.to_owned(), &config.version.to_string());

    enc.put_sessions("sessions", &config.sessions);
    enc.put_sessions("execs", &config.execs);

    if !config.networks.is_empty() {
        let root = ro.root("networks");
        let mut names: Vec<&str> = config.networks.keys().map(String::as_str).collect();
        names.sort_unstable();
        enc.put(ro, root.clone(), &names.join("|"));
        for name in names {
            if let Some(endpoint) = config.networks.get(name) {
                enc.put_endpoint(&keys::map_entry(&root, name), name, endpoint);
            }
        }
    }

    let hidden = Scope::Hidden;
    enc.put_string_map(hidden, &hidden.root("mounts"), &config.mounts);
    enc.put_string_map(hidden, &hidden.root("annotations"), &config.annotations);
    let diag = hidden.root("diagnostics");
    enc.put_display(
        hidden,
        hidden.child(&diag, "debug"),
        &config.diagnostics.debug_level,
    );
    enc.put_display(
        hidden,
        hidden.child(&diag, "resurrections"),
        &config.diagnostics.resurrections,
    );

    enc.out
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{PortBinding, Protocol, SessionCmd};

    fn sample_config() -> ExecConfig {
        let mut cfg = ExecConfig::new("deadbeefcafe", "web");
        cfg.sessions.insert(
            "deadbeefcafe".into(),
            SessionConfig {
                cmd: SessionCmd {
                    path: "/bin/server".into(),
                    args: vec!["--port".into(), "8080".into()],
                    env: vec!["PATH=/bin".into()],
                    dir: "/".into(),
                },
                tty: true,
                ..SessionConfig::default()
            },
        );
        cfg.mounts.insert("data".into(), "ds://vol/data".into());
        cfg
    }

    #[test]
    fn identity_keys_are_read_only_scoped() {
        let map = encode(&sample_config(), EncodeScope::Full);
        assert_eq!(map.get("guestinfo.vice./common/id").map(String::as_str), Some("deadbeefcafe"));
        assert_eq!(map.get("guestinfo.vice./common/name").map(String::as_str), Some("web"));
        assert_eq!(map.get("guestinfo.vice./common/notes").map(String::as_str), Some("<nil>"));
    }

    #[test]
    fn session_slice_emits_length_and_joined_values() {
        let map = encode(&sample_config(), EncodeScope::Full);
        assert_eq!(
            map.get("guestinfo.vice..sessions|deadbeefcafe.args").map(String::as_str),
            Some("2")
        );
        assert_eq!(
            map.get("guestinfo.vice..sessions|deadbeefcafe.args~").map(String::as_str),
            Some("--port|8080")
        );
    }

    #[test]
    fn hidden_maps_carry_sorted_index() {
        let mut cfg = sample_config();
        cfg.mounts.insert("aaa".into(), "nfs://x".into());
        let map = encode(&cfg, EncodeScope::Full);
        assert_eq!(map.get("mounts").map(String::as_str), Some("aaa|data"));
        assert_eq!(map.get("mounts|aaa").map(String::as_str), Some("nfs://x"));
    }

    #[test]
    fn volatile_scope_drops_read_only_keys() {
        let map = encode(&sample_config(), EncodeScope::Volatile);
        assert!(!map.contains_key("guestinfo.vice./common/id"));
        assert!(map.contains_key("guestinfo.vice..sessions|deadbeefcafe.path"));
        assert!(map.contains_key("mounts|data"));
    }

    #[test]
    fn ports_encode_as_port_slash_proto() {
        let mut cfg = sample_config();
        cfg.networks.insert(
            "bridge".into(),
            berth_core::NetworkEndpoint {
                ports: vec![PortBinding {
                    port: 8080,
                    proto: Protocol::Tcp,
                }],
                ..berth_core::NetworkEndpoint::default()
            },
        );
        let map = encode(&cfg, EncodeScope::Full);
        assert_eq!(
            map.get("guestinfo.vice./networks|bridge/ports~").map(String::as_str),
            Some("8080/tcp")
        );
    }
}
