//! Decoding of the flat extra-configuration map back into [`ExecConfig`].
//!
//! Decoding is tolerant of missing keys (fields fall back to defaults) but
//! strict about malformed values: a key that is present with an
//! unparseable value fails the whole decode, since a half-read record is
//! worse than an error.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::str::FromStr;

use berth_core::{
    Common, ContainerNetwork, CoreError, ExecConfig, NetworkEndpoint, SessionCmd, SessionConfig,
};

use crate::keys::{self, Scope, CONTAINER_VERSION_KEY};

struct Decoder<'a> {
    map: &'a BTreeMap<String, String>,
}

impl Decoder<'_> {
    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| keys::decode_value(v))
    }

    fn get_or_default(&self, key: &str) -> String {
        self.get(key).unwrap_or_default()
    }

    fn parse<T>(&self, key: &str) -> Result<T, CoreError>
    where
        T: FromStr + Default,
        T::Err: Debug,
    {
        match self.get(key) {
            None => Ok(T::default()),
            Some(v) if v.is_empty() => Ok(T::default()),
            Some(v) => v
                .parse()
                .map_err(|e| CoreError::DataDecode(format!("key {key}: {e:?}"))),
        }
    }

    fn parse_opt<T>(&self, key: &str) -> Result<Option<T>, CoreError>
    where
        T: FromStr,
        T::Err: Debug,
    {
        match self.get(key) {
            None => Ok(None),
            Some(v) if v.is_empty() => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|e| CoreError::DataDecode(format!("key {key}: {e:?}"))),
        }
    }

    /// Reads a primitive slice: length at `key`, `|`-joined values at
    /// `key~`. The lengths must agree.
    fn slice(&self, key: &str) -> Result<Vec<String>, CoreError> {
        let Some(len_raw) = self.get(key) else {
            return Ok(Vec::new());
        };
        let len: usize = len_raw
            .parse()
            .map_err(|_| CoreError::DataDecode(format!("bad slice length at {key}: {len_raw}")))?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let joined = self
            .get(&keys::slice_values(key))
            .ok_or_else(|| CoreError::DataDecode(format!("missing slice values at {key}~")))?;
        let values: Vec<String> = joined.split('|').map(str::to_owned).collect();
        if values.len() != len {
            return Err(CoreError::DataDecode(format!(
                "slice at {key} declares {len} values but carries {}",
                values.len()
            )));
        }
        Ok(values)
    }

    fn parsed_slice<T>(&self, key: &str) -> Result<Vec<T>, CoreError>
    where
        T: FromStr,
        T::Err: Debug,
    {
        self.slice(key)?
            .iter()
            .map(|v| {
                v.parse()
                    .map_err(|e| CoreError::DataDecode(format!("key {key}: {e:?}")))
            })
            .collect()
    }

    /// Reads the index of a map-valued key: `|`-joined entry names.
    fn map_index(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            None => Vec::new(),
            Some(v) if v.is_empty() => Vec::new(),
            Some(v) => v.split('|').map(str::to_owned).collect(),
        }
    }

    fn string_map(&self, key: &str) -> Result<indexmap::IndexMap<String, String>, CoreError> {
        let mut out = indexmap::IndexMap::new();
        for entry in self.map_index(key) {
            let value = self
                .get(&keys::map_entry(key, &entry))
                .ok_or_else(|| CoreError::DataDecode(format!("missing map value {key}|{entry}")))?;
            out.insert(entry, value);
        }
        Ok(out)
    }

    fn session(&self, entry: &str) -> Result<SessionConfig, CoreError> {
        let s = Scope::ReadWrite;
        Ok(SessionConfig {
            common: Common {
                id: self.get_or_default(&s.child(entry, "id")),
                name: self.get_or_default(&s.child(entry, "name")),
                notes: String::new(),
            },
            cmd: SessionCmd {
                path: self.get_or_default(&s.child(entry, "path")),
                args: self.slice(&s.child(entry, "args"))?,
                env: self.slice(&s.child(entry, "env"))?,
                dir: self.get_or_default(&s.child(entry, "dir")),
            },
            tty: self.parse(&s.child(entry, "tty"))?,
            attach: self.parse(&s.child(entry, "attach"))?,
            run_block: self.parse(&s.child(entry, "runblock"))?,
            stop_signal: self.get_or_default(&s.child(entry, "stopSignal")),
            started: self.get_or_default(&s.child(entry, "started")),
            start_time: self.parse(&s.child(entry, "startTime"))?,
            stop_time: self.parse(&s.child(entry, "stopTime"))?,
            exit_status: self.parse(&s.child(entry, "exitStatus"))?,
        })
    }

    fn sessions(
        &self,
        root_field: &str,
    ) -> Result<indexmap::IndexMap<String, SessionConfig>, CoreError> {
        let root = Scope::ReadWrite.root(root_field);
        let mut out = indexmap::IndexMap::new();
        for id in self.map_index(&root) {
            let session = self.session(&keys::map_entry(&root, &id))?;
            out.insert(id, session);
        }
        Ok(out)
    }

    fn endpoint(&self, entry: &str, scope_name: &str) -> Result<NetworkEndpoint, CoreError> {
        let s = Scope::ReadOnly;
        let rw = Scope::ReadWrite;
        let assigned_key = rw.child(
            &keys::map_entry(&rw.root("networks"), scope_name),
            "assigned",
        );
        Ok(NetworkEndpoint {
            common: Common {
                id: self.get_or_default(&s.child(entry, "id")),
                name: self.get_or_default(&s.child(entry, "name")),
                notes: String::new(),
            },
            network: ContainerNetwork {
                common: Common {
                    id: String::new(),
                    name: scope_name.to_owned(),
                    notes: String::new(),
                },
                gateway: self.parse_opt(&s.child(entry, "gateway"))?,
                subnet: self.parse_opt(&s.child(entry, "subnet"))?,
                nameservers: self.parsed_slice(&s.child(entry, "nameservers"))?,
                pools: self.parsed_slice(&s.child(entry, "pools"))?,
                destinations: self.parsed_slice(&s.child(entry, "destinations"))?,
                aliases: self.slice(&s.child(entry, "aliases"))?,
            },
            static_ip: self.parse_opt(&s.child(entry, "static"))?,
            assigned: self.parse_opt(&assigned_key)?,
            ports: self.parsed_slice(&s.child(entry, "ports"))?,
        })
    }
}

/// Decodes a persisted extra-configuration map.
///
/// # Errors
/// Returns [`CoreError::DataDecode`] when a present key fails to parse or
/// a declared map or slice entry is missing.
pub fn decode(map: &BTreeMap<String, String>) -> Result<ExecConfig, CoreError> {
    let d = Decoder { map };
    let ro = Scope::ReadOnly;
    let hidden = Scope::Hidden;

    let common_root = ro.root("common");
    let common = Common {
        id: d.get_or_default(&ro.child(&common_root, "id")),
        name: d.get_or_default(&ro.child(&common_root, "name")),
        notes: d.get_or_default(&ro.child(&common_root, "notes")),
    };

    let networks_root = ro.root("networks");
    let mut networks = indexmap::IndexMap::new();
    for name in d.map_index(&networks_root) {
        let endpoint = d.endpoint(&keys::map_entry(&networks_root, &name), &name)?;
        networks.insert(name, endpoint);
    }

    let diag = hidden.root("diagnostics");

    Ok(ExecConfig {
        common,
        version: d.parse(CONTAINER_VERSION_KEY)?,
        sessions: d.sessions("sessions")?,
        execs: d.sessions("execs")?,
        networks,
        mounts: d.string_map(&hidden.root("mounts"))?,
        annotations: d.string_map(&hidden.root("annotations"))?,
        diagnostics: berth_core::Diagnostics {
            debug_level: d.parse(&hidden.child(&diag, "debug"))?,
            resurrections: d.parse(&hidden.child(&diag, "resurrections"))?,
        },
    })
}

/// Reads the migration version key without decoding the whole record.
#[must_use]
pub fn data_version(map: &BTreeMap<String, String>) -> i32 {
    map.get(CONTAINER_VERSION_KEY)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
