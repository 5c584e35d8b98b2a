//! Key construction for the flat extra-configuration map.
//!
//! Every persisted field lives under a compound string key. The key shape
//! encodes its visibility scope:
//!
//! * hidden fields use the bare key, invisible to the guest and writable
//!   only while the VM is powered off;
//! * read-only fields are published to the guest under
//!   `guestinfo.vice./...` with `/`-joined components;
//! * read-write fields use `guestinfo.vice..` with `.`-joined components
//!   so the guest can report values back while powered on.
//!
//! Map entries append `|<mapkey>` to the parent key regardless of scope.

/// Guest-visible key namespace.
pub const GUESTINFO_PREFIX: &str = "guestinfo.vice.";

/// Placeholder for an empty string value. The hypervisor drops keys with
/// empty values, so emptiness must be encoded explicitly to round-trip.
pub const NIL_VALUE: &str = "<nil>";

/// Migration version key for container-scoped records.
pub const CONTAINER_VERSION_KEY: &str = "guestinfo.vice./version/PluginVersion";

/// Migration version key for appliance-scoped records.
pub const APPLIANCE_VERSION_KEY: &str = "guestinfo.vice./init/version/PluginVersion";

/// Visibility scope of a persisted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Bare key, not published to the guest.
    Hidden,
    /// Guest may read but not write.
    ReadOnly,
    /// Guest may read and write; writable while powered on.
    ReadWrite,
}

impl Scope {
    /// Separator used when descending into a nested field.
    #[must_use]
    pub fn separator(self) -> char {
        match self {
            Scope::ReadOnly => '/',
            Scope::Hidden | Scope::ReadWrite => '.',
        }
    }

    /// Returns the root key for a top-level field in this scope.
    #[must_use]
    pub fn root(self, field: &str) -> String {
        match self {
            Scope::Hidden => field.to_owned(),
            Scope::ReadOnly => format!("{GUESTINFO_PREFIX}/{field}"),
            Scope::ReadWrite => format!("{GUESTINFO_PREFIX}.{field}"),
        }
    }

    /// Appends a nested field component to `key`.
    #[must_use]
    pub fn child(self, key: &str, field: &str) -> String {
        format!("{key}{}{field}", self.separator())
    }

    /// Keys in this scope may be rewritten while the VM is powered on.
    #[must_use]
    pub fn is_volatile(self) -> bool {
        matches!(self, Scope::Hidden | Scope::ReadWrite)
    }
}

/// Appends a map-entry component to `key`.
#[must_use]
pub fn map_entry(key: &str, map_key: &str) -> String {
    format!("{key}|{map_key}")
}

/// Key holding the flattened form of a primitive slice.
#[must_use]
pub fn slice_values(key: &str) -> String {
    format!("{key}~")
}

/// Encodes a value, substituting the nil placeholder for emptiness.
#[must_use]
pub fn encode_value(v: &str) -> String {
    if v.is_empty() {
        NIL_VALUE.to_owned()
    } else {
        v.to_owned()
    }
}

/// Decodes a value, mapping the nil placeholder back to empty.
#[must_use]
pub fn decode_value(v: &str) -> String {
    if v == NIL_VALUE {
        String::new()
    } else {
        v.to_owned()
    }
}

/// Key the guest writes a session's launch marker to. Start waits on this.
#[must_use]
pub fn session_started_key(session_id: &str) -> String {
    let sessions = Scope::ReadWrite.root("sessions");
    Scope::ReadWrite.child(&map_entry(&sessions, session_id), "started")
}
