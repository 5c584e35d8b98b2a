use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of random bytes backing a handle key.
const HANDLE_KEY_LEN: usize = 16;

/// Length of the docker-style truncated container ID.
const SHORT_ID_LEN: usize = 12;

/// Identifier of a container managed by this layer.
///
/// Caller-supplied and opaque; by convention a UUID-like hex string. The
/// truncated form is the docker-style 12-character prefix used in name
/// resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ContainerId(pub String);

impl ContainerId {
    /// Creates a `ContainerId` from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the full identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the docker-style truncated prefix.
    ///
    /// IDs are opaque strings, so the cut lands on a char boundary rather
    /// than a fixed byte offset.
    #[must_use]
    pub fn truncated(&self) -> &str {
        match self.0.char_indices().nth(SHORT_ID_LEN) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ContainerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque reference to the VM backing a container.
///
/// Issued by the infrastructure driver; the cache indexes containers under
/// both their [`ContainerId`] and their `VmRef`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VmRef(pub String);

impl VmRef {
    /// Creates a `VmRef` from any string-like value.
    pub fn new(r: impl Into<String>) -> Self {
        Self(r.into())
    }

    /// Returns the reference string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VmRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque key identifying a mutation handle.
///
/// 128 bits of entropy, hex encoded. Handle keys are the only capability a
/// caller holds on a pending mutation; they are never derived from container
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct HandleKey(pub String);

impl HandleKey {
    /// Generates a new random handle key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; HANDLE_KEY_LEN];
        rand::Rng::fill(&mut rand::rng(), &mut bytes[..]);
        Self(hex::encode(bytes))
    }

    /// Returns the hex-encoded key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for HandleKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}
