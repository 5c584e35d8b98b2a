//! IPv4 subnet and range primitives.
//!
//! The network context reasons about subnets as `(address, prefix)` pairs and
//! about IPAM pools as inclusive `[first, last]` ranges. Both are thin
//! wrappers over `u32` arithmetic on [`std::net::Ipv4Addr`].

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// An IPv4 subnet in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Net {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Net {
    /// Creates a subnet, normalizing the address to its network address.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidArgument`] if the prefix exceeds 32.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, CoreError> {
        if prefix > 32 {
            return Err(CoreError::InvalidArgument(format!(
                "invalid prefix length /{prefix}"
            )));
        }
        let mask = Self::mask_bits(prefix);
        Ok(Self {
            addr: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    fn mask_bits(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }

    /// Returns the network address.
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        self.addr
    }

    /// Returns the prefix length.
    #[must_use]
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Returns the highest address in the subnet (the broadcast address).
    #[must_use]
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !Self::mask_bits(self.prefix))
    }

    /// Returns `true` if `ip` falls within this subnet.
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask_bits(self.prefix) == u32::from(self.addr)
    }

    /// Returns `true` if the two subnets share any address.
    #[must_use]
    pub fn overlaps(&self, other: &Ipv4Net) -> bool {
        self.contains(other.network())
            || self.contains(other.broadcast())
            || other.contains(self.network())
    }

    /// Returns `true` if this is the unspecified `0.0.0.0/0` subnet.
    #[must_use]
    pub fn is_unspecified(&self) -> bool {
        self.prefix == 0 || self.addr.is_unspecified()
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Ipv4Net {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| CoreError::InvalidArgument(format!("not a CIDR: {s}")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| CoreError::InvalidArgument(format!("invalid address in {s}")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| CoreError::InvalidArgument(format!("invalid prefix in {s}")))?;
        Self::new(addr, prefix)
    }
}

impl Serialize for Ipv4Net {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Net {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An inclusive IPv4 address range, e.g. `172.16.0.10-172.16.0.20`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Range {
    pub first: Ipv4Addr,
    pub last: Ipv4Addr,
}

impl Ipv4Range {
    /// Creates a range.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidArgument`] if `first > last`.
    pub fn new(first: Ipv4Addr, last: Ipv4Addr) -> Result<Self, CoreError> {
        if u32::from(first) > u32::from(last) {
            return Err(CoreError::InvalidArgument(format!(
                "range first {first} exceeds last {last}"
            )));
        }
        Ok(Self { first, last })
    }

    /// Returns the number of addresses in the range.
    #[must_use]
    pub fn len(&self) -> u64 {
        u64::from(u32::from(self.last)) - u64::from(u32::from(self.first)) + 1
    }

    /// Always at least one address.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns `true` if `ip` falls within the range.
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(self.first)..=u32::from(self.last)).contains(&u32::from(ip))
    }
}

impl From<Ipv4Net> for Ipv4Range {
    fn from(net: Ipv4Net) -> Self {
        Self {
            first: net.network(),
            last: net.broadcast(),
        }
    }
}

impl fmt::Display for Ipv4Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

impl Serialize for Ipv4Range {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ipv4Range {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl FromStr for Ipv4Range {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (first, last) = s
            .split_once('-')
            .ok_or_else(|| CoreError::InvalidArgument(format!("not a range: {s}")))?;
        let first: Ipv4Addr = first
            .trim()
            .parse()
            .map_err(|_| CoreError::InvalidArgument(format!("invalid first address in {s}")))?;
        let last: Ipv4Addr = last
            .trim()
            .parse()
            .map_err(|_| CoreError::InvalidArgument(format!("invalid last address in {s}")))?;
        Self::new(first, last)
    }
}

/// Parses a pool spec, which is either a CIDR subnet or an explicit range.
///
/// # Errors
/// Returns [`CoreError::InvalidArgument`] if the spec parses as neither.
pub fn parse_pool(spec: &str) -> Result<Ipv4Range, CoreError> {
    if let Ok(net) = spec.parse::<Ipv4Net>() {
        return Ok(net.into());
    }
    spec.parse::<Ipv4Range>()
        .map_err(|_| CoreError::InvalidArgument(format!("bad pool spec: {spec}")))
}
