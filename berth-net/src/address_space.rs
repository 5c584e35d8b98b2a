//! IPv4 address spaces with sub-allocation.
//!
//! An address space tracks free addresses as a sorted list of disjoint
//! inclusive intervals, so reservation and release are O(intervals)
//! rather than O(addresses). Subnet carving for bridge scopes reserves a
//! whole aligned block out of the same structure.

use std::net::Ipv4Addr;

use berth_core::{CoreError, Ipv4Net, Ipv4Range};

/// A one-dimensional IPv4 range handing out single addresses and
/// aligned subnets.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    range: Ipv4Range,
    /// Sorted, disjoint, inclusive free intervals.
    free: Vec<(u32, u32)>,
}

impl AddressSpace {
    /// Space covering `range`, entirely free.
    #[must_use]
    pub fn from_range(range: Ipv4Range) -> Self {
        let first = u32::from(range.first);
        let last = u32::from(range.last);
        Self {
            range,
            free: vec![(first, last)],
        }
    }

    /// Space covering the hosts of `net`. The all-zeros and all-ones
    /// addresses are excluded up front and never handed out.
    ///
    /// # Errors
    /// [`CoreError::InvalidArgument`] when the subnet has no host
    /// addresses.
    pub fn from_net(net: &Ipv4Net) -> Result<Self, CoreError> {
        let first = u32::from(net.network()) + 1;
        let last = u32::from(net.broadcast()).wrapping_sub(1);
        if first > last {
            return Err(CoreError::InvalidArgument(format!(
                "subnet {net} has no usable host addresses"
            )));
        }
        let range = Ipv4Range::new(Ipv4Addr::from(first), Ipv4Addr::from(last))?;
        Ok(Self::from_range(range))
    }

    #[must_use]
    pub fn range(&self) -> &Ipv4Range {
        &self.range
    }

    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.range.contains(ip)
    }

    /// Whether no address in the space is currently reserved.
    #[must_use]
    pub fn is_untouched(&self) -> bool {
        self.free.len() == 1
            && self.free[0] == (u32::from(self.range.first), u32::from(self.range.last))
    }

    /// Reserves a specific address.
    ///
    /// # Errors
    /// [`CoreError::InvalidArgument`] outside the range,
    /// [`CoreError::Duplicate`] when already reserved.
    pub fn reserve_ip(&mut self, ip: Ipv4Addr) -> Result<(), CoreError> {
        if !self.contains(ip) {
            return Err(CoreError::InvalidArgument(format!(
                "{ip} is outside {}",
                self.range
            )));
        }
        let addr = u32::from(ip);
        self.reserve_span(addr, addr).map_err(|_| CoreError::Duplicate {
            kind: "ip",
            id: ip.to_string(),
        })
    }

    /// Reserves the lowest free address.
    ///
    /// # Errors
    /// [`CoreError::InfrastructureFault`] when the space is exhausted.
    pub fn reserve_next_ip(&mut self) -> Result<Ipv4Addr, CoreError> {
        let Some(&(first, last)) = self.free.first() else {
            return Err(CoreError::InfrastructureFault(format!(
                "address space {} exhausted",
                self.range
            )));
        };
        if first == last {
            self.free.remove(0);
        } else {
            self.free[0] = (first + 1, last);
        }
        Ok(Ipv4Addr::from(first))
    }

    /// Returns a reserved address to the space.
    ///
    /// # Errors
    /// [`CoreError::InvalidArgument`] when `ip` is outside the range or
    /// was never reserved here.
    pub fn release_ip(&mut self, ip: Ipv4Addr) -> Result<(), CoreError> {
        if !self.contains(ip) {
            return Err(CoreError::InvalidArgument(format!(
                "{ip} is outside {}",
                self.range
            )));
        }
        let addr = u32::from(ip);
        self.release_span(addr, addr)
            .map_err(|_| CoreError::InvalidArgument(format!("{ip} is not reserved")))
    }

    /// Reserves every address of `net` as one block.
    ///
    /// # Errors
    /// [`CoreError::InvalidArgument`] when the block is outside the
    /// range, [`CoreError::Duplicate`] when any part is taken.
    pub fn reserve_net(&mut self, net: &Ipv4Net) -> Result<(), CoreError> {
        let first = u32::from(net.network());
        let last = u32::from(net.broadcast());
        if !self.contains(net.network()) || !self.contains(net.broadcast()) {
            return Err(CoreError::InvalidArgument(format!(
                "{net} is outside {}",
                self.range
            )));
        }
        self.reserve_span(first, last).map_err(|_| CoreError::Duplicate {
            kind: "subnet",
            id: net.to_string(),
        })
    }

    /// Carves the lowest free aligned `/prefix` block.
    ///
    /// # Errors
    /// [`CoreError::InfrastructureFault`] when no aligned block of that
    /// size is free.
    pub fn reserve_next_net(&mut self, prefix: u8) -> Result<Ipv4Net, CoreError> {
        if prefix == 0 || prefix > 32 {
            return Err(CoreError::InvalidArgument(format!(
                "invalid subnet prefix /{prefix}"
            )));
        }
        let size = 1u64 << (32 - prefix);
        for &(start, end) in &self.free {
            // Align the candidate up to the block boundary.
            let candidate = u64::from(start).div_ceil(size) * size;
            let block_end = candidate + size - 1;
            if block_end <= u64::from(end) {
                #[allow(clippy::cast_possible_truncation)]
                let (first, last) = (candidate as u32, block_end as u32);
                self.reserve_span(first, last)
                    .map_err(|_| CoreError::InfrastructureFault("subnet carve raced".into()))?;
                return Ipv4Net::new(Ipv4Addr::from(first), prefix);
            }
        }
        Err(CoreError::InfrastructureFault(format!(
            "no free /{prefix} subnet in {}",
            self.range
        )))
    }

    /// Returns a carved subnet to the space.
    ///
    /// # Errors
    /// [`CoreError::InvalidArgument`] when the block is outside the
    /// range or was not reserved.
    pub fn release_net(&mut self, net: &Ipv4Net) -> Result<(), CoreError> {
        if !self.contains(net.network()) || !self.contains(net.broadcast()) {
            return Err(CoreError::InvalidArgument(format!(
                "{net} is outside {}",
                self.range
            )));
        }
        self.release_span(u32::from(net.network()), u32::from(net.broadcast()))
            .map_err(|_| CoreError::InvalidArgument(format!("{net} is not reserved")))
    }

    /// Removes `[first, last]` from the free list. Fails without
    /// mutating when any part of the span is not free.
    fn reserve_span(&mut self, first: u32, last: u32) -> Result<(), ()> {
        let idx = self
            .free
            .iter()
            .position(|&(s, e)| first >= s && last <= e)
            .ok_or(())?;
        let (s, e) = self.free[idx];
        self.free.remove(idx);
        let mut insert_at = idx;
        if first > s {
            self.free.insert(insert_at, (s, first - 1));
            insert_at += 1;
        }
        if last < e {
            self.free.insert(insert_at, (last + 1, e));
        }
        Ok(())
    }

    /// Adds `[first, last]` back to the free list, merging neighbors.
    /// Fails when the span overlaps an already-free interval.
    fn release_span(&mut self, first: u32, last: u32) -> Result<(), ()> {
        if self.free.iter().any(|&(s, e)| first <= e && last >= s) {
            return Err(());
        }
        let idx = self
            .free
            .iter()
            .position(|&(s, _)| s > last)
            .unwrap_or(self.free.len());
        self.free.insert(idx, (first, last));
        // Merge with the left and right neighbors where contiguous.
        if idx + 1 < self.free.len() && self.free[idx].1 + 1 == self.free[idx + 1].0 {
            let (_, e) = self.free.remove(idx + 1);
            self.free[idx].1 = e;
        }
        if idx > 0 && self.free[idx - 1].1 + 1 == self.free[idx].0 {
            let (_, e) = self.free.remove(idx);
            self.free[idx - 1].1 = e;
        }
        Ok(())
    }
}
