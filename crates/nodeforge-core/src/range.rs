//! Address ranges the allocator draws from.

use std::net::Ipv4Addr;

use nodeforge_state::AddressRole;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// A contiguous, inclusive IPv4 range inside one provider subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub role: AddressRole,
    /// Provider subnet ID the addresses are reserved in.
    pub subnet: String,
    pub first: Ipv4Addr,
    pub last: Ipv4Addr,
    #[serde(default = "default_prefix")]
    pub prefix: u8,
    pub gateway: Option<Ipv4Addr>,
}

fn default_prefix() -> u8 {
    24
}

impl AddressRange {
    /// Number of addresses in the range.
    pub fn size(&self) -> u64 {
        let (first, last) = (u32::from(self.first), u32::from(self.last));
        if last < first {
            0
        } else {
            u64::from(last - first) + 1
        }
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        (u32::from(self.first)..=u32::from(self.last)).contains(&u32::from(address))
    }

    /// Every address, lowest first. The gateway is skipped.
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (u32::from(self.first)..=u32::from(self.last))
            .map(Ipv4Addr::from)
            .filter(move |a| Some(*a) != self.gateway)
    }

    /// Dotted netmask for the configured prefix.
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = u32::MAX
            .checked_shl(32 - u32::from(self.prefix.min(32)))
            .unwrap_or(0);
        Ipv4Addr::from(bits)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |reason: &str| ConfigError::InvalidRange {
            role: self.role.to_string(),
            reason: reason.to_string(),
        };
        if self.subnet.trim().is_empty() {
            return Err(invalid("subnet is empty"));
        }
        if u32::from(self.first) > u32::from(self.last) {
            return Err(invalid("first address is after last address"));
        }
        if self.prefix == 0 || self.prefix > 32 {
            return Err(invalid("prefix must be between 1 and 32"));
        }
        let mask = u32::from(self.netmask());
        if u32::from(self.first) & mask != u32::from(self.last) & mask {
            return Err(invalid("range crosses the subnet boundary"));
        }
        Ok(())
    }
}
