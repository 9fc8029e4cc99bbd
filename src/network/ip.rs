// Static IP assignment for containers on a test network
// Hands out addresses from one CIDR block, never the same one twice

use crate::errors::{NetError, Result};
use cidr::IpInet;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

fn to_int(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_int(family: Family, value: u128) -> IpAddr {
    match family {
        // Values for V4 never exceed the 32-bit host range computed in `Block::parse`
        Family::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
        Family::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

/// A parsed CIDR block normalized to its network address
#[derive(Debug, Clone, Copy)]
struct Block {
    family: Family,
    network: u128,
    last: u128,
    prefix_len: u8,
}

impl Block {
    fn parse(subnet: &str) -> Result<Self> {
        let inet = IpInet::from_str(subnet.trim())
            .map_err(|e| NetError::InvalidSubnet(format!("{}: {}", subnet, e)))?;
        let address = inet.address();
        let family = Family::of(&address);
        let prefix_len = inet.network_length();

        let host_bits = u32::from(family.bits() - prefix_len);
        let host_mask = if host_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        };
        let network = to_int(address) & !host_mask;

        Ok(Self {
            family,
            network,
            last: network | host_mask,
            prefix_len,
        })
    }

    fn render(&self) -> String {
        format!("{}/{}", from_int(self.family, self.network), self.prefix_len)
    }
}

/// Allocates free addresses from a subnet.
///
/// Not synchronized: every test run owns its own tracker.
#[derive(Debug)]
pub struct FreeIpAddrTracker {
    block: Block,
    subnet: String,
    taken: HashSet<IpAddr>,
}

impl FreeIpAddrTracker {
    /// Create a tracker for `subnet`, treating `already_taken` as unavailable
    /// (e.g. a gateway reserved elsewhere).
    pub fn new(subnet: &str, already_taken: &[IpAddr]) -> Result<Self> {
        let block = Block::parse(subnet)?;
        let rendered = block.render();

        let mut taken = HashSet::new();
        for addr in already_taken {
            if Family::of(addr) != block.family {
                return Err(NetError::UnsupportedAddressFamily {
                    subnet: rendered,
                    addr: *addr,
                });
            }
            taken.insert(*addr);
        }

        Ok(Self {
            block,
            subnet: rendered,
            taken,
        })
    }

    /// The normalized subnet this tracker allocates from
    pub fn subnet(&self) -> &str {
        &self.subnet
    }

    /// Take the lowest free address after the network address, up to and
    /// including the last address of the block.
    pub fn get_free_addr(&mut self) -> Result<IpAddr> {
        let first = match self.block.network.checked_add(1) {
            Some(first) => first,
            None => return Err(NetError::AddressSpaceExhausted(self.subnet.clone())),
        };

        let mut candidate = first;
        while candidate <= self.block.last {
            let addr = from_int(self.block.family, candidate);
            if self.taken.insert(addr) {
                tracing::trace!(%addr, subnet = %self.subnet, "allocated address");
                return Ok(addr);
            }
            candidate = match candidate.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }

        Err(NetError::AddressSpaceExhausted(self.subnet.clone()))
    }

    /// Return an address to the pool. Returns whether it had been taken.
    pub fn release_addr(&mut self, addr: IpAddr) -> bool {
        self.taken.remove(&addr)
    }

    pub fn is_taken(&self, addr: &IpAddr) -> bool {
        self.taken.contains(addr)
    }
}

/// Carve `count` consecutive, disjoint `/prefix_len` subnets out of `pool`.
pub fn split_subnets(pool: &str, prefix_len: u8, count: usize) -> Result<Vec<String>> {
    let block = Block::parse(pool)?;
    if prefix_len < block.prefix_len || prefix_len > block.family.bits() {
        return Err(NetError::InvalidSubnet(format!(
            "cannot split {} into /{} subnets",
            block.render(),
            prefix_len
        )));
    }

    let split_bits = u32::from(prefix_len - block.prefix_len);
    let available = if split_bits >= 64 {
        usize::MAX
    } else {
        usize::try_from(1u128 << split_bits).unwrap_or(usize::MAX)
    };
    if count > available {
        return Err(NetError::AddressSpaceExhausted(format!(
            "{} (need {} /{} subnets, only {} fit)",
            block.render(),
            count,
            prefix_len,
            available
        )));
    }

    let step_bits = u32::from(block.family.bits() - prefix_len);
    let subnets = (0..count as u128)
        .map(|index| {
            // A whole-space split has a single subnet at offset zero
            let offset = index.checked_shl(step_bits).unwrap_or(0);
            let network = block.network + offset;
            format!("{}/{}", from_int(block.family, network), prefix_len)
        })
        .collect();
    Ok(subnets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_never_hands_out_network_address() {
        let mut tracker = FreeIpAddrTracker::new("10.0.0.0/24", &[]).unwrap();
        let first = tracker.get_free_addr().unwrap();
        let second = tracker.get_free_addr().unwrap();

        assert_ne!(first, v4(10, 0, 0, 0));
        assert_ne!(second, v4(10, 0, 0, 0));
        assert_ne!(first, second);
        assert_eq!(first, v4(10, 0, 0, 1));
        assert_eq!(second, v4(10, 0, 0, 2));
    }

    #[test]
    fn test_respects_already_taken_addresses() {
        let mut tracker =
            FreeIpAddrTracker::new("172.23.0.0/16", &[v4(172, 23, 0, 1), v4(172, 23, 0, 3)])
                .unwrap();
        assert_eq!(tracker.get_free_addr().unwrap(), v4(172, 23, 0, 2));
        assert_eq!(tracker.get_free_addr().unwrap(), v4(172, 23, 0, 4));
    }

    #[test]
    fn test_exhaustion_after_every_address_taken() {
        let mut tracker = FreeIpAddrTracker::new("10.0.0.0/24", &[]).unwrap();
        // .1 through .255 (the broadcast address is part of the scan range)
        for _ in 0..255 {
            tracker.get_free_addr().unwrap();
        }
        let err = tracker.get_free_addr().unwrap_err();
        assert!(matches!(err, NetError::AddressSpaceExhausted(_)));
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_released_address_is_reused() {
        let mut tracker = FreeIpAddrTracker::new("10.0.0.0/30", &[]).unwrap();
        let a = tracker.get_free_addr().unwrap();
        let _b = tracker.get_free_addr().unwrap();
        assert!(tracker.release_addr(a));
        assert!(!tracker.release_addr(a));
        assert_eq!(tracker.get_free_addr().unwrap(), a);
    }

    #[test]
    fn test_host_bits_are_normalized() {
        let mut tracker = FreeIpAddrTracker::new("192.168.7.77/24", &[]).unwrap();
        assert_eq!(tracker.subnet(), "192.168.7.0/24");
        assert_eq!(tracker.get_free_addr().unwrap(), v4(192, 168, 7, 1));
    }

    #[test]
    fn test_single_address_block_is_exhausted() {
        let mut tracker = FreeIpAddrTracker::new("10.1.1.1/32", &[]).unwrap();
        assert!(tracker.get_free_addr().is_err());
    }

    #[test]
    fn test_ipv6_allocation() {
        let mut tracker = FreeIpAddrTracker::new("fd00:abcd::/120", &[]).unwrap();
        let first = tracker.get_free_addr().unwrap();
        let second = tracker.get_free_addr().unwrap();
        assert_eq!(first.to_string(), "fd00:abcd::1");
        assert_eq!(second.to_string(), "fd00:abcd::2");
    }

    #[test]
    fn test_rejects_mixed_families_and_garbage() {
        let err = FreeIpAddrTracker::new("fd00::/64", &[v4(10, 0, 0, 1)]).unwrap_err();
        assert!(matches!(err, NetError::UnsupportedAddressFamily { .. }));

        let err = FreeIpAddrTracker::new("not-a-subnet", &[]).unwrap_err();
        assert!(matches!(err, NetError::InvalidSubnet(_)));
    }

    #[test]
    fn test_split_subnets() {
        let subnets = split_subnets("172.23.0.0/16", 24, 3).unwrap();
        assert_eq!(
            subnets,
            vec!["172.23.0.0/24", "172.23.1.0/24", "172.23.2.0/24"]
        );
    }

    #[test]
    fn test_split_subnets_bounds() {
        assert!(split_subnets("10.0.0.0/24", 16, 1).is_err());
        assert!(split_subnets("10.0.0.0/24", 26, 4).is_ok());
        let err = split_subnets("10.0.0.0/24", 26, 5).unwrap_err();
        assert!(matches!(err, NetError::AddressSpaceExhausted(_)));
    }

    #[test]
    fn test_split_whole_address_space() {
        assert_eq!(split_subnets("::/0", 0, 1).unwrap(), vec!["::/0"]);
        assert_eq!(split_subnets("0.0.0.0/0", 0, 1).unwrap(), vec!["0.0.0.0/0"]);
        assert!(split_subnets("::/0", 0, 2).is_err());
    }
}
