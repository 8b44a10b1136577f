//! Scope addressing: subnets, scope types and IP allocation

use crate::error::{Result, VesselError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Scope types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    /// Container bridge network, published ports are mapped into it
    #[default]
    Bridge,
    /// Network the containers reach directly
    External,
}

impl std::fmt::Display for ScopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeType::Bridge => write!(f, "bridge"),
            ScopeType::External => write!(f, "external"),
        }
    }
}

/// An IPv4 subnet in CIDR form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(VesselError::Network(format!("Invalid prefix length: {}", prefix)));
        }
        let network = Ipv4Addr::from(u32::from(address) & mask(prefix));
        Ok(Self { network, prefix })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask(self.prefix))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & mask(self.prefix) == u32::from(self.network)
    }
}

fn mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = VesselError;

    fn from_str(s: &str) -> Result<Self> {
        let (address, prefix) = s
            .split_once('/')
            .ok_or_else(|| VesselError::Network(format!("Invalid subnet: {}", s)))?;

        let address: Ipv4Addr = address
            .parse()
            .map_err(|_| VesselError::Network(format!("Invalid IP: {}", address)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| VesselError::Network(format!("Invalid prefix length: {}", prefix)))?;

        Subnet::new(address, prefix)
    }
}

/// IP address allocator for one scope
#[derive(Debug, Clone)]
pub struct IpAllocator {
    /// Scope subnet
    subnet: Subnet,
    /// Allocated addresses, including the gateway
    allocated: BTreeSet<Ipv4Addr>,
    /// Next address to try
    next: u32,
}

impl IpAllocator {
    /// Create an allocator for a subnet, reserving its gateway
    pub fn new(subnet: Subnet, gateway: Ipv4Addr) -> Result<Self> {
        if !subnet.contains(gateway) {
            return Err(VesselError::Network(format!(
                "Gateway {} is outside subnet {}",
                gateway, subnet
            )));
        }

        let mut allocated = BTreeSet::new();
        allocated.insert(gateway);

        Ok(Self {
            subnet,
            allocated,
            next: u32::from(subnet.network()) + 1,
        })
    }

    fn first(&self) -> u32 {
        u32::from(self.subnet.network()) + 1
    }

    fn last(&self) -> u32 {
        u32::from(self.subnet.broadcast()).saturating_sub(1)
    }

    /// Allocate the next free address
    pub fn allocate(&mut self) -> Result<Ipv4Addr> {
        let (first, last) = (self.first(), self.last());
        if last < first {
            return Err(VesselError::Network(format!(
                "Subnet {} has no host addresses",
                self.subnet
            )));
        }

        let size = last - first + 1;
        for offset in 0..size {
            let candidate = first + (self.next.saturating_sub(first) + offset) % size;
            let ip = Ipv4Addr::from(candidate);
            if self.allocated.insert(ip) {
                self.next = candidate + 1;
                return Ok(ip);
            }
        }

        Err(VesselError::Network(format!(
            "No addresses left in {}",
            self.subnet
        )))
    }

    /// Reserve a specific address
    pub fn reserve(&mut self, ip: Ipv4Addr) -> Result<()> {
        if !self.subnet.contains(ip) || ip == self.subnet.network() || ip == self.subnet.broadcast()
        {
            return Err(VesselError::Network(format!(
                "Address {} is not usable in {}",
                ip, self.subnet
            )));
        }
        if !self.allocated.insert(ip) {
            return Err(VesselError::Network(format!("Address {} is already in use", ip)));
        }
        Ok(())
    }

    /// Release an IP address
    pub fn release(&mut self, ip: Ipv4Addr) {
        self.allocated.remove(&ip);
    }

    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.allocated.contains(&ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_parse() {
        let subnet: Subnet = "172.16.3.7/16".parse().unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(172, 16, 0, 0));
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(172, 16, 255, 255));
        assert!(subnet.contains(Ipv4Addr::new(172, 16, 200, 1)));
        assert!(!subnet.contains(Ipv4Addr::new(172, 17, 0, 1)));
        assert_eq!(subnet.to_string(), "172.16.0.0/16");

        assert!("172.16.0.0".parse::<Subnet>().is_err());
        assert!("172.16.0.0/33".parse::<Subnet>().is_err());
    }

    #[test]
    fn test_ip_allocator() {
        let subnet: Subnet = "172.17.0.0/16".parse().unwrap();
        let mut allocator = IpAllocator::new(subnet, Ipv4Addr::new(172, 17, 0, 1)).unwrap();

        let ip1 = allocator.allocate().unwrap();
        assert_eq!(ip1, Ipv4Addr::new(172, 17, 0, 2));

        let ip2 = allocator.allocate().unwrap();
        assert_eq!(ip2, Ipv4Addr::new(172, 17, 0, 3));

        allocator.release(ip1);
        assert!(!allocator.is_allocated(ip1));
    }

    #[test]
    fn test_ip_allocator_exhaustion_and_reserve() {
        let subnet: Subnet = "10.0.0.0/30".parse().unwrap();
        let mut allocator = IpAllocator::new(subnet, Ipv4Addr::new(10, 0, 0, 1)).unwrap();

        assert!(allocator.reserve(Ipv4Addr::new(10, 0, 0, 3)).is_err());
        assert_eq!(allocator.allocate().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert!(allocator.allocate().is_err());
        assert!(allocator.reserve(Ipv4Addr::new(10, 0, 0, 2)).is_err());

        allocator.release(Ipv4Addr::new(10, 0, 0, 2));
        allocator.reserve(Ipv4Addr::new(10, 0, 0, 2)).unwrap();
    }
}
