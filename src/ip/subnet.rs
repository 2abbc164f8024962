//! IPv4 CIDR subnets.
//!
//! This file parses `address/prefix` notation and answers the range
//! questions the allocator and the conflict validator need: host range,
//! capacity, membership and interval overlap.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Errors produced while parsing a CIDR string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubnetError {
    #[error("Subnet '{0}' is not in address/prefix form")]
    MissingPrefix(String),
    #[error("Subnet '{0}' has an invalid IPv4 network address")]
    InvalidAddress(String),
    #[error("Subnet '{cidr}' has prefix length {prefix} outside [0,32]")]
    InvalidPrefix { cidr: String, prefix: String },
}

/// An IPv4 subnet normalised to its network address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subnet {
    network: u32,
    prefix: u8,
}

impl Subnet {
    /// Build a subnet from any address inside it and a prefix length.
    ///
    /// Host bits of `addr` are cleared, so `172.20.0.7/24` and
    /// `172.20.0.0/24` denote the same subnet.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, SubnetError> {
        if prefix > 32 {
            return Err(SubnetError::InvalidPrefix {
                cidr: format!("{}/{}", addr, prefix),
                prefix: prefix.to_string(),
            });
        }
        let network = u32::from(addr) & Self::mask_for(prefix);
        Ok(Subnet { network, prefix })
    }

    fn mask_for(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn broadcast_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.broadcast_u32())
    }

    fn broadcast_u32(&self) -> u32 {
        self.network | !Self::mask_for(self.prefix)
    }

    /// Number of addresses covered, including network and broadcast
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    /// Usable host addresses: `[network+1, broadcast-1]`
    pub fn host_capacity(&self) -> u64 {
        self.size().saturating_sub(2)
    }

    /// Return the host at `index` counted from the network address.
    ///
    /// Index 0 is the network address itself and is never returned; the
    /// broadcast address is never returned either.
    pub fn host(&self, index: u64) -> Option<Ipv4Addr> {
        if index == 0 || index > self.host_capacity() {
            return None;
        }
        let addr = u64::from(self.network) + index;
        u32::try_from(addr).ok().map(Ipv4Addr::from)
    }

    /// Check whether `ip` lies anywhere inside `[network, broadcast]`
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        ip >= self.network && ip <= self.broadcast_u32()
    }

    /// Check whether `ip` is a usable host address of this subnet
    pub fn is_host(&self, ip: Ipv4Addr) -> bool {
        let raw = u32::from(ip);
        self.host_capacity() > 0 && raw > self.network && raw < self.broadcast_u32()
    }

    /// Interval overlap test on `[network, broadcast]`
    pub fn overlaps(&self, other: &Subnet) -> bool {
        self.network <= other.broadcast_u32() && other.network <= self.broadcast_u32()
    }

    /// The subnet of the same size that directly follows this one
    pub fn next_sibling(&self) -> Option<Subnet> {
        let next = u64::from(self.broadcast_u32()) + 1;
        let next = u32::try_from(next).ok()?;
        Some(Subnet { network: next, prefix: self.prefix })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_addr(), self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = SubnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (addr, prefix) = trimmed
            .split_once('/')
            .ok_or_else(|| SubnetError::MissingPrefix(trimmed.to_string()))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| SubnetError::InvalidAddress(trimmed.to_string()))?;
        let prefix: u8 = prefix.parse().map_err(|_| SubnetError::InvalidPrefix {
            cidr: trimmed.to_string(),
            prefix: prefix.to_string(),
        })?;
        Subnet::new(addr, prefix).map_err(|_| SubnetError::InvalidPrefix {
            cidr: trimmed.to_string(),
            prefix: prefix.to_string(),
        })
    }
}

impl Serialize for Subnet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Subnet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
