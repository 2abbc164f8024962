//! Address and port allocation.
//!
//! Allocation is a pure function of the network description: nodes keep any
//! explicit IP or port they declare, and the remaining nodes receive
//! sequential values that skip everything already claimed. The host range
//! starts at a fixed offset above the network address so the gateway and the
//! low addresses stay free for manual use.

use super::subnet::{Subnet, SubnetError};
use crate::config::{NetworkConfig, NodeSpec, ResolvedConfig, ResolvedNode};
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;

/// Errors raised while handing out addresses or ports
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("Invalid subnet: {0}")]
    InvalidSubnet(#[from] SubnetError),
    #[error("Subnet {subnet} exhausted: {requested} addresses needed, capacity {capacity}")]
    RangeExhausted {
        subnet: Subnet,
        requested: u64,
        capacity: u64,
    },
    #[error("No free {kind} port at or above {base}")]
    PortRangeExhausted { kind: &'static str, base: u16 },
}

/// Deterministic IP and port allocator
#[derive(Debug, Clone, Copy)]
pub struct AddressAllocator {
    ip_offset: u32,
}

impl AddressAllocator {
    pub fn new(ip_offset: u32) -> Self {
        AddressAllocator { ip_offset }
    }

    /// Resolve an IP for every node of `nodes` inside the CIDR `subnet`
    pub fn resolve(
        &self,
        subnet: &str,
        nodes: &[NodeSpec],
    ) -> Result<BTreeMap<String, Ipv4Addr>, AllocationError> {
        let subnet: Subnet = subnet.parse()?;
        self.resolve_excluding(&subnet, nodes, &HashSet::new())
    }

    /// Resolve IPs while treating `taken` as already in use.
    ///
    /// Hosts are handed out from the configured offset upwards; once the top
    /// of the subnet is reached the scan wraps to host 1, so a subnet only
    /// runs out when every host address is in use.
    ///
    /// Used when a node joins a running network whose existing nodes hold
    /// addresses that are not part of `nodes`.
    pub fn resolve_excluding(
        &self,
        subnet: &Subnet,
        nodes: &[NodeSpec],
        taken: &HashSet<Ipv4Addr>,
    ) -> Result<BTreeMap<String, Ipv4Addr>, AllocationError> {
        let mut used: HashSet<Ipv4Addr> = taken.clone();
        used.extend(nodes.iter().filter_map(|n| n.ip));

        let capacity = subnet.host_capacity();
        let exhausted = |used: &HashSet<Ipv4Addr>| AllocationError::RangeExhausted {
            subnet: *subnet,
            requested: used.len() as u64 + 1,
            capacity,
        };

        let mut resolved = BTreeMap::new();
        let mut index = u64::from(self.ip_offset).clamp(1, capacity.max(1));
        let mut scanned = 0;

        for node in nodes {
            if let Some(ip) = node.ip {
                resolved.insert(node.id.clone(), ip);
                continue;
            }

            let ip = loop {
                if scanned >= capacity {
                    return Err(exhausted(&used));
                }
                let candidate = subnet.host(index).ok_or_else(|| exhausted(&used))?;
                scanned += 1;
                index = if index >= capacity { 1 } else { index + 1 };
                if !used.contains(&candidate) {
                    break candidate;
                }
            };

            log::debug!("Assigned {} to node {}", ip, node.id);
            used.insert(ip);
            resolved.insert(node.id.clone(), ip);
        }

        Ok(resolved)
    }

    /// Allocate `(rpc_port, p2p_port)` for every node
    pub fn allocate_ports(
        nodes: &[NodeSpec],
        base_rpc_port: u16,
        base_p2p_port: u16,
    ) -> Result<BTreeMap<String, (u16, u16)>, AllocationError> {
        Self::allocate_ports_excluding(nodes, base_rpc_port, base_p2p_port, &HashSet::new())
    }

    /// Allocate ports while treating `taken` as already bound
    pub fn allocate_ports_excluding(
        nodes: &[NodeSpec],
        base_rpc_port: u16,
        base_p2p_port: u16,
        taken: &HashSet<u16>,
    ) -> Result<BTreeMap<String, (u16, u16)>, AllocationError> {
        let mut used: HashSet<u16> = taken.clone();
        for node in nodes {
            used.extend(node.rpc_port);
            used.extend(node.p2p_port);
        }

        let mut next_rpc = PortCursor::new("rpc", base_rpc_port);
        let mut next_p2p = PortCursor::new("p2p", base_p2p_port);
        let mut allocated = BTreeMap::new();

        for node in nodes {
            let rpc = match node.rpc_port {
                Some(port) => port,
                None => next_rpc.take(&mut used)?,
            };
            let p2p = match node.p2p_port {
                Some(port) => port,
                None => next_p2p.take(&mut used)?,
            };
            allocated.insert(node.id.clone(), (rpc, p2p));
        }

        Ok(allocated)
    }

    /// Resolve the whole description into concrete addresses and ports
    pub fn resolve_config(
        &self,
        config: &NetworkConfig,
        default_rpc_base: u16,
        default_p2p_base: u16,
        runtime_network_name: String,
    ) -> Result<ResolvedConfig, AllocationError> {
        self.resolve_config_excluding(config, default_rpc_base, default_p2p_base, runtime_network_name, &HashSet::new())
    }

    /// Resolve the description, skipping host ports other networks hold.
    ///
    /// Explicit ports are kept even when taken; reporting those is the
    /// conflict validator's job.
    pub fn resolve_config_excluding(
        &self,
        config: &NetworkConfig,
        default_rpc_base: u16,
        default_p2p_base: u16,
        runtime_network_name: String,
        taken_ports: &HashSet<u16>,
    ) -> Result<ResolvedConfig, AllocationError> {
        let subnet: Subnet = config.subnet.parse()?;
        let ips = self.resolve_excluding(&subnet, &config.nodes, &HashSet::new())?;
        let ports = Self::allocate_ports_excluding(
            &config.nodes,
            config.base_rpc_port.unwrap_or(default_rpc_base),
            config.base_p2p_port.unwrap_or(default_p2p_base),
            taken_ports,
        )?;

        let mut nodes = Vec::with_capacity(config.nodes.len());
        for spec in &config.nodes {
            // Both maps were built from `config.nodes`, every id is present
            let (Some(ip), Some((rpc_port, p2p_port))) = (ips.get(&spec.id), ports.get(&spec.id)) else {
                continue;
            };
            nodes.push(ResolvedNode {
                id: spec.id.clone(),
                role: spec.role,
                ip: *ip,
                rpc_port: *rpc_port,
                p2p_port: *p2p_port,
            });
        }

        Ok(ResolvedConfig {
            network_id: config.network_id.clone(),
            chain_id: config.chain_id,
            subnet,
            runtime_network_name,
            nodes,
        })
    }
}

/// Sequential port counter that skips ports already in use
struct PortCursor {
    kind: &'static str,
    base: u16,
    next: u32,
}

impl PortCursor {
    fn new(kind: &'static str, base: u16) -> Self {
        PortCursor { kind, base, next: u32::from(base) }
    }

    fn take(&mut self, used: &mut HashSet<u16>) -> Result<u16, AllocationError> {
        while self.next <= u32::from(u16::MAX) {
            let candidate = self.next as u16;
            self.next += 1;
            if used.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(AllocationError::PortRangeExhausted { kind: self.kind, base: self.base })
    }
}
