//! Cross-network conflict validation.
//!
//! A candidate network is checked against every record in the registry and
//! against the virtual networks the container runtime already has. All
//! enabled checks run even after one fails, so the caller gets the complete
//! list of problems in one go, each with a suggested replacement value.
//!
//! Checks, each toggleable through [`ConflictChecks`]:
//!
//! - **name**: the network id is already registered
//! - **chain id**: an active network already uses the chain id
//! - **subnet**: the CIDR range intersects another network's range
//! - **ports**: a host RPC or P2P port is bound twice, across all networks
//!   and within the candidate itself
//! - **runtime network**: the runtime has an unregistered virtual network
//!   with the derived name

use crate::config::{NetworkConfig, ResolvedConfig};
use crate::error::OrchestratorError;
use crate::ip::{AddressAllocator, Subnet};
use crate::registry::{NetworkInfo, NetworkRegistry};
use crate::settings::{ConflictChecks, OrchestratorSettings, RoleLimits};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::net::Ipv4Addr;

/// Private range alternative subnets are suggested from
const SUGGESTION_POOL: (Ipv4Addr, u8) = (Ipv4Addr::new(172, 16, 0, 0), 12);
/// First subnet tried inside the pool
const SUGGESTION_START: Ipv4Addr = Ipv4Addr::new(172, 20, 0, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Rpc,
    P2p,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Rpc => f.write_str("RPC"),
            PortKind::P2p => f.write_str("P2P"),
        }
    }
}

/// One reason a candidate cannot be provisioned as described
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "conflict", rename_all = "snake_case")]
pub enum Conflict {
    Name {
        network_id: String,
        suggestion: Option<String>,
    },
    ChainId {
        chain_id: u64,
        existing_network: String,
        suggestion: Option<u64>,
    },
    SubnetOverlap {
        subnet: Subnet,
        existing_network: String,
        existing_subnet: Subnet,
        suggestion: Option<Subnet>,
    },
    Port {
        port: u16,
        kind: PortKind,
        node_id: String,
        /// `<network>/<node>` already binding the port
        existing_owner: String,
        suggestion: Option<u16>,
    },
    RuntimeNetwork {
        name: String,
    },
    /// A node joining a running network reuses an existing node id
    NodeId {
        network_id: String,
        node_id: String,
    },
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::Name { network_id, suggestion } => {
                write!(f, "network id '{}' is already registered", network_id)?;
                if let Some(s) = suggestion {
                    write!(f, " (try '{}')", s)?;
                }
                Ok(())
            }
            Conflict::ChainId { chain_id, existing_network, suggestion } => {
                write!(f, "chain id {} is in use by network '{}'", chain_id, existing_network)?;
                if let Some(s) = suggestion {
                    write!(f, " (try {})", s)?;
                }
                Ok(())
            }
            Conflict::SubnetOverlap { subnet, existing_network, existing_subnet, suggestion } => {
                write!(
                    f,
                    "subnet {} overlaps {} of network '{}'",
                    subnet, existing_subnet, existing_network
                )?;
                if let Some(s) = suggestion {
                    write!(f, " (try {})", s)?;
                }
                Ok(())
            }
            Conflict::Port { port, kind, node_id, existing_owner, suggestion } => {
                write!(
                    f,
                    "{} port {} of node '{}' is already bound by {}",
                    kind, port, node_id, existing_owner
                )?;
                if let Some(s) = suggestion {
                    write!(f, " (try {})", s)?;
                }
                Ok(())
            }
            Conflict::RuntimeNetwork { name } => {
                write!(f, "the container runtime already has a network named '{}'", name)
            }
            Conflict::NodeId { network_id, node_id } => {
                write!(f, "node id '{}' already exists in network '{}'", node_id, network_id)
            }
        }
    }
}

/// Every conflict found for one candidate, in check order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictSet(Vec<Conflict>);

impl ConflictSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(conflict: Conflict) -> Self {
        ConflictSet(vec![conflict])
    }

    pub fn push(&mut self, conflict: Conflict) {
        self.0.push(conflict);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conflict> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Conflict] {
        &self.0
    }
}

impl fmt::Display for ConflictSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} conflict(s) with existing networks", self.0.len())?;
        for conflict in &self.0 {
            write!(f, "\n  - {}", conflict)?;
        }
        Ok(())
    }
}

impl IntoIterator for ConflictSet {
    type Item = Conflict;
    type IntoIter = std::vec::IntoIter<Conflict>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Validates candidates against the registry
#[derive(Debug, Clone)]
pub struct ConflictValidator {
    checks: ConflictChecks,
    role_limits: RoleLimits,
    allocator: AddressAllocator,
    base_rpc_port: u16,
    base_p2p_port: u16,
    runtime_network_prefix: String,
}

impl ConflictValidator {
    pub fn new(settings: &OrchestratorSettings) -> Self {
        ConflictValidator {
            checks: settings.conflict_checks,
            role_limits: settings.role_limits.clone(),
            allocator: AddressAllocator::new(settings.ip_offset),
            base_rpc_port: settings.base_rpc_port,
            base_p2p_port: settings.base_p2p_port,
            runtime_network_prefix: settings.runtime_network_prefix.clone(),
        }
    }

    /// Validate `candidate` against the registry and the runtime's networks.
    ///
    /// On success returns the candidate with every address and port
    /// resolved; automatically assigned ports skip ports other networks
    /// already bind.
    pub fn validate(
        &self,
        candidate: &NetworkConfig,
        registry: &NetworkRegistry,
        runtime_networks: &[String],
    ) -> Result<ResolvedConfig, OrchestratorError> {
        let existing = registry.list()?;
        self.validate_against(candidate, &existing, runtime_networks)
    }

    /// Same as [`validate`](Self::validate) over an explicit list of records
    pub fn validate_against(
        &self,
        candidate: &NetworkConfig,
        existing: &[NetworkInfo],
        runtime_networks: &[String],
    ) -> Result<ResolvedConfig, OrchestratorError> {
        candidate.validate(&self.role_limits)?;

        let others: Vec<&NetworkInfo> = existing
            .iter()
            .filter(|info| info.network_id != candidate.network_id)
            .collect();

        let taken_ports: HashSet<u16> = if self.checks.ports {
            others.iter().flat_map(|info| info.config.bound_ports()).map(|(port, _)| port).collect()
        } else {
            HashSet::new()
        };
        let resolved = self.allocator.resolve_config_excluding(
            candidate,
            self.base_rpc_port,
            self.base_p2p_port,
            format!("{}{}", self.runtime_network_prefix, candidate.network_id),
            &taken_ports,
        )?;

        let conflicts = self.find_conflicts(&resolved, existing, runtime_networks);
        if conflicts.is_empty() {
            debug!("Network '{}' has no conflicts", resolved.network_id);
            Ok(resolved)
        } else {
            warn!("Network '{}' rejected: {}", resolved.network_id, conflicts);
            Err(OrchestratorError::Conflict(conflicts))
        }
    }

    /// Run every enabled check and collect what they find
    pub fn find_conflicts(
        &self,
        resolved: &ResolvedConfig,
        existing: &[NetworkInfo],
        runtime_networks: &[String],
    ) -> ConflictSet {
        let mut conflicts = ConflictSet::new();
        let registered = existing.iter().any(|info| info.network_id == resolved.network_id);
        let others: Vec<&NetworkInfo> = existing
            .iter()
            .filter(|info| info.network_id != resolved.network_id)
            .collect();

        if self.checks.name && registered {
            conflicts.push(Conflict::Name {
                network_id: resolved.network_id.clone(),
                suggestion: suggest_name(&resolved.network_id, existing),
            });
        }

        if self.checks.chain_id {
            if let Some(holder) = others
                .iter()
                .find(|info| info.status.is_active() && info.config.chain_id == resolved.chain_id)
            {
                conflicts.push(Conflict::ChainId {
                    chain_id: resolved.chain_id,
                    existing_network: holder.network_id.clone(),
                    suggestion: suggest_chain_id(resolved.chain_id, existing),
                });
            }
        }

        if self.checks.subnet {
            for info in others.iter().filter(|info| info.config.subnet.overlaps(&resolved.subnet)) {
                conflicts.push(Conflict::SubnetOverlap {
                    subnet: resolved.subnet,
                    existing_network: info.network_id.clone(),
                    existing_subnet: info.config.subnet,
                    suggestion: suggest_subnet(resolved.subnet.prefix(), &others),
                });
            }
        }

        if self.checks.ports {
            self.check_ports(resolved, &others, &mut conflicts);
        }

        // A runtime network owned by a registered network is covered by the
        // name check
        if self.checks.runtime_network
            && !registered
            && runtime_networks.iter().any(|name| *name == resolved.runtime_network_name)
        {
            conflicts.push(Conflict::RuntimeNetwork { name: resolved.runtime_network_name.clone() });
        }

        conflicts
    }

    fn check_ports(&self, resolved: &ResolvedConfig, others: &[&NetworkInfo], conflicts: &mut ConflictSet) {
        let mut owners: BTreeMap<u16, String> = BTreeMap::new();
        for info in others {
            for (port, node_id) in info.config.bound_ports() {
                owners.entry(port).or_insert_with(|| format!("{}/{}", info.network_id, node_id));
            }
        }

        let mut bound: BTreeSet<u16> = owners.keys().copied().collect();
        bound.extend(resolved.bound_ports().into_iter().map(|(port, _)| port));

        for node in &resolved.nodes {
            for (port, kind) in [(node.rpc_port, PortKind::Rpc), (node.p2p_port, PortKind::P2p)] {
                match owners.get(&port) {
                    Some(owner) => {
                        let suggestion = next_free_port(port, &bound);
                        bound.extend(suggestion);
                        conflicts.push(Conflict::Port {
                            port,
                            kind,
                            node_id: node.id.clone(),
                            existing_owner: owner.clone(),
                            suggestion,
                        });
                    }
                    None => {
                        owners.insert(port, format!("{}/{}", resolved.network_id, node.id));
                    }
                }
            }
        }
    }
}

/// `<id>-2`, `<id>-3`, ... first one not registered
fn suggest_name(network_id: &str, existing: &[NetworkInfo]) -> Option<String> {
    let taken: HashSet<&str> = existing.iter().map(|info| info.network_id.as_str()).collect();
    (2..1000u32)
        .map(|n| format!("{}-{}", network_id, n))
        .find(|candidate| !taken.contains(candidate.as_str()))
}

/// Next chain id above `chain_id` no registered network uses
fn suggest_chain_id(chain_id: u64, existing: &[NetworkInfo]) -> Option<u64> {
    let taken: HashSet<u64> = existing.iter().map(|info| info.config.chain_id).collect();
    (chain_id.saturating_add(1)..=u64::MAX)
        .take(10_000)
        .find(|candidate| !taken.contains(candidate))
}

/// First subnet of the same size in 172.16.0.0/12 that overlaps nothing
fn suggest_subnet(prefix: u8, others: &[&NetworkInfo]) -> Option<Subnet> {
    let pool = Subnet::new(SUGGESTION_POOL.0, SUGGESTION_POOL.1).ok()?;
    if prefix < pool.prefix() {
        return None;
    }

    let mut candidate = Subnet::new(SUGGESTION_START, prefix).ok()?;
    while pool.contains(candidate.network_addr()) {
        if !others.iter().any(|info| info.config.subnet.overlaps(&candidate)) {
            return Some(candidate);
        }
        candidate = candidate.next_sibling()?;
    }
    None
}

pub(crate) fn next_free_port(from: u16, bound: &BTreeSet<u16>) -> Option<u16> {
    (from.saturating_add(1)..=u16::MAX).find(|port| !bound.contains(port))
}
