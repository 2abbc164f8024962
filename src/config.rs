//! Network description types and YAML loading.
//!
//! A [`NetworkConfig`] is the declarative input to the orchestrator: a
//! network id, a chain id, a subnet and the list of nodes with their roles.
//! It is immutable once loaded; everything derived from it (addresses,
//! ports, keys, genesis) lives in the resolved types further downstream.

use crate::ip::Subnet;
use crate::settings::RoleLimits;
use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

/// The role a node plays in the network.
///
/// Roles decide which command-line flags and which cryptographic material a
/// node receives; see `process::role_profile` for the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Discovery bootstrap point other peers contact first
    Bootnode,
    /// Clique signer that seals blocks
    #[serde(alias = "miner")]
    Validator,
    /// Full node exposing the public JSON-RPC surface
    Rpc,
    /// Full node with the base read APIs only
    Plain,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Bootnode, Role::Validator, Role::Rpc, Role::Plain];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Bootnode => "bootnode",
            Role::Validator => "validator",
            Role::Rpc => "rpc",
            Role::Plain => "plain",
        }
    }

    pub fn is_bootnode(&self) -> bool {
        matches!(self, Role::Bootnode)
    }

    pub fn is_validator(&self) -> bool {
        matches!(self, Role::Validator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bootnode" => Ok(Role::Bootnode),
            "validator" | "miner" => Ok(Role::Validator),
            "rpc" => Ok(Role::Rpc),
            "plain" => Ok(Role::Plain),
            other => Err(ValidationError::InvalidNode(format!("unknown role '{}'", other))),
        }
    }
}

/// One node of a network as declared by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p2p_port: Option<u16>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        NodeSpec {
            id: id.into(),
            role,
            ip: None,
            rpc_port: None,
            p2p_port: None,
        }
    }

    /// Checks that need nothing but the node itself: the identifier and
    /// the explicit ports.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_identifier(&self.id) {
            return Err(ValidationError::InvalidNode(format!(
                "node id '{}' must be alphanumeric with hyphens",
                self.id
            )));
        }
        if self.rpc_port == Some(0) || self.p2p_port == Some(0) {
            return Err(ValidationError::InvalidNode(format!(
                "node '{}' uses port 0",
                self.id
            )));
        }
        if self.rpc_port.is_some() && self.rpc_port == self.p2p_port {
            return Err(ValidationError::InvalidNode(format!(
                "node '{}' uses the same port for RPC and P2P",
                self.id
            )));
        }
        Ok(())
    }
}

/// Declarative description of a permissioned network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_id: String,
    pub chain_id: u64,
    /// Kept as written so that a malformed CIDR surfaces as a validation
    /// error rather than a parse failure of the whole document.
    pub subnet: String,
    pub nodes: Vec<NodeSpec>,
    /// First host RPC port for nodes without an explicit one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_rpc_port: Option<u16>,
    /// First host P2P port for nodes without an explicit one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_p2p_port: Option<u16>,
}

/// A node with every address and port resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedNode {
    pub id: String,
    pub role: Role,
    pub ip: Ipv4Addr,
    pub rpc_port: u16,
    pub p2p_port: u16,
}

/// A network description after validation and allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub network_id: String,
    pub chain_id: u64,
    pub subnet: Subnet,
    /// Name of the virtual network in the container runtime
    pub runtime_network_name: String,
    /// Nodes in declaration order
    pub nodes: Vec<ResolvedNode>,
}

impl ResolvedConfig {
    /// The designated bootstrap node: the first bootnode in declaration order
    pub fn bootstrap_node(&self) -> Option<&ResolvedNode> {
        self.nodes.iter().find(|n| n.role.is_bootnode())
    }

    pub fn node(&self, id: &str) -> Option<&ResolvedNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Nodes in provisioning order: the bootstrap node first, then the rest
    /// in declaration order
    pub fn provisioning_order(&self) -> Vec<&ResolvedNode> {
        let bootstrap = self.bootstrap_node().map(|n| n.id.as_str());
        let mut ordered: Vec<&ResolvedNode> = self.nodes.iter().filter(|n| Some(n.id.as_str()) == bootstrap).collect();
        ordered.extend(self.nodes.iter().filter(|n| Some(n.id.as_str()) != bootstrap));
        ordered
    }

    /// Every host port bound by this network, with the owning node id
    pub fn bound_ports(&self) -> Vec<(u16, &str)> {
        self.nodes
            .iter()
            .flat_map(|n| [(n.rpc_port, n.id.as_str()), (n.p2p_port, n.id.as_str())])
            .collect()
    }
}

/// Shape errors in a network description. Always caller-fixable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid network id: {0}")]
    InvalidNetworkId(String),
    #[error("Invalid chain id: {0}")]
    InvalidChainId(String),
    #[error("Invalid subnet: {0}")]
    InvalidSubnet(#[from] crate::ip::SubnetError),
    #[error("Invalid node configuration: {0}")]
    InvalidNode(String),
    #[error("Network must declare at least one bootnode")]
    MissingBootnode,
    #[error("Too many {role} nodes: {count} declared, at most {max} allowed")]
    RoleLimitExceeded { role: Role, count: usize, max: usize },
}

static IDENTIFIER_PATTERN: LazyLock<Regex> = LazyLock::new(||
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]*$").unwrap()
);

/// Check a network or node identifier for the alphanumeric+hyphen form
pub fn is_valid_identifier(id: &str) -> bool {
    IDENTIFIER_PATTERN.is_match(id)
}

impl NetworkConfig {
    /// Parse the subnet field
    pub fn parsed_subnet(&self) -> Result<Subnet, ValidationError> {
        Ok(self.subnet.parse::<Subnet>()?)
    }

    /// The designated bootstrap node: the first bootnode in declaration order
    pub fn bootstrap_node(&self) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.role.is_bootnode())
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.nodes.iter().filter(|n| n.role == role).count()
    }

    /// Validate the shape of the description.
    ///
    /// This does not look at other networks; cross-network checks are the
    /// conflict validator's job.
    pub fn validate(&self, limits: &RoleLimits) -> Result<(), ValidationError> {
        if !is_valid_identifier(&self.network_id) {
            return Err(ValidationError::InvalidNetworkId(format!(
                "'{}' must be alphanumeric with hyphens",
                self.network_id
            )));
        }

        if self.chain_id == 0 {
            return Err(ValidationError::InvalidChainId(
                "chain id must be a positive integer".to_string(),
            ));
        }

        let subnet = self.parsed_subnet()?;

        if self.nodes.is_empty() {
            return Err(ValidationError::InvalidNode("network has no nodes".to_string()));
        }

        let mut ids = HashSet::new();
        let mut ips = HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !ids.insert(node.id.as_str()) {
                return Err(ValidationError::InvalidNode(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            if let Some(ip) = node.ip {
                if !subnet.is_host(ip) {
                    return Err(ValidationError::InvalidNode(format!(
                        "node '{}' ip {} is not a usable host address of {}",
                        node.id, ip, subnet
                    )));
                }
                if !ips.insert(ip) {
                    return Err(ValidationError::InvalidNode(format!(
                        "ip {} is assigned to more than one node",
                        ip
                    )));
                }
            }
        }

        if self.bootstrap_node().is_none() {
            return Err(ValidationError::MissingBootnode);
        }

        for role in Role::ALL {
            let count = self.count_role(role);
            let max = limits.max_for(role);
            if count > max {
                return Err(ValidationError::RoleLimitExceeded { role, count, max });
            }
        }

        if self.count_role(Role::Validator) == 0 {
            warn!(
                "Network '{}' declares no validator; the chain will not seal blocks",
                self.network_id
            );
        }

        Ok(())
    }
}

/// Load a network description from a YAML file
pub fn load_network_config(path: &Path) -> color_eyre::Result<NetworkConfig> {
    info!("Loading network description from: {:?}", path);
    let file = File::open(path)?;
    let config: NetworkConfig = serde_yaml::from_reader(file)?;
    info!(
        "Network '{}' (chain {}) declares {} nodes",
        config.network_id,
        config.chain_id,
        config.nodes.len()
    );
    Ok(config)
}
