//! Container runtime data types.
//!
//! These are the values exchanged with the container runtime: the
//! specification of a node container, opaque handles, and the state the
//! runtime reports back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Label carrying the owning network id
pub const LABEL_NETWORK: &str = "privnet.network";
/// Label carrying the node id
pub const LABEL_NODE: &str = "privnet.node";
/// Label carrying the node role
pub const LABEL_ROLE: &str = "privnet.role";

/// Opaque handle to a virtual network in the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkHandle(pub String);

/// Opaque handle to a container in the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerHandle(pub String);

impl fmt::Display for NetworkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host port published to the same container port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Read-only bind mount of a host path into the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
}

/// Everything the runtime needs to create and start one node container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Client executable started in the container
    pub entrypoint: String,
    /// One-shot client invocations run in order before the client starts
    /// (loading the genesis, importing the signer key)
    pub init_commands: Vec<Vec<String>>,
    /// File the init commands leave behind once they succeed; while it
    /// exists a restarted container skips them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_marker: Option<String>,
    /// Arguments of the long-running client process
    pub args: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub port_bindings: Vec<PortBinding>,
    pub mounts: Vec<Mount>,
    /// Virtual network to attach to
    pub network: String,
    /// Static address on that network
    pub ip: Ipv4Addr,
    pub labels: BTreeMap<String, String>,
}

/// Lifecycle state reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Created,
    Running,
    Restarting,
    Paused,
    Removing,
    Exited,
    Dead,
}

impl ResourceState {
    /// Parse the state string the runtime reports
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "created" => Some(ResourceState::Created),
            "running" => Some(ResourceState::Running),
            "restarting" => Some(ResourceState::Restarting),
            "paused" => Some(ResourceState::Paused),
            "removing" => Some(ResourceState::Removing),
            "exited" => Some(ResourceState::Exited),
            "dead" => Some(ResourceState::Dead),
            _ => None,
        }
    }

    /// True when waiting may still lead to `Running`
    pub fn is_transient(&self) -> bool {
        matches!(self, ResourceState::Created | ResourceState::Restarting)
    }
}

/// Result of inspecting a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub handle: ContainerHandle,
    pub name: String,
    pub state: ResourceState,
    pub ip: Option<Ipv4Addr>,
}

/// Label selector for listing containers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    pub labels: BTreeMap<String, String>,
}

impl ResourceFilter {
    /// Select every container of one network
    pub fn network(network_id: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_NETWORK.to_string(), network_id.to_string());
        ResourceFilter { labels }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}
