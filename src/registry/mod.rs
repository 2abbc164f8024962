//! # Network Registry
//!
//! The registry is the single source of truth about provisioned networks.
//! It holds one [`NetworkInfo`] record per network id in a pluggable
//! [`NetworkStore`] and is passed explicitly to the orchestrator; there is no
//! process-wide instance.
//!
//! ## Key Components
//!
//! - `store.rs`: the keyed store capability, with an in-memory store and a
//!   JSON-file store (one `<network_id>.json` per network)
//! - [`NetworkRegistry`]: the store plus the serialisation points
//!
//! ## Serialisation
//!
//! An operation on a network first claims its id. The claim is a marker in
//! an in-memory set guarded by a mutex that is held only to insert or remove
//! the id; runtime calls run while the claim is held, never while a lock is.
//! A second operation on a claimed id is refused, so two operations on the
//! same network never interleave while operations on different networks
//! proceed in parallel. Admission (conflict validation followed by the
//! reservation write) runs under a single admission lock, so two candidates
//! cannot both pass validation against a registry that contains neither.

//! ## Record Lifecycle
//!
//! ```text
//! creating --> running <--> stopping --> stopped
//!     |           |                        |
//!     +-----------+----> error <-----------+
//! ```
//!
//! A `creating` record is a reservation: it carries the resolved
//! configuration so later validations see its subnet, ports and chain id,
//! but no nodes yet. It is deleted if creation fails.

pub mod store;

pub use store::{JsonFileStore, MemoryStore, NetworkStore, StoreError};

use crate::config::{ResolvedConfig, Role};
use crate::genesis::GenesisDocument;
use crate::keys::NodeCredentials;
use crate::runtime::{ContainerHandle, NetworkHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

/// Lifecycle status of a network record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl NetworkStatus {
    /// Whether the network holds, or is about to hold, live resources
    pub fn is_active(&self) -> bool {
        matches!(self, NetworkStatus::Creating | NetworkStatus::Running | NetworkStatus::Stopping)
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkStatus::Creating => "creating",
            NetworkStatus::Running => "running",
            NetworkStatus::Stopping => "stopping",
            NetworkStatus::Stopped => "stopped",
            NetworkStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of one node container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    Stopped,
    Error,
}

/// Runtime record of one node, owned by its network record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRuntimeInfo {
    pub id: String,
    pub role: Role,
    pub ip: Ipv4Addr,
    pub container_handle: ContainerHandle,
    pub status: NodeStatus,
    /// Shared with the provisioning step that produced it, never cloned
    /// into another node
    pub credentials: Arc<NodeCredentials>,
    pub created_at: DateTime<Utc>,
}

/// Registry entry for one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub network_id: String,
    pub config: ResolvedConfig,
    /// Handle of the runtime virtual network; absent while reserved
    pub docker_network_id: Option<NetworkHandle>,
    pub status: NetworkStatus,
    pub nodes: BTreeMap<String, NodeRuntimeInfo>,
    /// Absent while reserved
    pub genesis: Option<GenesisDocument>,
    pub created_at: DateTime<Utc>,
}

impl NetworkInfo {
    /// A `creating` placeholder that claims the resolved resources
    pub fn reservation(config: ResolvedConfig) -> Self {
        NetworkInfo {
            network_id: config.network_id.clone(),
            config,
            docker_network_id: None,
            status: NetworkStatus::Creating,
            nodes: BTreeMap::new(),
            genesis: None,
            created_at: Utc::now(),
        }
    }

    /// Discovery URL of the designated bootstrap node, if it is provisioned
    pub fn bootstrap_url(&self) -> Option<&str> {
        let bootstrap = self.config.bootstrap_node()?;
        self.nodes
            .get(&bootstrap.id)
            .map(|node| node.credentials.discovery_url.as_str())
    }
}

/// The registry: a store plus per-network claims and admission
pub struct NetworkRegistry {
    store: Arc<dyn NetworkStore>,
    claimed: Mutex<HashSet<String>>,
    admission: Mutex<()>,
}

/// Exclusive claim on one network id, released on drop
#[derive(Debug)]
pub struct OperationClaim<'a> {
    claimed: &'a Mutex<HashSet<String>>,
    network_id: String,
}

impl OperationClaim<'_> {
    pub fn network_id(&self) -> &str {
        &self.network_id
    }
}

impl Drop for OperationClaim<'_> {
    fn drop(&mut self) {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        claimed.remove(&self.network_id);
    }
}

impl NetworkRegistry {
    pub fn new(store: Arc<dyn NetworkStore>) -> Self {
        NetworkRegistry {
            store,
            claimed: Mutex::new(HashSet::new()),
            admission: Mutex::new(()),
        }
    }

    pub fn get(&self, network_id: &str) -> Result<Option<NetworkInfo>, StoreError> {
        self.store.get(network_id)
    }

    pub fn list(&self) -> Result<Vec<NetworkInfo>, StoreError> {
        self.store.list()
    }

    pub fn put(&self, info: &NetworkInfo) -> Result<(), StoreError> {
        self.store.put(info)
    }

    pub fn delete(&self, network_id: &str) -> Result<bool, StoreError> {
        self.store.delete(network_id)
    }

    pub fn contains(&self, network_id: &str) -> Result<bool, StoreError> {
        Ok(self.store.get(network_id)?.is_some())
    }

    /// Claim `network_id` for one operation.
    ///
    /// Returns `None` while another operation holds the claim.
    pub fn claim(&self, network_id: &str) -> Option<OperationClaim<'_>> {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(network_id.to_string()) {
            return None;
        }
        Some(OperationClaim { claimed: &self.claimed, network_id: network_id.to_string() })
    }

    /// Whether an operation on `network_id` is in progress
    pub fn is_claimed(&self, network_id: &str) -> bool {
        let claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        claimed.contains(network_id)
    }

    /// Run `op` while holding the admission lock
    pub fn admit<T>(&self, op: impl FnOnce() -> T) -> T {
        let _guard = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        op()
    }
}
