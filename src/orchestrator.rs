//! Network orchestrator.
//!
//! This module sequences the lifecycle of a private network:
//!
//! ```text
//! Validating -> Allocating -> GeneratingGenesis -> Provisioning -> Running
//!      \             \                \                  \
//!       +-------------+----------------+------------------+--> RollingBack -> Failed
//!
//! Running -> Stopping -> Stopped -> Destroyed
//! ```
//!
//! Validation and the reservation of the resolved resources happen under the
//! registry's admission lock; everything after that runs under a claim on the
//! network id, with no lock held across runtime calls. A network is only recorded as `running` once every node of the
//! initial set reports a running container. If any step after the
//! reservation fails, every resource created for the network is removed and
//! the reservation is deleted; cleanup failures are aggregated into the
//! returned error next to the original cause.

use crate::config::{NetworkConfig, NodeSpec, ResolvedConfig, ResolvedNode, ValidationError};
use crate::conflict::{next_free_port, Conflict, ConflictSet, ConflictValidator, PortKind};
use crate::error::{OrchestratorError, RollbackFailure};
use crate::genesis::{GenesisBuilder, GenesisDocument};
use crate::ip::AddressAllocator;
use crate::keys::{KeyGenerator, NodeCredentials};
use crate::process::{ArtifactLayout, NodeProvisioner};
use crate::registry::{
    NetworkInfo, NetworkRegistry, NetworkStatus, NetworkStore, NodeRuntimeInfo, NodeStatus, OperationClaim,
};
use crate::runtime::{
    remove_container, remove_network, wait_until_running, with_retry, ContainerHandle, ContainerRuntime,
    ContainerSpec, NetworkHandle, ResourceFilter, RuntimeError, LABEL_NETWORK, LABEL_NODE,
};
use crate::settings::OrchestratorSettings;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

/// File listing the planned container specifications
pub const CONTAINERS_FILE: &str = "containers.json";

/// Lifecycle phase of a network as the orchestrator drives it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validating,
    Allocating,
    GeneratingGenesis,
    Provisioning,
    Running,
    RollingBack,
    Failed,
    Stopping,
    Stopped,
    Destroyed,
}

impl Phase {
    /// The legal transition relation
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match self {
            Validating => matches!(next, Allocating | RollingBack),
            Allocating => matches!(next, GeneratingGenesis | RollingBack),
            GeneratingGenesis => matches!(next, Provisioning | RollingBack),
            Provisioning => matches!(next, Running | RollingBack),
            // Provisioning again means a single node joining
            Running => matches!(next, Provisioning | Stopping | RollingBack),
            // Back to Running after a scoped node rollback
            RollingBack => matches!(next, Failed | Running),
            Stopping => matches!(next, Stopped | Failed),
            Stopped => matches!(next, Running | Destroyed | Failed),
            Failed => matches!(next, Destroyed),
            Destroyed => false,
        }
    }

    /// Phase a persisted network is in
    pub fn from_status(status: NetworkStatus) -> Phase {
        match status {
            NetworkStatus::Creating => Phase::Provisioning,
            NetworkStatus::Running => Phase::Running,
            NetworkStatus::Stopping => Phase::Stopping,
            NetworkStatus::Stopped => Phase::Stopped,
            NetworkStatus::Error => Phase::Failed,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Validating => "validating",
            Phase::Allocating => "allocating",
            Phase::GeneratingGenesis => "generating-genesis",
            Phase::Provisioning => "provisioning",
            Phase::Running => "running",
            Phase::RollingBack => "rolling-back",
            Phase::Failed => "failed",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
            Phase::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Tracks and logs the phase of one network during one operation
#[derive(Debug)]
struct PhaseTracker {
    network_id: String,
    phase: Phase,
}

impl PhaseTracker {
    fn start(network_id: &str, phase: Phase) -> Self {
        debug!("Network '{}' enters {}", network_id, phase);
        PhaseTracker { network_id: network_id.to_string(), phase }
    }

    fn current(&self) -> Phase {
        self.phase
    }

    fn advance(&mut self, next: Phase) -> Result<(), OrchestratorError> {
        if !self.phase.can_transition_to(next) {
            error!("Network '{}': refusing transition {} -> {}", self.network_id, self.phase, next);
            return Err(OrchestratorError::IllegalTransition {
                network_id: self.network_id.clone(),
                from: self.phase,
                to: next,
            });
        }
        info!("Network '{}': {} -> {}", self.network_id, self.phase, next);
        self.phase = next;
        Ok(())
    }

    /// Move towards a failure phase; failure paths never abort on an
    /// unexpected current phase
    fn force(&mut self, next: Phase) {
        if self.advance(next).is_err() {
            warn!("Network '{}' forced from {} to {}", self.network_id, self.phase, next);
            self.phase = next;
        }
    }

    fn fail(&mut self) {
        if self.phase != Phase::RollingBack && self.phase.can_transition_to(Phase::RollingBack) {
            self.force(Phase::RollingBack);
        }
        self.force(Phase::Failed);
    }
}

/// Everything a network would be provisioned with, without touching the
/// runtime
#[derive(Debug, Clone)]
pub struct NetworkPlan {
    pub config: ResolvedConfig,
    pub credentials: BTreeMap<String, Arc<NodeCredentials>>,
    pub genesis: GenesisDocument,
    /// Container specifications in provisioning order
    pub containers: Vec<ContainerSpec>,
}

impl NetworkPlan {
    /// Write genesis, identity files and container specs under
    /// `<dir>/<network_id>/`
    pub fn write_to(&self, dir: &Path, container_config_dir: &str) -> Result<ArtifactLayout, OrchestratorError> {
        let layout = ArtifactLayout::new(dir, &self.config.network_id, container_config_dir);
        layout.write_genesis(&self.genesis)?;
        for node in &self.config.nodes {
            let credentials = credentials_for(&self.credentials, &self.config.network_id, &node.id)?;
            layout.write_node(&node.id, credentials, node.role.is_validator())?;
        }
        let json = serde_json::to_string_pretty(&self.containers)
            .map_err(|e| OrchestratorError::Artifact(e.into()))?;
        fs::write(layout.host_root().join(CONTAINERS_FILE), json)?;
        info!("Wrote plan for network '{}' to {:?}", self.config.network_id, layout.host_root());
        Ok(layout)
    }
}

fn credentials_for<'a>(
    credentials: &'a BTreeMap<String, Arc<NodeCredentials>>,
    network_id: &str,
    node_id: &str,
) -> Result<&'a Arc<NodeCredentials>, OrchestratorError> {
    credentials.get(node_id).ok_or_else(|| OrchestratorError::NodeNotFound {
        network_id: network_id.to_string(),
        node_id: node_id.to_string(),
    })
}

fn failure(resource: String, err: impl fmt::Display) -> RollbackFailure {
    let failure = RollbackFailure { resource, error: err.to_string() };
    warn!("Cleanup step failed: {}", failure);
    failure
}

/// Top-level coordinator of network lifecycles
pub struct NetworkOrchestrator {
    settings: OrchestratorSettings,
    runtime: Arc<dyn ContainerRuntime>,
    registry: NetworkRegistry,
    validator: ConflictValidator,
    allocator: AddressAllocator,
    keys: KeyGenerator,
    genesis: GenesisBuilder,
    provisioner: NodeProvisioner,
}

impl NetworkOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn NetworkStore>,
    ) -> Self {
        NetworkOrchestrator {
            validator: ConflictValidator::new(&settings),
            allocator: AddressAllocator::new(settings.ip_offset),
            keys: KeyGenerator::new(),
            genesis: GenesisBuilder::new(settings.genesis.clone()),
            provisioner: NodeProvisioner::new(&settings),
            registry: NetworkRegistry::new(store),
            runtime,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &NetworkRegistry {
        &self.registry
    }

    pub fn list_networks(&self) -> Result<Vec<NetworkInfo>, OrchestratorError> {
        Ok(self.registry.list()?)
    }

    pub fn get_network(&self, network_id: &str) -> Result<NetworkInfo, OrchestratorError> {
        self.registry
            .get(network_id)?
            .ok_or_else(|| OrchestratorError::NetworkNotFound(network_id.to_string()))
    }

    /// Validate, allocate and generate everything for `config` without
    /// reserving it or touching the runtime
    pub fn plan_network(&self, config: &NetworkConfig) -> Result<NetworkPlan, OrchestratorError> {
        let resolved = self.validator.validate(config, &self.registry, &[])?;
        let (credentials, genesis) = self.generate_identities(&resolved)?;
        let bootstrap_url = bootstrap_url(&resolved, &credentials);

        let containers = resolved
            .provisioning_order()
            .into_iter()
            .map(|node| {
                let node_credentials = credentials_for(&credentials, &resolved.network_id, &node.id)?;
                self.provisioner
                    .build_node_spec(node, node_credentials, &resolved, bootstrap_url.as_deref())
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(NetworkPlan { config: resolved, credentials, genesis, containers })
    }

    /// Provision a new network.
    ///
    /// Returns the committed `running` record. On failure nothing created
    /// for the network is left behind, neither in the runtime nor in the
    /// registry.
    pub fn create_network(&self, config: &NetworkConfig) -> Result<NetworkInfo, OrchestratorError> {
        let network_id = config.network_id.clone();
        let mut phase = PhaseTracker::start(&network_id, Phase::Validating);
        info!(
            "Creating network '{}' (chain {}, subnet {}, {} nodes)",
            network_id,
            config.chain_id,
            config.subnet,
            config.nodes.len()
        );

        let admitted = self
            .list_runtime_networks()
            .and_then(|runtime_networks| self.admit_network(config, &runtime_networks, &mut phase));

        let (resolved, _claim) = match admitted {
            Ok(admitted) => admitted,
            Err(err) => {
                // Nothing was reserved or created
                phase.fail();
                return Err(err);
            }
        };

        self.provision_network(resolved, &mut phase)
    }

    /// Validate `config` and write its reservation under the admission lock
    fn admit_network<'a>(
        &'a self,
        config: &NetworkConfig,
        runtime_networks: &[String],
        phase: &mut PhaseTracker,
    ) -> Result<(ResolvedConfig, OperationClaim<'a>), OrchestratorError> {
        self.registry.admit(|| -> Result<(ResolvedConfig, OperationClaim<'a>), OrchestratorError> {
            let resolved = self.validator.validate(config, &self.registry, runtime_networks)?;
            let claim = self.claim(&resolved.network_id)?;
            phase.advance(Phase::Allocating)?;
            self.registry.put(&NetworkInfo::reservation(resolved.clone()))?;
            Ok((resolved, claim))
        })
    }

    fn claim(&self, network_id: &str) -> Result<OperationClaim<'_>, OrchestratorError> {
        self.registry.claim(network_id).ok_or_else(|| {
            warn!("Network '{}' is busy with another operation", network_id);
            OrchestratorError::Busy(network_id.to_string())
        })
    }

    fn provision_network(
        &self,
        resolved: ResolvedConfig,
        phase: &mut PhaseTracker,
    ) -> Result<NetworkInfo, OrchestratorError> {
        let network_id = resolved.network_id.clone();
        let layout = self.provisioner.layout(&network_id);

        let generated = phase
            .advance(Phase::GeneratingGenesis)
            .and_then(|_| self.generate_identities(&resolved))
            .and_then(|(credentials, genesis)| {
                self.write_artifacts(&layout, &resolved, &credentials, &genesis)?;
                Ok((credentials, genesis))
            });
        let (credentials, genesis) = match generated {
            Ok(generated) => generated,
            Err(err) => {
                phase.force(Phase::RollingBack);
                let failures = self.rollback_network(&network_id, &layout, None, &[]);
                phase.force(Phase::Failed);
                if !failures.is_empty() {
                    warn!("{} cleanup step(s) failed for network '{}'", failures.len(), network_id);
                }
                return Err(err);
            }
        };

        phase.advance(Phase::Provisioning)?;

        let network_name = resolved.runtime_network_name.clone();
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_NETWORK.to_string(), network_id.clone());
        let created = with_retry(&self.settings.retry, &network_name, || {
            self.runtime.create_virtual_network(&network_name, &resolved.subnet, &labels)
        });
        let network_handle = match created {
            Ok(handle) => handle,
            Err(err) => {
                return Err(self.abort_provisioning(
                    phase,
                    &network_id,
                    &layout,
                    None,
                    &[],
                    format!("virtual network {}", network_name),
                    0,
                    err.into(),
                ));
            }
        };
        info!("Created virtual network {} ({}) for '{}'", network_name, network_handle, network_id);

        let bootstrap_url = bootstrap_url(&resolved, &credentials);
        let mut containers: Vec<ContainerHandle> = Vec::new();
        let mut nodes = BTreeMap::new();

        for node in resolved.provisioning_order() {
            let launched = credentials_for(&credentials, &network_id, &node.id).and_then(|node_credentials| {
                self.launch_node(node, node_credentials.clone(), &resolved, bootstrap_url.as_deref(), &mut containers)
            });
            match launched {
                Ok(runtime_info) => {
                    nodes.insert(node.id.clone(), runtime_info);
                }
                Err(err) => {
                    let provisioned = nodes.len();
                    return Err(self.abort_provisioning(
                        phase,
                        &network_id,
                        &layout,
                        Some(&network_handle),
                        &containers,
                        format!("node {}", node.id),
                        provisioned,
                        err,
                    ));
                }
            }
        }

        let info = NetworkInfo {
            network_id: network_id.clone(),
            config: resolved,
            docker_network_id: Some(network_handle.clone()),
            status: NetworkStatus::Running,
            nodes,
            genesis: Some(genesis),
            created_at: Utc::now(),
        };
        if let Err(err) = self.registry.put(&info) {
            let provisioned = info.nodes.len();
            return Err(self.abort_provisioning(
                phase,
                &network_id,
                &layout,
                Some(&network_handle),
                &containers,
                "registry commit".to_string(),
                provisioned,
                err.into(),
            ));
        }

        phase.advance(Phase::Running)?;
        info!("Network '{}' is running with {} nodes", network_id, info.nodes.len());
        Ok(info)
    }

    /// Generate every node identity and the genesis signed by the validators
    fn generate_identities(
        &self,
        resolved: &ResolvedConfig,
    ) -> Result<(BTreeMap<String, Arc<NodeCredentials>>, GenesisDocument), OrchestratorError> {
        let credentials: BTreeMap<String, Arc<NodeCredentials>> = resolved
            .nodes
            .iter()
            .map(|node| (node.id.clone(), Arc::new(self.keys.generate(node.ip, node.p2p_port))))
            .collect();

        let mut validators = Vec::new();
        for node in resolved.nodes.iter().filter(|n| n.role.is_validator()) {
            validators.push(credentials_for(&credentials, &resolved.network_id, &node.id)?.as_ref());
        }
        let genesis = self.genesis.build(resolved.chain_id, &validators)?;
        Ok((credentials, genesis))
    }

    fn write_artifacts(
        &self,
        layout: &ArtifactLayout,
        resolved: &ResolvedConfig,
        credentials: &BTreeMap<String, Arc<NodeCredentials>>,
        genesis: &GenesisDocument,
    ) -> Result<(), OrchestratorError> {
        layout.write_genesis(genesis)?;
        for node in &resolved.nodes {
            let node_credentials = credentials_for(credentials, &resolved.network_id, &node.id)?;
            layout.write_node(&node.id, node_credentials, node.role.is_validator())?;
        }
        debug!("Artifacts for '{}' written to {:?}", resolved.network_id, layout.host_root());
        Ok(())
    }

    /// Create one node's container and wait until it runs.
    ///
    /// The handle is pushed to `created` as soon as the runtime returns it so
    /// a failed readiness check still gets cleaned up.
    fn launch_node(
        &self,
        node: &ResolvedNode,
        credentials: Arc<NodeCredentials>,
        network: &ResolvedConfig,
        bootstrap_url: Option<&str>,
        created: &mut Vec<ContainerHandle>,
    ) -> Result<NodeRuntimeInfo, OrchestratorError> {
        let spec = self.provisioner.build_node_spec(node, &credentials, network, bootstrap_url)?;
        let handle = with_retry(&self.settings.retry, &spec.name, || self.runtime.create_resource(&spec))?;
        created.push(handle.clone());
        debug!("Container {} ({}) created for node {}", spec.name, handle, node.id);

        wait_until_running(self.runtime.as_ref(), &self.settings.retry, &handle)?;
        info!("Node {} ({}) is running at {}", node.id, node.role, node.ip);

        Ok(NodeRuntimeInfo {
            id: node.id.clone(),
            role: node.role,
            ip: node.ip,
            container_handle: handle,
            status: NodeStatus::Running,
            credentials,
            created_at: Utc::now(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn abort_provisioning(
        &self,
        phase: &mut PhaseTracker,
        network_id: &str,
        layout: &ArtifactLayout,
        network_handle: Option<&NetworkHandle>,
        containers: &[ContainerHandle],
        stage: String,
        provisioned: usize,
        cause: OrchestratorError,
    ) -> OrchestratorError {
        error!("Provisioning of '{}' failed at {}: {}", network_id, stage, cause);
        phase.force(Phase::RollingBack);
        let rollback_failures = self.rollback_network(network_id, layout, network_handle, containers);
        phase.force(Phase::Failed);

        OrchestratorError::PartialProvisionFailure {
            network_id: network_id.to_string(),
            stage,
            provisioned,
            cause: Box::new(cause),
            rollback_failures,
        }
    }

    /// Remove everything created for a network being provisioned, including
    /// its reservation. Best effort: every step runs, failures are returned.
    fn rollback_network(
        &self,
        network_id: &str,
        layout: &ArtifactLayout,
        network_handle: Option<&NetworkHandle>,
        containers: &[ContainerHandle],
    ) -> Vec<RollbackFailure> {
        info!("Rolling back network '{}'", network_id);
        let mut failures = Vec::new();

        self.remove_containers(containers, &ResourceFilter::network(network_id), &mut failures);
        if let Some(handle) = network_handle {
            if let Err(err) = remove_network(self.runtime.as_ref(), &self.settings.retry, handle) {
                failures.push(failure(format!("virtual network {}", handle), err));
            }
        }
        if let Err(err) = layout.remove_all() {
            failures.push(failure(format!("artifacts {:?}", layout.host_root()), err));
        }
        if let Err(err) = self.registry.delete(network_id) {
            failures.push(failure(format!("registry entry {}", network_id), err));
        }
        failures
    }

    /// Remove `containers`, then sweep anything else matching `filter`
    fn remove_containers(
        &self,
        containers: &[ContainerHandle],
        filter: &ResourceFilter,
        failures: &mut Vec<RollbackFailure>,
    ) {
        let policy = &self.settings.retry;
        for handle in containers.iter().rev() {
            if let Err(err) = remove_container(self.runtime.as_ref(), policy, handle) {
                failures.push(failure(format!("container {}", handle), err));
            }
        }

        match with_retry(policy, "labelled containers", || self.runtime.list_resources(filter)) {
            Ok(leftovers) => {
                for resource in leftovers.iter().filter(|r| !containers.contains(&r.handle)) {
                    debug!("Sweeping leftover container {} ({})", resource.name, resource.handle);
                    if let Err(err) = remove_container(self.runtime.as_ref(), policy, &resource.handle) {
                        failures.push(failure(format!("container {}", resource.name), err));
                    }
                }
            }
            Err(err) => failures.push(failure("labelled containers".to_string(), err)),
        }
    }

    fn list_runtime_networks(&self) -> Result<Vec<String>, OrchestratorError> {
        if !self.settings.conflict_checks.runtime_network {
            return Ok(Vec::new());
        }
        Ok(with_retry(&self.settings.retry, "virtual networks", || self.runtime.list_virtual_networks())?)
    }

    fn require_status(
        info: &NetworkInfo,
        allowed: &[NetworkStatus],
        operation: &'static str,
    ) -> Result<(), OrchestratorError> {
        if allowed.contains(&info.status) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidState {
                network_id: info.network_id.clone(),
                status: info.status,
                operation,
            })
        }
    }

    /// Add one node to a running network.
    ///
    /// The node is provisioned on its own; a failure removes only what was
    /// created for it and leaves the existing records untouched. A new
    /// validator starts from the unchanged genesis and only seals once the
    /// existing signers vote it in.
    pub fn add_node(&self, network_id: &str, node: NodeSpec) -> Result<NodeRuntimeInfo, OrchestratorError> {
        let _claim = self.claim(network_id)?;
        let info = self.get_network(network_id)?;
        Self::require_status(&info, &[NetworkStatus::Running], "add a node to")?;

        if info.nodes.contains_key(&node.id) || info.config.node(&node.id).is_some() {
            return Err(OrchestratorError::Conflict(ConflictSet::single(Conflict::NodeId {
                network_id: network_id.to_string(),
                node_id: node.id.clone(),
            })));
        }

        let (mut info, resolved) = self.reserve_joining_node(info, &node)?;
        let mut phase = PhaseTracker::start(network_id, Phase::Running);
        phase.advance(Phase::Provisioning)?;

        let credentials = Arc::new(self.keys.generate(resolved.ip, resolved.p2p_port));
        let layout = self.provisioner.layout(network_id);
        let mut created = Vec::new();

        let launched = layout
            .write_node(&resolved.id, &credentials, resolved.role.is_validator())
            .map_err(OrchestratorError::from)
            .and_then(|_| {
                self.launch_node(&resolved, credentials.clone(), &info.config, info.bootstrap_url(), &mut created)
            });

        let runtime_info = match launched {
            Ok(runtime_info) => runtime_info,
            Err(err) => {
                error!("Adding node {} to '{}' failed: {}", resolved.id, network_id, err);
                phase.force(Phase::RollingBack);
                let mut rollback_failures = self.rollback_node(network_id, &resolved.id, &layout, &created);
                self.release_joining_node(&mut info, &resolved.id, &mut rollback_failures);
                phase.force(Phase::Running);
                return Err(OrchestratorError::PartialProvisionFailure {
                    network_id: network_id.to_string(),
                    stage: format!("node {}", resolved.id),
                    provisioned: 0,
                    cause: Box::new(err),
                    rollback_failures,
                });
            }
        };

        if resolved.role.is_validator() {
            warn!(
                "Validator {} joins with the existing genesis; current signers must propose {} before it seals",
                resolved.id,
                credentials.prefixed_address()
            );
        }

        info.nodes.insert(resolved.id.clone(), runtime_info.clone());
        if let Err(err) = self.registry.put(&info) {
            phase.force(Phase::RollingBack);
            let mut rollback_failures = self.rollback_node(network_id, &resolved.id, &layout, &created);
            self.release_joining_node(&mut info, &resolved.id, &mut rollback_failures);
            phase.force(Phase::Running);
            return Err(OrchestratorError::PartialProvisionFailure {
                network_id: network_id.to_string(),
                stage: "registry commit".to_string(),
                provisioned: 1,
                cause: Box::new(err.into()),
                rollback_failures,
            });
        }

        phase.advance(Phase::Running)?;
        info!("Node {} added to network '{}'", resolved.id, network_id);
        Ok(runtime_info)
    }

    /// Resolve the joining node and record it in the network's
    /// configuration under the admission lock, so that networks validated
    /// while it launches see its address and ports
    fn reserve_joining_node(
        &self,
        mut info: NetworkInfo,
        node: &NodeSpec,
    ) -> Result<(NetworkInfo, ResolvedNode), OrchestratorError> {
        self.registry.admit(|| -> Result<(NetworkInfo, ResolvedNode), OrchestratorError> {
            let resolved = self.resolve_joining_node(&info, node)?;
            info.config.nodes.push(resolved.clone());
            self.registry.put(&info)?;
            debug!(
                "Reserved {} rpc={} p2p={} for node {} of '{}'",
                resolved.ip, resolved.rpc_port, resolved.p2p_port, resolved.id, info.network_id
            );
            Ok((info, resolved))
        })
    }

    fn release_joining_node(&self, info: &mut NetworkInfo, node_id: &str, failures: &mut Vec<RollbackFailure>) {
        info.nodes.remove(node_id);
        info.config.nodes.retain(|n| n.id != node_id);
        if let Err(err) = self.registry.put(info) {
            failures.push(failure(format!("registry entry of {}", node_id), err));
        }
    }

    /// Resolve address and ports for a node joining `info`
    fn resolve_joining_node(&self, info: &NetworkInfo, node: &NodeSpec) -> Result<ResolvedNode, OrchestratorError> {
        node.validate()?;

        let count = info.config.nodes.iter().filter(|n| n.role == node.role).count() + 1;
        let max = self.settings.role_limits.max_for(node.role);
        if count > max {
            return Err(ValidationError::RoleLimitExceeded { role: node.role, count, max }.into());
        }

        let subnet = info.config.subnet;
        let taken_ips: HashSet<Ipv4Addr> = info.config.nodes.iter().map(|n| n.ip).collect();
        if let Some(ip) = node.ip {
            if !subnet.is_host(ip) || taken_ips.contains(&ip) {
                return Err(ValidationError::InvalidNode(format!(
                    "ip {} is not a free host address of {}",
                    ip, subnet
                ))
                .into());
            }
        }
        let ips = self.allocator.resolve_excluding(&subnet, std::slice::from_ref(node), &taken_ips)?;

        // Ports bound anywhere on the host
        let mut owners: BTreeMap<u16, String> = BTreeMap::new();
        for other in self.registry.list()? {
            for (port, owner) in other.config.bound_ports() {
                owners.insert(port, format!("{}/{}", other.network_id, owner));
            }
        }

        let mut conflicts = ConflictSet::new();
        let bound: BTreeSet<u16> = owners.keys().copied().collect();
        for (port, kind) in [(node.rpc_port, PortKind::Rpc), (node.p2p_port, PortKind::P2p)] {
            let Some(port) = port else { continue };
            if let Some(owner) = owners.get(&port) {
                conflicts.push(Conflict::Port {
                    port,
                    kind,
                    node_id: node.id.clone(),
                    existing_owner: owner.clone(),
                    suggestion: next_free_port(port, &bound),
                });
            }
        }
        if !conflicts.is_empty() {
            return Err(OrchestratorError::Conflict(conflicts));
        }

        let taken_ports: HashSet<u16> = bound.into_iter().collect();
        let ports = AddressAllocator::allocate_ports_excluding(
            std::slice::from_ref(node),
            self.settings.base_rpc_port,
            self.settings.base_p2p_port,
            &taken_ports,
        )?;

        let (Some(ip), Some((rpc_port, p2p_port))) = (ips.get(&node.id), ports.get(&node.id)) else {
            return Err(OrchestratorError::NodeNotFound {
                network_id: info.network_id.clone(),
                node_id: node.id.clone(),
            });
        };

        Ok(ResolvedNode {
            id: node.id.clone(),
            role: node.role,
            ip: *ip,
            rpc_port: *rpc_port,
            p2p_port: *p2p_port,
        })
    }

    fn rollback_node(
        &self,
        network_id: &str,
        node_id: &str,
        layout: &ArtifactLayout,
        containers: &[ContainerHandle],
    ) -> Vec<RollbackFailure> {
        info!("Rolling back node {} of '{}'", node_id, network_id);
        let mut failures = Vec::new();

        let mut filter = ResourceFilter::network(network_id);
        filter.labels.insert(LABEL_NODE.to_string(), node_id.to_string());
        self.remove_containers(containers, &filter, &mut failures);

        if let Err(err) = layout.remove_node(node_id) {
            failures.push(failure(format!("artifacts of {}", node_id), err));
        }
        failures
    }

    /// Stop and delete one node, independent of the other nodes.
    ///
    /// The last bootnode of a network cannot be removed.
    pub fn remove_node(&self, network_id: &str, node_id: &str) -> Result<(), OrchestratorError> {
        let _claim = self.claim(network_id)?;
        let mut info = self.get_network(network_id)?;
        Self::require_status(&info, &[NetworkStatus::Running, NetworkStatus::Stopped], "remove a node from")?;

        let Some(role) = info.config.node(node_id).map(|n| n.role) else {
            return Err(OrchestratorError::NodeNotFound {
                network_id: network_id.to_string(),
                node_id: node_id.to_string(),
            });
        };
        if role.is_bootnode() && info.config.nodes.iter().filter(|n| n.role.is_bootnode()).count() == 1 {
            error!("Node {} is the only bootnode of '{}'", node_id, network_id);
            return Err(ValidationError::MissingBootnode.into());
        }

        let Some(node) = info.nodes.get(node_id).cloned() else {
            // Reserved by an add that never completed
            let mut failures = self.rollback_node(network_id, node_id, &self.provisioner.layout(network_id), &[]);
            self.release_joining_node(&mut info, node_id, &mut failures);
            if !failures.is_empty() {
                return Err(OrchestratorError::CleanupIncomplete {
                    network_id: network_id.to_string(),
                    operation: "remove a node from",
                    failures,
                });
            }
            info!("Unfinished node {} dropped from network '{}'", node_id, network_id);
            return Ok(());
        };
        let policy = &self.settings.retry;

        if node.status == NodeStatus::Running {
            match with_retry(policy, &node.container_handle.0, || self.runtime.stop_resource(&node.container_handle)) {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(err) => {
                    self.set_node_status(&mut info, node_id, NodeStatus::Error)?;
                    return Err(err.into());
                }
            }
        }
        self.set_node_status(&mut info, node_id, NodeStatus::Stopped)?;
        info!("Node {} of '{}' stopped", node_id, network_id);

        if let Err(err) = remove_container(self.runtime.as_ref(), policy, &node.container_handle) {
            self.set_node_status(&mut info, node_id, NodeStatus::Error)?;
            return Err(err.into());
        }

        if let Err(err) = self.provisioner.layout(network_id).remove_node(node_id) {
            warn!("Could not remove artifacts of node {}: {}", node_id, err);
        }
        if node.role.is_validator() {
            warn!(
                "Removed validator {} is still a signer until the remaining signers vote it out",
                node_id
            );
        }

        info.nodes.remove(node_id);
        info.config.nodes.retain(|n| n.id != node_id);
        self.registry.put(&info)?;
        info!("Node {} removed from network '{}'", node_id, network_id);
        Ok(())
    }

    fn set_node_status(&self, info: &mut NetworkInfo, node_id: &str, status: NodeStatus) -> Result<(), OrchestratorError> {
        if let Some(node) = info.nodes.get_mut(node_id) {
            node.status = status;
        }
        Ok(self.registry.put(info)?)
    }

    /// Stop every container of a running network, keeping all records
    pub fn stop_network(&self, network_id: &str) -> Result<NetworkInfo, OrchestratorError> {
        let _claim = self.claim(network_id)?;
        let mut info = self.get_network(network_id)?;
        Self::require_status(&info, &[NetworkStatus::Running], "stop")?;

        let mut phase = PhaseTracker::start(network_id, Phase::Running);
        phase.advance(Phase::Stopping)?;
        info.status = NetworkStatus::Stopping;
        self.registry.put(&info)?;

        let failures = self.stop_nodes(&mut info);
        if failures.is_empty() {
            phase.advance(Phase::Stopped)?;
            info.status = NetworkStatus::Stopped;
            self.registry.put(&info)?;
            Ok(info)
        } else {
            phase.force(Phase::Failed);
            info.status = NetworkStatus::Error;
            self.registry.put(&info)?;
            Err(OrchestratorError::CleanupIncomplete { network_id: network_id.to_string(), operation: "stop", failures })
        }
    }

    fn stop_nodes(&self, info: &mut NetworkInfo) -> Vec<RollbackFailure> {
        let mut failures = Vec::new();
        for node in info.nodes.values_mut() {
            let handle = &node.container_handle;
            match with_retry(&self.settings.retry, &handle.0, || self.runtime.stop_resource(handle)) {
                Ok(()) => {
                    debug!("Stopped node {}", node.id);
                    node.status = NodeStatus::Stopped;
                }
                Err(err) => {
                    node.status = NodeStatus::Error;
                    failures.push(failure(format!("container {}", handle), err));
                }
            }
        }
        failures
    }

    /// Restart a stopped network, bootstrap node first
    pub fn start_network(&self, network_id: &str) -> Result<NetworkInfo, OrchestratorError> {
        let _claim = self.claim(network_id)?;
        let mut info = self.get_network(network_id)?;
        Self::require_status(&info, &[NetworkStatus::Stopped], "start")?;
        let mut phase = PhaseTracker::start(network_id, Phase::Stopped);

        let order: Vec<String> = info.config.provisioning_order().iter().map(|n| n.id.clone()).collect();
        for node_id in order {
            let Some(node) = info.nodes.get_mut(&node_id) else { continue };
            let handle = node.container_handle.clone();
            let started = with_retry(&self.settings.retry, &handle.0, || self.runtime.start_resource(&handle))
                .and_then(|_| wait_until_running(self.runtime.as_ref(), &self.settings.retry, &handle));
            match started {
                Ok(_) => node.status = NodeStatus::Running,
                Err(err) => {
                    node.status = NodeStatus::Error;
                    phase.force(Phase::Failed);
                    info.status = NetworkStatus::Error;
                    self.registry.put(&info)?;
                    return Err(err.into());
                }
            }
        }

        phase.advance(Phase::Running)?;
        info.status = NetworkStatus::Running;
        self.registry.put(&info)?;
        Ok(info)
    }

    /// Remove every resource of a network and forget it.
    ///
    /// A `creating` record that no operation in this process is working on
    /// was left by an interrupted creation and is destroyed like any other.
    /// When cleanup cannot complete the record is kept with status `error`
    /// so the network can be destroyed again later.
    pub fn destroy_network(&self, network_id: &str) -> Result<(), OrchestratorError> {
        let _claim = self.claim(network_id)?;
        let mut info = self.get_network(network_id)?;
        Self::require_status(
            &info,
            &[
                NetworkStatus::Creating,
                NetworkStatus::Running,
                NetworkStatus::Stopping,
                NetworkStatus::Stopped,
                NetworkStatus::Error,
            ],
            "destroy",
        )?;

        let mut phase = PhaseTracker::start(network_id, Phase::from_status(info.status));
        match phase.current() {
            Phase::Running => {
                phase.advance(Phase::Stopping)?;
                info.status = NetworkStatus::Stopping;
                self.registry.put(&info)?;
            }
            Phase::Provisioning => {
                warn!("Network '{}' was left in creation; removing what it holds", network_id);
                phase.advance(Phase::RollingBack)?;
            }
            _ => {}
        }

        let handles: Vec<ContainerHandle> = info.nodes.values().map(|n| n.container_handle.clone()).collect();
        let mut failures = Vec::new();
        self.remove_containers(&handles, &ResourceFilter::network(network_id), &mut failures);
        // Docker accepts the name where the handle was never recorded
        let network_handle = info
            .docker_network_id
            .clone()
            .unwrap_or_else(|| NetworkHandle(info.config.runtime_network_name.clone()));
        if let Err(err) = remove_network(self.runtime.as_ref(), &self.settings.retry, &network_handle) {
            failures.push(failure(format!("virtual network {}", network_handle), err));
        }

        if !failures.is_empty() {
            phase.force(Phase::Failed);
            info.status = NetworkStatus::Error;
            for node in info.nodes.values_mut() {
                node.status = NodeStatus::Error;
            }
            self.registry.put(&info)?;
            return Err(OrchestratorError::CleanupIncomplete {
                network_id: network_id.to_string(),
                operation: "destroy",
                failures,
            });
        }

        match phase.current() {
            Phase::Stopping => phase.advance(Phase::Stopped)?,
            Phase::RollingBack => phase.advance(Phase::Failed)?,
            _ => {}
        }
        phase.advance(Phase::Destroyed)?;

        if let Err(err) = self.provisioner.layout(network_id).remove_all() {
            warn!("Could not remove artifacts of '{}': {}", network_id, err);
        }
        self.registry.delete(network_id)?;
        info!("Network '{}' destroyed", network_id);
        Ok(())
    }
}

fn bootstrap_url(resolved: &ResolvedConfig, credentials: &BTreeMap<String, Arc<NodeCredentials>>) -> Option<String> {
    let bootstrap = resolved.bootstrap_node()?;
    credentials.get(&bootstrap.id).map(|c| c.discovery_url.clone())
}
