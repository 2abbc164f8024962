//! Node container specifications.
//!
//! This module turns one resolved node into the [`ContainerSpec`] the
//! runtime starts: client arguments, init commands, published ports, the
//! artifact mount and the static address on the network's virtual network.
//!
//! ## Client Arguments
//!
//! Every node gets:
//! - `--datadir`, `--networkid <chain_id>`, `--syncmode full`
//! - `--port <p2p>` and `--nat extip:<ip>` so peers dial the resolved address
//! - `--nodekey` pointing at its mounted key file, pinning the identity
//!   recorded in its discovery URL without putting the key on the command
//!   line
//! - `--http` on `0.0.0.0:<rpc>` with the role's API allow-list
//!
//! Validators additionally unlock and mine with their own account. Every
//! node except the designated bootstrap node gets `--bootnodes <url>`.
//!
//! Init commands (`init` with the genesis, `account import` for validators)
//! run on the first start only: they leave [`INIT_MARKER_FILE`] in the data
//! directory and a restarted container finds it there.

use super::artifacts::ArtifactLayout;
use super::types::role_profile;
use crate::config::{ResolvedConfig, ResolvedNode};
use crate::error::OrchestratorError;
use crate::keys::NodeCredentials;
use crate::runtime::{ContainerSpec, Mount, PortBinding, Protocol, LABEL_NETWORK, LABEL_NODE, LABEL_ROLE};
use crate::settings::OrchestratorSettings;
use log::debug;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Written to the data directory once the init commands have succeeded
pub const INIT_MARKER_FILE: &str = ".privnet-initialized";

/// Builds container specifications for the nodes of a network
#[derive(Debug, Clone)]
pub struct NodeProvisioner {
    image: String,
    client_binary: String,
    data_dir: String,
    config_dir: String,
    work_dir: PathBuf,
}

impl NodeProvisioner {
    pub fn new(settings: &OrchestratorSettings) -> Self {
        NodeProvisioner {
            image: settings.image.clone(),
            client_binary: settings.client_binary.clone(),
            data_dir: settings.container_data_dir.clone(),
            config_dir: settings.container_config_dir.clone(),
            work_dir: settings.work_dir.clone(),
        }
    }

    /// Artifact layout of `network_id`
    pub fn layout(&self, network_id: &str) -> ArtifactLayout {
        ArtifactLayout::new(&self.work_dir, network_id, &self.config_dir)
    }

    /// Container name of a node, unique per host
    pub fn container_name(network_id: &str, node_id: &str) -> String {
        format!("{}-{}", network_id, node_id)
    }

    /// Build the container specification of one node
    ///
    /// # Arguments
    /// * `node` - The resolved node (role, static IP, ports)
    /// * `credentials` - The node's generated identity
    /// * `network` - The resolved network the node belongs to
    /// * `bootstrap_url` - Discovery URL of the network's bootstrap node
    ///
    /// # Errors
    ///
    /// `MissingBootstrap` when `node` is not the bootstrap node and no
    /// bootstrap URL is available: such a node could never find its peers.
    pub fn build_node_spec(
        &self,
        node: &ResolvedNode,
        credentials: &NodeCredentials,
        network: &ResolvedConfig,
        bootstrap_url: Option<&str>,
    ) -> Result<ContainerSpec, OrchestratorError> {
        let is_bootstrap = network.bootstrap_node().map(|b| b.id.as_str()) == Some(node.id.as_str());
        let bootnodes = match (is_bootstrap, bootstrap_url) {
            (true, _) => None,
            (false, Some(url)) => Some(url),
            (false, None) => return Err(OrchestratorError::MissingBootstrap(node.id.clone())),
        };

        let layout = self.layout(&network.network_id);
        let profile = role_profile(node.role);

        let mut args = vec![
            "--datadir".to_string(),
            self.data_dir.clone(),
            "--networkid".to_string(),
            network.chain_id.to_string(),
            "--syncmode".to_string(),
            "full".to_string(),
            "--port".to_string(),
            node.p2p_port.to_string(),
            "--nat".to_string(),
            format!("extip:{}", node.ip),
            "--nodekey".to_string(),
            layout.container_private_key(&node.id),
            "--http".to_string(),
            "--http.addr".to_string(),
            "0.0.0.0".to_string(),
            "--http.port".to_string(),
            node.rpc_port.to_string(),
            "--http.api".to_string(),
            profile.api_list(),
        ];

        if profile.public_rpc {
            args.extend(["--http.corsdomain", "*", "--http.vhosts", "*"].map(String::from));
        }

        let mut init_commands = vec![vec![
            "init".to_string(),
            "--datadir".to_string(),
            self.data_dir.clone(),
            layout.container_genesis(),
        ]];

        if profile.mines {
            let account = credentials.prefixed_address();
            init_commands.push(vec![
                "account".to_string(),
                "import".to_string(),
                "--datadir".to_string(),
                self.data_dir.clone(),
                "--password".to_string(),
                layout.container_password(&node.id),
                layout.container_private_key(&node.id),
            ]);
            args.extend([
                "--mine".to_string(),
                "--miner.etherbase".to_string(),
                account.clone(),
                "--unlock".to_string(),
                account,
                "--password".to_string(),
                layout.container_password(&node.id),
                "--allow-insecure-unlock".to_string(),
            ]);
        }

        if let Some(url) = bootnodes {
            args.push("--bootnodes".to_string());
            args.push(url.to_string());
        }

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_NETWORK.to_string(), network.network_id.clone());
        labels.insert(LABEL_NODE.to_string(), node.id.clone());
        labels.insert(LABEL_ROLE.to_string(), node.role.to_string());

        let mut environment = BTreeMap::new();
        environment.insert("PRIVNET_NETWORK".to_string(), network.network_id.clone());
        environment.insert("PRIVNET_NODE".to_string(), node.id.clone());
        environment.insert("PRIVNET_ROLE".to_string(), node.role.to_string());

        let spec = ContainerSpec {
            name: Self::container_name(&network.network_id, &node.id),
            image: self.image.clone(),
            entrypoint: self.client_binary.clone(),
            init_commands,
            init_marker: Some(format!("{}/{}", self.data_dir.trim_end_matches('/'), INIT_MARKER_FILE)),
            args,
            environment,
            port_bindings: vec![
                PortBinding { host_port: node.rpc_port, container_port: node.rpc_port, protocol: Protocol::Tcp },
                PortBinding { host_port: node.p2p_port, container_port: node.p2p_port, protocol: Protocol::Tcp },
                PortBinding { host_port: node.p2p_port, container_port: node.p2p_port, protocol: Protocol::Udp },
            ],
            mounts: vec![Mount {
                host_path: layout.host_root().to_path_buf(),
                container_path: layout.container_root().to_string(),
            }],
            network: network.runtime_network_name.clone(),
            ip: node.ip,
            labels,
        };

        debug!("Built container spec {} for {} node {}", spec.name, node.role, node.id);
        Ok(spec)
    }
}
