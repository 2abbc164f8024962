//! # Privnet - Provisioning orchestrator for private Clique networks
//!
//! This library turns a declarative network description into a running
//! private blockchain network on a single container host: one container per
//! node, all attached to a dedicated virtual network with static addresses.
//!
//! ## Overview
//!
//! Several isolated networks can run side by side on one host. Before a new
//! network is provisioned it is checked against every existing one for
//! clashing names, chain ids, subnets, host ports and runtime networks, and
//! every conflict found is reported at once together with a suggested
//! alternative. A network is either fully provisioned or not provisioned at
//! all: a failure part-way through removes everything created for it.
//!
//! ## Key Features
//!
//! - **Node Identities**: secp256k1 keys, Keccak-256 addresses and enode
//!   discovery URLs generated per node
//! - **Clique Genesis**: genesis documents whose extra-data encodes the
//!   initial signer set
//! - **Address Allocation**: static IPs inside the subnet and host ports
//!   that skip ports other networks hold
//! - **Conflict Detection**: all checks run, all findings are returned
//! - **Lifecycle**: create, add or remove nodes, stop, start, destroy
//!
//! ## Architecture
//!
//! - `config`: network description and YAML loading
//! - `settings`: host-wide orchestrator settings
//! - `keys`: node identity generation
//! - `genesis`: genesis document construction
//! - `ip`: subnet arithmetic and address/port allocation
//! - `conflict`: cross-network conflict validation
//! - `process`: per-role client arguments, artifacts and container specs
//! - `runtime`: the container runtime capability and its Docker backend
//! - `registry`: the record of provisioned networks
//! - `orchestrator`: lifecycle sequencing, rollback and the state machine
//! - `error`: the orchestrator error taxonomy
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use privnet::config::load_network_config;
//! use privnet::orchestrator::NetworkOrchestrator;
//! use privnet::registry::JsonFileStore;
//! use privnet::runtime::DockerCli;
//! use privnet::settings::OrchestratorSettings;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let config = load_network_config(Path::new("network.yaml"))?;
//! let store = JsonFileStore::open(Path::new("/var/lib/privnet/networks"))?;
//! let orchestrator = NetworkOrchestrator::new(
//!     OrchestratorSettings::default(),
//!     Arc::new(DockerCli::default()),
//!     Arc::new(store),
//! );
//!
//! let network = orchestrator.create_network(&config)?;
//! println!("{} is {}", network.network_id, network.status);
//! # Ok::<(), color_eyre::Report>(())
//! ```
//!
//! ## Configuration Format
//!
//! ```yaml
//! network_id: dev
//! chain_id: 1337
//! subnet: 172.20.0.0/24
//! nodes:
//!   - id: boot
//!     role: bootnode
//!   - id: signer-1
//!     role: validator
//!   - id: rpc
//!     role: rpc
//!     rpc_port: 8545
//! ```
//!
//! ## Error Handling
//!
//! Library operations return typed errors built with `thiserror`, rooted in
//! [`error::OrchestratorError`]. The binary wraps them with `color_eyre`.

pub mod config;
pub mod settings;
pub mod keys;
pub mod genesis;
pub mod ip;
pub mod conflict;
pub mod process;
pub mod runtime;
pub mod registry;
pub mod orchestrator;
pub mod error;

pub use error::OrchestratorError;
pub use orchestrator::NetworkOrchestrator;
