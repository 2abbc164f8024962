//! On-disk artifacts mounted into node containers.
//!
//! Layout under the work directory:
//!
//! ```text
//! <work_dir>/<network_id>/
//! |-- genesis.json
//! \-- <node_id>/
//!     |-- private_key
//!     |-- public_key
//!     |-- address
//!     |-- enode
//!     \-- password      # validators only
//! ```
//!
//! The network directory is bind-mounted read-only at the container config
//! directory, so a node sees its own files under `<config_dir>/<node_id>/`.

use crate::genesis::{GenesisDocument, GenesisError};
use crate::keys::{write_identity_files, NodeCredentials, PRIVATE_KEY_FILE};
use log::debug;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const GENESIS_FILE: &str = "genesis.json";
pub const PASSWORD_FILE: &str = "password";

const PASSWORD_LENGTH: usize = 24;

/// Host and container paths of one network's artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    host_root: PathBuf,
    container_root: String,
}

impl ArtifactLayout {
    pub fn new(work_dir: &Path, network_id: &str, container_config_dir: &str) -> Self {
        ArtifactLayout {
            host_root: work_dir.join(network_id),
            container_root: container_config_dir.trim_end_matches('/').to_string(),
        }
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    pub fn container_root(&self) -> &str {
        &self.container_root
    }

    pub fn host_genesis(&self) -> PathBuf {
        self.host_root.join(GENESIS_FILE)
    }

    pub fn host_node_dir(&self, node_id: &str) -> PathBuf {
        self.host_root.join(node_id)
    }

    pub fn container_genesis(&self) -> String {
        format!("{}/{}", self.container_root, GENESIS_FILE)
    }

    pub fn container_node_file(&self, node_id: &str, file: &str) -> String {
        format!("{}/{}/{}", self.container_root, node_id, file)
    }

    pub fn container_private_key(&self, node_id: &str) -> String {
        self.container_node_file(node_id, PRIVATE_KEY_FILE)
    }

    pub fn container_password(&self, node_id: &str) -> String {
        self.container_node_file(node_id, PASSWORD_FILE)
    }

    pub fn write_genesis(&self, genesis: &GenesisDocument) -> Result<(), GenesisError> {
        fs::create_dir_all(&self.host_root)?;
        genesis.write_to(&self.host_genesis())
    }

    /// Write a node's identity files, plus an account password for signers
    pub fn write_node(&self, node_id: &str, credentials: &NodeCredentials, signer: bool) -> io::Result<()> {
        let dir = self.host_node_dir(node_id);
        write_identity_files(&dir, credentials)?;
        if signer {
            fs::write(dir.join(PASSWORD_FILE), generate_password())?;
        }
        debug!("Wrote artifacts for node {} to {:?}", node_id, dir);
        Ok(())
    }

    pub fn remove_node(&self, node_id: &str) -> io::Result<()> {
        remove_dir_if_present(&self.host_node_dir(node_id))
    }

    pub fn remove_all(&self) -> io::Result<()> {
        remove_dir_if_present(&self.host_root)
    }
}

fn remove_dir_if_present(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}
