//! Orchestrator settings.
//!
//! Settings are host-wide knobs that apply to every network the orchestrator
//! provisions: client image, port and address bases, per-role limits,
//! genesis parameters, which conflict checks run, and how runtime cleanup is
//! retried. Every field has a default so a missing settings file is valid.

use crate::config::Role;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default execution client image
pub const DEFAULT_IMAGE: &str = "ethereum/client-go:v1.13.15";
/// Default host RPC port of the first node
pub const DEFAULT_BASE_RPC_PORT: u16 = 8545;
/// Default host P2P port of the first node
pub const DEFAULT_BASE_P2P_PORT: u16 = 30303;
/// Addresses below this host index are left for the gateway and manual use
pub const DEFAULT_IP_OFFSET: u32 = 10;
/// Starting balance of each signer, in wei, as a hex string
pub const DEFAULT_INITIAL_BALANCE: &str =
    "0x200000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Container image running the execution client
    pub image: String,
    /// Client executable inside the image
    pub client_binary: String,
    /// Prefix of the runtime virtual network name (`<prefix><network_id>`)
    pub runtime_network_prefix: String,
    /// Host index of the first automatically assigned address
    pub ip_offset: u32,
    pub base_rpc_port: u16,
    pub base_p2p_port: u16,
    pub role_limits: RoleLimits,
    pub genesis: GenesisParams,
    pub conflict_checks: ConflictChecks,
    pub retry: RetryPolicy,
    /// Host directory for generated genesis and identity files
    pub work_dir: PathBuf,
    /// Directory inside each container holding the chain data
    pub container_data_dir: String,
    /// Directory inside each container where artifacts are mounted
    pub container_config_dir: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            client_binary: "geth".to_string(),
            runtime_network_prefix: "privnet-".to_string(),
            ip_offset: DEFAULT_IP_OFFSET,
            base_rpc_port: DEFAULT_BASE_RPC_PORT,
            base_p2p_port: DEFAULT_BASE_P2P_PORT,
            role_limits: RoleLimits::default(),
            genesis: GenesisParams::default(),
            conflict_checks: ConflictChecks::default(),
            retry: RetryPolicy::default(),
            work_dir: std::env::temp_dir().join("privnet"),
            container_data_dir: "/data".to_string(),
            container_config_dir: "/config".to_string(),
        }
    }
}

impl OrchestratorSettings {
    /// Name of the runtime virtual network backing `network_id`
    pub fn runtime_network_name(&self, network_id: &str) -> String {
        format!("{}{}", self.runtime_network_prefix, network_id)
    }
}

/// Upper bound on the number of nodes of each role in one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleLimits {
    pub bootnode: usize,
    pub validator: usize,
    pub rpc: usize,
    pub plain: usize,
}

impl Default for RoleLimits {
    fn default() -> Self {
        Self {
            bootnode: 2,
            validator: 16,
            rpc: 8,
            plain: 32,
        }
    }
}

impl RoleLimits {
    pub fn max_for(&self, role: Role) -> usize {
        match role {
            Role::Bootnode => self.bootnode,
            Role::Validator => self.validator,
            Role::Rpc => self.rpc,
            Role::Plain => self.plain,
        }
    }
}

/// Fixed chain parameters written into every genesis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisParams {
    /// Seconds between blocks
    pub period: u64,
    /// Blocks between signer checkpoints
    pub epoch: u64,
    pub gas_limit: String,
    pub difficulty: String,
    pub initial_balance: String,
}

impl Default for GenesisParams {
    fn default() -> Self {
        Self {
            period: 5,
            epoch: 30000,
            gas_limit: "0x47b760".to_string(),
            difficulty: "0x1".to_string(),
            initial_balance: DEFAULT_INITIAL_BALANCE.to_string(),
        }
    }
}

/// Individually toggleable cross-network checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictChecks {
    pub name: bool,
    pub chain_id: bool,
    pub subnet: bool,
    pub ports: bool,
    pub runtime_network: bool,
}

impl Default for ConflictChecks {
    fn default() -> Self {
        Self {
            name: true,
            chain_id: true,
            subnet: true,
            ports: true,
            runtime_network: true,
        }
    }
}

/// Bounded retry with exponential backoff for runtime operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff.saturating_mul(1u32 << exponent);
        delay.min(self.max_backoff)
    }

    /// A policy that never sleeps, for tests and dry runs
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }
}

/// Load settings from a YAML file, or return defaults when no path is given
pub fn load_settings(path: Option<&Path>) -> color_eyre::Result<OrchestratorSettings> {
    match path {
        Some(path) => {
            info!("Loading orchestrator settings from: {:?}", path);
            let file = File::open(path)?;
            Ok(serde_yaml::from_reader(file)?)
        }
        None => {
            info!("No settings file given, using defaults");
            Ok(OrchestratorSettings::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_settings_fill_defaults() {
        let yaml = r#"
image: "example/geth:dev"
base_rpc_port: 9545
role_limits:
  validator: 4
retry:
  max_attempts: 3
  initial_backoff: 50ms
conflict_checks:
  chain_id: false
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml).unwrap();

        let settings = load_settings(Some(temp_file.path())).unwrap();
        assert_eq!(settings.image, "example/geth:dev");
        assert_eq!(settings.base_rpc_port, 9545);
        assert_eq!(settings.base_p2p_port, DEFAULT_BASE_P2P_PORT);
        assert_eq!(settings.role_limits.validator, 4);
        assert_eq!(settings.role_limits.bootnode, 2);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.initial_backoff, Duration::from_millis(50));
        assert_eq!(settings.retry.max_backoff, Duration::from_secs(2));
        assert!(!settings.conflict_checks.chain_id);
        assert!(settings.conflict_checks.subnet);
    }

    #[test]
    fn test_missing_settings_file_uses_defaults() {
        let settings = load_settings(None).unwrap();
        assert_eq!(settings, OrchestratorSettings::default());
        assert_eq!(settings.runtime_network_name("dev"), "privnet-dev");
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_for(5), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(40), Duration::from_secs(2));
    }
}
