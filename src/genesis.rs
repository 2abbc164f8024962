//! Clique genesis generation.
//!
//! The genesis document is derived from the chain id, the fixed consensus
//! parameters and the signer identities. The signer set is encoded in
//! `extraData` as:
//!
//! ```text
//! | 32 zero bytes (vanity) | 20 bytes per signer | 65 zero bytes (seal) |
//! ```
//!
//! Signer order is the order the caller passes; every node loads the same
//! document so the order only has to be consistent, not sorted. Each signer
//! is funded with a fixed starting balance in `alloc`.

use crate::keys::NodeCredentials;
use crate::settings::GenesisParams;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

/// Length of the vanity prefix of `extraData`
pub const EXTRA_VANITY: usize = 32;
/// Length of the seal suffix of `extraData`
pub const EXTRA_SEAL: usize = 65;
/// Length of one signer address
pub const ADDRESS_LENGTH: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum GenesisError {
    #[error("extraData is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("extraData has length {0}, expected 32 + 20*n + 65")]
    MalformedExtraData(usize),
    #[error("'{0}' is not a 20-byte hex address")]
    InvalidAddress(String),
    #[error("{0} is already a signer")]
    DuplicateSigner(String),
    #[error("Genesis I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Genesis JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Clique consensus parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliqueConfig {
    pub period: u64,
    pub epoch: u64,
}

/// Fork schedule and consensus section of the genesis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    pub chain_id: u64,
    pub homestead_block: u64,
    pub eip150_block: u64,
    pub eip155_block: u64,
    pub eip158_block: u64,
    pub byzantium_block: u64,
    pub constantinople_block: u64,
    pub petersburg_block: u64,
    pub istanbul_block: u64,
    pub berlin_block: u64,
    pub london_block: u64,
    pub clique: CliqueConfig,
}

impl ChainConfig {
    /// All forks active from block zero
    fn at_genesis(chain_id: u64, clique: CliqueConfig) -> Self {
        ChainConfig {
            chain_id,
            homestead_block: 0,
            eip150_block: 0,
            eip155_block: 0,
            eip158_block: 0,
            byzantium_block: 0,
            constantinople_block: 0,
            petersburg_block: 0,
            istanbul_block: 0,
            berlin_block: 0,
            london_block: 0,
            clique,
        }
    }
}

/// Pre-funded account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocEntry {
    /// Wei, hex encoded
    pub balance: String,
}

/// The genesis artifact every node of a network initialises from.
///
/// Fields are only changed through [`GenesisBuilder`] so the `extraData`
/// layout and `alloc` stay consistent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisDocument {
    config: ChainConfig,
    nonce: String,
    timestamp: String,
    extra_data: String,
    gas_limit: String,
    difficulty: String,
    alloc: BTreeMap<String, AllocEntry>,
}

impl GenesisDocument {
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// `extraData` as the `0x`-prefixed hex string stored in the document
    pub fn extra_data(&self) -> &str {
        &self.extra_data
    }

    pub fn extra_data_bytes(&self) -> Result<Vec<u8>, GenesisError> {
        Ok(hex::decode(self.extra_data.trim_start_matches("0x"))?)
    }

    pub fn alloc(&self) -> &BTreeMap<String, AllocEntry> {
        &self.alloc
    }

    /// Decode the signer segment of `extraData` back into addresses, in order
    pub fn signers(&self) -> Result<Vec<String>, GenesisError> {
        let bytes = self.extra_data_bytes()?;
        signer_segment(&bytes).map(|segment| segment.chunks(ADDRESS_LENGTH).map(hex::encode).collect())
    }

    pub fn to_json_pretty(&self) -> Result<String, GenesisError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, GenesisError> {
        let document: GenesisDocument = serde_json::from_str(json)?;
        document.signers()?;
        Ok(document)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), GenesisError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self, GenesisError> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

/// Return the signer bytes between the vanity prefix and the seal suffix
fn signer_segment(extra: &[u8]) -> Result<&[u8], GenesisError> {
    if extra.len() < EXTRA_VANITY + EXTRA_SEAL
        || (extra.len() - EXTRA_VANITY - EXTRA_SEAL) % ADDRESS_LENGTH != 0
    {
        return Err(GenesisError::MalformedExtraData(extra.len()));
    }
    Ok(&extra[EXTRA_VANITY..extra.len() - EXTRA_SEAL])
}

fn normalise_address(address: &str) -> Result<String, GenesisError> {
    let trimmed = address.trim().trim_start_matches("0x").to_lowercase();
    if trimmed.len() != ADDRESS_LENGTH * 2 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(GenesisError::InvalidAddress(address.to_string()));
    }
    Ok(trimmed)
}

/// Encode a signer list into `extraData` bytes
pub fn encode_extra_data(addresses: &[String]) -> Result<Vec<u8>, GenesisError> {
    let mut extra = vec![0u8; EXTRA_VANITY];
    for address in addresses {
        let normalised = normalise_address(address)?;
        extra.extend(hex::decode(normalised)?);
    }
    extra.extend([0u8; EXTRA_SEAL]);
    Ok(extra)
}

/// Builds genesis documents from fixed chain parameters
#[derive(Debug, Clone)]
pub struct GenesisBuilder {
    params: GenesisParams,
}

impl GenesisBuilder {
    pub fn new(params: GenesisParams) -> Self {
        GenesisBuilder { params }
    }

    /// Build the genesis for `chain_id` with `validators` as the initial signers
    pub fn build(&self, chain_id: u64, validators: &[&NodeCredentials]) -> Result<GenesisDocument, GenesisError> {
        let addresses: Vec<String> = validators.iter().map(|v| v.address.clone()).collect();
        let extra = encode_extra_data(&addresses)?;

        let alloc = addresses
            .iter()
            .map(|address| {
                (
                    address.to_lowercase(),
                    AllocEntry { balance: self.params.initial_balance.clone() },
                )
            })
            .collect();

        info!(
            "Built genesis for chain {} with {} signer(s), period {}s",
            chain_id,
            addresses.len(),
            self.params.period
        );

        Ok(GenesisDocument {
            config: ChainConfig::at_genesis(
                chain_id,
                CliqueConfig { period: self.params.period, epoch: self.params.epoch },
            ),
            nonce: "0x0".to_string(),
            timestamp: "0x0".to_string(),
            extra_data: format!("0x{}", hex::encode(extra)),
            gas_limit: self.params.gas_limit.clone(),
            difficulty: self.params.difficulty.clone(),
            alloc,
        })
    }

    /// Append a signer to an already-initialised genesis.
    ///
    /// The address goes between the existing signer block and the seal
    /// suffix, and is funded with the starting balance.
    pub fn add_validator(&self, document: &mut GenesisDocument, address: &str) -> Result<(), GenesisError> {
        let address = normalise_address(address)?;
        let mut extra = document.extra_data_bytes()?;
        let existing = signer_segment(&extra)?
            .chunks(ADDRESS_LENGTH)
            .map(hex::encode)
            .any(|signer| signer == address);
        if existing {
            return Err(GenesisError::DuplicateSigner(address));
        }

        let seal_start = extra.len() - EXTRA_SEAL;
        let raw = hex::decode(&address)?;
        extra.splice(seal_start..seal_start, raw);

        document.extra_data = format!("0x{}", hex::encode(extra));
        document
            .alloc
            .entry(address.clone())
            .or_insert_with(|| AllocEntry { balance: self.params.initial_balance.clone() });
        info!("Added signer {} to genesis of chain {}", address, document.chain_id());
        Ok(())
    }
}
