//! Node identity generation.
//!
//! Every node gets a secp256k1 key pair. The account address is the
//! low-order 20 bytes of the Keccak-256 hash of the uncompressed public key
//! without its leading format byte, and the discovery URL is the
//! enode-style `enode://<pubkey>@<ip>:<p2p_port>`.
//!
//! Credentials are generated once per node and never regenerated: the key
//! is the node's network identity.

use log::debug;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;

/// URL scheme of discovery URLs
pub const DISCOVERY_SCHEME: &str = "enode";

/// File names used when credentials are persisted, one value per file
pub const PRIVATE_KEY_FILE: &str = "private_key";
pub const PUBLIC_KEY_FILE: &str = "public_key";
pub const ADDRESS_FILE: &str = "address";
pub const DISCOVERY_URL_FILE: &str = "enode";

/// Errors when rebuilding credentials from existing key material
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Private key is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("Private key is not a valid secp256k1 scalar: {0}")]
    InvalidKey(#[from] secp256k1::Error),
}

/// Cryptographic identity of one node.
///
/// All values are lower-case hex without a `0x` prefix. `public_key` is the
/// 64-byte uncompressed point without the format byte, as used in enode URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCredentials {
    pub private_key: String,
    pub public_key: String,
    pub address: String,
    pub discovery_url: String,
}

impl NodeCredentials {
    /// Build credentials from a raw 32-byte secret
    pub fn from_secret_bytes(secret: &[u8], ip: Ipv4Addr, p2p_port: u16) -> Result<Self, KeyError> {
        let secret_key = SecretKey::from_slice(secret)?;
        Ok(Self::from_secret_key(&secret_key, ip, p2p_port))
    }

    /// Build credentials from a hex-encoded secret, with or without `0x`
    pub fn from_private_key_hex(private_key: &str, ip: Ipv4Addr, p2p_port: u16) -> Result<Self, KeyError> {
        let raw = hex::decode(private_key.trim().trim_start_matches("0x"))?;
        Self::from_secret_bytes(&raw, ip, p2p_port)
    }

    fn from_secret_key(secret_key: &SecretKey, ip: Ipv4Addr, p2p_port: u16) -> Self {
        let secp = Secp256k1::signing_only();
        let public_key = PublicKey::from_secret_key(&secp, secret_key);
        let uncompressed = public_key.serialize_uncompressed();
        let public_hex = hex::encode(&uncompressed[1..]);

        NodeCredentials {
            private_key: hex::encode(secret_key.secret_bytes()),
            address: address_from_uncompressed(&uncompressed),
            discovery_url: discovery_url(&public_hex, ip, p2p_port),
            public_key: public_hex,
        }
    }

    /// Address with the `0x` prefix, as the client expects on its command line
    pub fn prefixed_address(&self) -> String {
        format!("0x{}", self.address)
    }

    /// Raw 20-byte address
    pub fn address_bytes(&self) -> Result<[u8; 20], hex::FromHexError> {
        let mut out = [0u8; 20];
        hex::decode_to_slice(&self.address, &mut out)?;
        Ok(out)
    }
}

/// Derive the 20-byte account address from a 65-byte uncompressed public key
fn address_from_uncompressed(uncompressed: &[u8; 65]) -> String {
    let hash = Keccak256::digest(&uncompressed[1..]);
    hex::encode(&hash[12..])
}

/// Format an enode-style discovery URL
pub fn discovery_url(public_key_hex: &str, ip: Ipv4Addr, p2p_port: u16) -> String {
    format!("{}://{}@{}:{}", DISCOVERY_SCHEME, public_key_hex, ip, p2p_port)
}

/// Stateless key generator
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyGenerator;

impl KeyGenerator {
    pub fn new() -> Self {
        KeyGenerator
    }

    /// Generate a fresh identity for a node reachable at `ip:p2p_port`
    pub fn generate(&self, ip: Ipv4Addr, p2p_port: u16) -> NodeCredentials {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        let credentials = NodeCredentials::from_secret_key(&secret_key, ip, p2p_port);
        debug!("Generated identity {} for {}:{}", credentials.address, ip, p2p_port);
        credentials
    }
}

/// Persist credentials into `dir`, one opaque value per file
pub fn write_identity_files(dir: &Path, credentials: &NodeCredentials) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(PRIVATE_KEY_FILE), &credentials.private_key)?;
    fs::write(dir.join(PUBLIC_KEY_FILE), &credentials.public_key)?;
    fs::write(dir.join(ADDRESS_FILE), &credentials.address)?;
    fs::write(dir.join(DISCOVERY_URL_FILE), &credentials.discovery_url)?;
    Ok(())
}

/// Read credentials back from files written by [`write_identity_files`]
pub fn read_identity_files(dir: &Path) -> io::Result<NodeCredentials> {
    let read = |name: &str| fs::read_to_string(dir.join(name)).map(|s| s.trim().to_string());
    Ok(NodeCredentials {
        private_key: read(PRIVATE_KEY_FILE)?,
        public_key: read(PUBLIC_KEY_FILE)?,
        address: read(ADDRESS_FILE)?,
        discovery_url: read(DISCOVERY_URL_FILE)?,
    })
}
