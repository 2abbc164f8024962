//! Keyed persistence for network records.
//!
//! Stores map `network_id -> NetworkInfo` and guarantee atomicity for a
//! single key only. Consistency across keys is the orchestrator's job.

use super::NetworkInfo;
use log::debug;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Registry I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Registry record {path:?} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persistence capability consumed by the registry
pub trait NetworkStore: Send + Sync {
    fn get(&self, network_id: &str) -> Result<Option<NetworkInfo>, StoreError>;

    /// Every record, ordered by network id
    fn list(&self) -> Result<Vec<NetworkInfo>, StoreError>;

    /// Insert or replace the record keyed by `info.network_id`
    fn put(&self, info: &NetworkInfo) -> Result<(), StoreError>;

    /// Remove a record; returns whether one existed
    fn delete(&self, network_id: &str) -> Result<bool, StoreError>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, NetworkInfo>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NetworkStore for MemoryStore {
    fn get(&self, network_id: &str) -> Result<Option<NetworkInfo>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(network_id).cloned())
    }

    fn list(&self) -> Result<Vec<NetworkInfo>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.values().cloned().collect())
    }

    fn put(&self, info: &NetworkInfo) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert(info.network_id.clone(), info.clone());
        Ok(())
    }

    fn delete(&self, network_id: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.remove(network_id).is_some())
    }
}

/// One pretty-printed JSON file per network under a state directory
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io { path: dir.clone(), source })?;
        Ok(JsonFileStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, network_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", network_id))
    }

    fn read_record(path: &Path) -> Result<NetworkInfo, StoreError> {
        let content = fs::read_to_string(path).map_err(|source| StoreError::Io { path: path.to_path_buf(), source })?;
        serde_json::from_str(&content).map_err(|source| StoreError::Json { path: path.to_path_buf(), source })
    }
}

impl NetworkStore for JsonFileStore {
    fn get(&self, network_id: &str) -> Result<Option<NetworkInfo>, StoreError> {
        let path = self.record_path(network_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    fn list(&self) -> Result<Vec<NetworkInfo>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::Io { path: self.dir.clone(), source })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io { path: self.dir.clone(), source })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        paths.iter().map(|path| Self::read_record(path)).collect()
    }

    fn put(&self, info: &NetworkInfo) -> Result<(), StoreError> {
        let path = self.record_path(&info.network_id);
        let json = serde_json::to_string_pretty(info).map_err(|source| StoreError::Json { path: path.clone(), source })?;

        // Write then rename so readers never observe a half-written record
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, json).map_err(|source| StoreError::Io { path: staging.clone(), source })?;
        fs::rename(&staging, &path).map_err(|source| StoreError::Io { path: path.clone(), source })?;
        debug!("Stored record for network '{}' at {:?}", info.network_id, path);
        Ok(())
    }

    fn delete(&self, network_id: &str) -> Result<bool, StoreError> {
        let path = self.record_path(network_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}
