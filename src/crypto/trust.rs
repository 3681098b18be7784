//! Trust records
//!
//! A trust record pins a peer device id to the fingerprint of the
//! certificate it presented when pairing was accepted. Records are only
//! written at that moment; a later connection presenting another
//! certificate never overwrites them on its own.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Pinned certificate of a paired peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub device_id: String,
    /// SHA-256 fingerprint of the peer certificate
    pub fingerprint: String,
    pub trusted: bool,
}

impl TrustRecord {
    pub fn trusted(device_id: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            fingerprint: fingerprint.into(),
            trusted: true,
        }
    }
}

/// Durable device id to trust record mapping
pub trait TrustStore: Send + Sync {
    /// Record for a device, if any
    fn get(&self, device_id: &str) -> Result<Option<TrustRecord>>;

    /// Insert or replace a record
    fn put(&self, record: TrustRecord) -> Result<()>;

    /// Remove a record; removing an absent record is not an error
    fn remove(&self, device_id: &str) -> Result<()>;

    /// All stored records
    fn list(&self) -> Result<Vec<TrustRecord>>;
}

/// Trust store that forgets everything on drop
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    records: RwLock<HashMap<String, TrustRecord>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustStore for MemoryTrustStore {
    fn get(&self, device_id: &str) -> Result<Option<TrustRecord>> {
        Ok(read_map(&self.records).get(device_id).cloned())
    }

    fn put(&self, record: TrustRecord) -> Result<()> {
        write_map(&self.records).insert(record.device_id.clone(), record);
        Ok(())
    }

    fn remove(&self, device_id: &str) -> Result<()> {
        write_map(&self.records).remove(device_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<TrustRecord>> {
        Ok(read_map(&self.records).values().cloned().collect())
    }
}

/// Trust store persisted as a JSON object in one file
///
/// The whole file is rewritten on every change. Writes go to a sibling
/// temporary file first and are renamed over the original.
#[derive(Debug)]
pub struct FileTrustStore {
    path: PathBuf,
    records: RwLock<HashMap<String, TrustRecord>>,
}

impl FileTrustStore {
    /// Open the store at `path`, reading existing records
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let text = fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            HashMap::new()
        };
        debug!("Opened trust store {:?} with {} records", path, records.len());
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    fn persist(&self, records: &HashMap<String, TrustRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(records)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl TrustStore for FileTrustStore {
    fn get(&self, device_id: &str) -> Result<Option<TrustRecord>> {
        Ok(read_map(&self.records).get(device_id).cloned())
    }

    fn put(&self, record: TrustRecord) -> Result<()> {
        let mut records = write_map(&self.records);
        records.insert(record.device_id.clone(), record);
        self.persist(&records)
    }

    fn remove(&self, device_id: &str) -> Result<()> {
        let mut records = write_map(&self.records);
        if records.remove(device_id).is_some() {
            self.persist(&records)?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<TrustRecord>> {
        Ok(read_map(&self.records).values().cloned().collect())
    }
}

fn read_map(
    lock: &RwLock<HashMap<String, TrustRecord>>,
) -> std::sync::RwLockReadGuard<'_, HashMap<String, TrustRecord>> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("Trust store lock poisoned, continuing");
        poisoned.into_inner()
    })
}

fn write_map(
    lock: &RwLock<HashMap<String, TrustRecord>>,
) -> std::sync::RwLockWriteGuard<'_, HashMap<String, TrustRecord>> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("Trust store lock poisoned, continuing");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store() {
        let store = MemoryTrustStore::new();
        assert!(store.get("peer").unwrap().is_none());

        store.put(TrustRecord::trusted("peer", "AA:BB")).unwrap();
        assert_eq!(store.get("peer").unwrap().unwrap().fingerprint, "AA:BB");

        store.remove("peer").unwrap();
        store.remove("peer").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trust").join("trusted_devices.json");

        {
            let store = FileTrustStore::open(&path).unwrap();
            store.put(TrustRecord::trusted("one", "11")).unwrap();
            store.put(TrustRecord::trusted("two", "22")).unwrap();
            store.remove("one").unwrap();
        }

        let reopened = FileTrustStore::open(&path).unwrap();
        assert!(reopened.get("one").unwrap().is_none());
        assert_eq!(
            reopened.get("two").unwrap(),
            Some(TrustRecord::trusted("two", "22"))
        );
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trusted_devices.json");
        fs::write(&path, "not json").unwrap();
        assert!(FileTrustStore::open(&path).is_err());
    }
}
