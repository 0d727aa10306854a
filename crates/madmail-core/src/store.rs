//! Persistent key-value collections.
//!
//! A collection maps an opaque id to a record. It knows nothing about the
//! records themselves; merge rules belong to the layer above.

use crate::error::StoreError;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub trait KeyValueCollection<V>: Send + Sync {
    fn get_all(&self) -> Result<Vec<V>, StoreError>;
    /// Insert or replace the record stored under `key`.
    fn put(&self, key: &str, value: V) -> Result<(), StoreError>;
    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Collection kept in memory only.
pub struct MemoryCollection<V> {
    entries: Mutex<BTreeMap<String, V>>,
}

impl<V> MemoryCollection<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<V> Default for MemoryCollection<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send> KeyValueCollection<V> for MemoryCollection<V> {
    fn get_all(&self) -> Result<Vec<V>, StoreError> {
        Ok(self.entries.lock().values().cloned().collect())
    }

    fn put(&self, key: &str, value: V) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Collection persisted as one JSON object (`id -> record`) on disk.
///
/// Every write rewrites the whole file through a temp file + rename so a crash
/// never leaves a half-written store behind.
pub struct JsonFileCollection<V> {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
    _marker: std::marker::PhantomData<fn() -> V>,
}

impl<V: Serialize + DeserializeOwned> JsonFileCollection<V> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, V>, StoreError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|source| StoreError::Serde {
            path: self.path.clone(),
            source,
        })
    }

    fn write_map(&self, map: &BTreeMap<String, V>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(map).map_err(|source| StoreError::Serde {
            path: self.path.clone(),
            source,
        })?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, content).map_err(io_err)?;

        // Records carry admin tokens
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&tmp_path, perms).map_err(io_err)?;
        }

        std::fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl<V: Serialize + DeserializeOwned + Send> KeyValueCollection<V> for JsonFileCollection<V> {
    fn get_all(&self) -> Result<Vec<V>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.read_map()?.into_values().collect())
    }

    fn put(&self, key: &str, value: V) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value);
        self.write_map(&map)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut map = self.read_map()?;
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_collection_upserts_by_key() {
        let store = MemoryCollection::new();
        store.put("a", 1).unwrap();
        store.put("b", 2).unwrap();
        store.put("a", 3).unwrap();
        let mut all = store.get_all().unwrap();
        all.sort();
        assert_eq!(all, vec![2, 3]);

        store.delete("a").unwrap();
        store.delete("missing").unwrap();
        assert_eq!(store.get_all().unwrap(), vec![2]);
    }

    #[test]
    fn json_collection_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("servers.json");

        let store = JsonFileCollection::<String>::new(&path);
        assert!(store.get_all().unwrap().is_empty());
        store.put("one", "first".to_string()).unwrap();
        store.put("two", "second".to_string()).unwrap();

        let reopened = JsonFileCollection::<String>::new(&path);
        assert_eq!(
            reopened.get_all().unwrap(),
            vec!["first".to_string(), "second".to_string()]
        );

        reopened.delete("one").unwrap();
        assert_eq!(store.get_all().unwrap(), vec!["second".to_string()]);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn json_collection_reports_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(&path, "not json").unwrap();

        let store = JsonFileCollection::<String>::new(&path);
        assert!(matches!(store.get_all(), Err(StoreError::Serde { .. })));
    }
}
