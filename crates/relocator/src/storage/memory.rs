use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{validate_key, ObjectEntry, ObjectStore, StoredObject};
use crate::error::StorageError;

/// In-process object store. Useful for dry runs and tests.
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, (Vec<u8>, String)>>,
    base_url: String,
}

impl MemoryObjectStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content type recorded for a key at `put` time.
    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .ok()
            .and_then(|o| o.get(key).map(|(_, ct)| ct.clone()))
    }

    fn poisoned() -> StorageError {
        StorageError::Other("memory store lock poisoned".to_string())
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("memory://")
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(
        &self,
        bytes: &[u8],
        key: &str,
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        validate_key(key)?;
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.insert(key.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(StoredObject {
            key: key.to_string(),
            url: format!("{}/{}", self.base_url, key),
            size: bytes.len() as u64,
        })
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        objects
            .get(key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StorageError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (bytes, _))| ObjectEntry {
                key: key.clone(),
                size: bytes.len() as u64,
            })
            .collect())
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects.contains_key(key))
    }

    fn test_connection(&self) -> Result<(), StorageError> {
        self.objects.read().map(|_| ()).map_err(|_| Self::poisoned())
    }
}
