//! Object storage collaborator: opaque byte blobs addressed by key.

pub mod filesystem;
pub mod memory;

pub use filesystem::FilesystemObjectStore;
pub use memory::MemoryObjectStore;

use crate::error::StorageError;

/// Result of a successful `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub url: String,
    pub size: u64,
}

/// One entry of a `list` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// A blob store. Implementations must be shareable across threads.
pub trait ObjectStore: Send + Sync {
    fn put(&self, bytes: &[u8], key: &str, content_type: &str)
        -> Result<StoredObject, StorageError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    fn delete(&self, key: &str) -> Result<(), StorageError>;

    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StorageError>;

    fn exists(&self, key: &str) -> Result<bool, StorageError>;

    fn test_connection(&self) -> Result<(), StorageError>;
}

/// Rejects keys that could escape a store's namespace.
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = |reason: &str| StorageError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    if key.is_empty() {
        return Err(invalid("key is empty"));
    }
    if key.starts_with('/') || key.contains('\\') {
        return Err(invalid("key must be a relative path"));
    }
    if key.split('/').any(|segment| segment == ".." || segment.is_empty()) {
        return Err(invalid("key contains an empty or parent segment"));
    }
    Ok(())
}

/// Guesses a content type from the key's extension.
pub fn content_type_for(key: &str) -> String {
    mime_guess::from_path(key)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("photos/p1/webp.webp").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("photos/../../etc").is_err());
        assert!(validate_key("photos//double").is_err());
        assert!(validate_key("photos\\win").is_err());
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a/b.jpg"), "image/jpeg");
        assert_eq!(content_type_for("a/b.webp"), "image/webp");
        assert_eq!(content_type_for("a/b.unknownext"), "application/octet-stream");
    }
}
