use std::io::Write;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::{validate_key, ObjectEntry, ObjectStore, StoredObject};
use crate::error::StorageError;

/// Object store backed by a directory tree. Keys map to relative paths.
pub struct FilesystemObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl FilesystemObjectStore {
    pub fn new<P: AsRef<Path>>(root: P, public_base_url: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn map_io(path: &Path, key: &str, e: std::io::Error) -> StorageError {
        match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound {
                key: key.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => {
                StorageError::PermissionDenied(path.display().to_string())
            }
            _ => StorageError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        }
    }
}

impl ObjectStore for FilesystemObjectStore {
    fn put(
        &self,
        bytes: &[u8],
        key: &str,
        _content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Self::map_io(parent, key, e))?;
        }

        // Write to a sibling temp file and rename so readers never see a
        // partially written object.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)
        };
        if let Err(e) = write() {
            let _ = std::fs::remove_file(&tmp);
            return Err(Self::map_io(&path, key, e));
        }

        Ok(StoredObject {
            key: key.to_string(),
            url: format!("{}/{}", self.public_base_url, key),
            size: bytes.len() as u64,
        })
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        std::fs::read(&path).map_err(|e| Self::map_io(&path, key, e))
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        std::fs::remove_file(&path).map_err(|e| Self::map_io(&path, key, e))
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StorageError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| StorageError::Other(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !key.starts_with(prefix) {
                continue;
            }
            let size = entry
                .metadata()
                .map_err(|e| StorageError::Other(e.to_string()))?
                .len();
            entries.push(ObjectEntry { key, size });
        }
        Ok(entries)
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.path_for(key)?.is_file())
    }

    fn test_connection(&self) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.root).map_err(|e| StorageError::Io {
            path: self.root.clone(),
            source: e,
        })?;
        let metadata = std::fs::metadata(&self.root).map_err(|e| StorageError::Io {
            path: self.root.clone(),
            source: e,
        })?;
        if metadata.permissions().readonly() {
            return Err(StorageError::PermissionDenied(format!(
                "{} is read-only",
                self.root.display()
            )));
        }
        Ok(())
    }
}
