//! Raw upload bytes.
//!
//! The pipeline reads each document's bytes exactly once per run through [`BlobStorage`].
//! Two backends ship with the crate: [`LocalFileStorage`] rooted at a directory and
//! [`MemoryStorage`] for tests.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Failures reading or writing raw document bytes.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Nothing stored under the path.
    #[error("object not found: {0}")]
    NotFound(String),
    /// The path escapes the storage root or is otherwise unusable.
    #[error("invalid storage path: {0}")]
    InvalidPath(String),
    /// Underlying I/O failure.
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte storage consumed by the ingestion pipeline.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Read the full object at `path`.
    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Write `data` to `path`, replacing any previous object.
    async fn put_bytes(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Remove the object at `path`; a missing object is not an error.
    async fn delete_bytes(&self, path: &str) -> Result<(), StorageError>;
}

/// Filesystem backend rooted at a directory.
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    /// Store objects below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let clean = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if path.is_empty() || !clean {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStorage for LocalFileStorage {
    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full_path = self.resolve(path)?;
        match tokio::fs::read(&full_path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put_bytes(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let full_path = self.resolve(path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = full_path.with_extension("partial");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, &full_path).await?;

        tracing::debug!(storage_path = path, size = data.len(), "Stored upload bytes");
        Ok(())
    }

    async fn delete_bytes(&self, path: &str) -> Result<(), StorageError> {
        let full_path = self.resolve(path)?;
        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Process-local backend.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl BlobStorage for MemoryStorage {
    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn put_bytes(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.objects
            .write()
            .await
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete_bytes(&self, path: &str) -> Result<(), StorageError> {
        self.objects.write().await.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_storage_round_trips_bytes() {
        let root = std::env::temp_dir().join(format!("ragvault-storage-{}", uuid::Uuid::new_v4()));
        let storage = LocalFileStorage::new(&root);

        storage.put_bytes("acme/doc.txt", b"hello").await.unwrap();
        assert_eq!(storage.get_bytes("acme/doc.txt").await.unwrap(), b"hello");

        storage.delete_bytes("acme/doc.txt").await.unwrap();
        assert!(matches!(
            storage.get_bytes("acme/doc.txt").await,
            Err(StorageError::NotFound(_))
        ));
        storage.delete_bytes("acme/doc.txt").await.unwrap();

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn local_storage_rejects_escaping_paths() {
        let storage = LocalFileStorage::new("/tmp/ragvault-never-used");
        let err = storage.get_bytes("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
        let err = storage.get_bytes("/etc/passwd").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn missing_objects_are_reported() {
        let storage = MemoryStorage::new();
        let err = storage.get_bytes("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(path) if path == "nope"));
    }
}
