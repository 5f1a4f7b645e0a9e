//! Object store abstraction for raw document content.
//!
//! The pipeline only ever reads content by reference; uploads happen in an
//! external API layer. `put`/`delete` exist for tests and for the admin purge
//! hook. A missing key is fatal to the generation (`ContentMissing`), every
//! other backend failure is transient.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::fs;

/// Errors surfaced by an object store backend.
#[derive(Debug, Error, Diagnostic)]
pub enum ObjectStoreError {
    #[error("no object under key: {key}")]
    #[diagnostic(code(ragline::object_store::not_found))]
    NotFound { key: String },

    #[error("object store backend error: {message}")]
    #[diagnostic(code(ragline::object_store::backend))]
    Backend { message: String },
}

impl From<std::io::Error> for ObjectStoreError {
    fn from(err: std::io::Error) -> Self {
        ObjectStoreError::Backend {
            message: err.to_string(),
        }
    }
}

/// Keyed blob storage for uploaded documents.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}

/// Volatile in-memory store for tests and development.
#[derive(Default)]
pub struct MemoryObjectStore {
    entries: RwLock<FxHashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError> {
        self.entries.write().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Filesystem-backed store rooted at a directory.
///
/// Keys are normalized into flat file names so arbitrary reference strings
/// cannot escape the root.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(sanitize_key(key))
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError> {
        fs::create_dir_all(&self.root).await?;
        fs::write(self.path_for(key), bytes).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryObjectStore::new();
        store.put("doc/raw.txt", b"content".to_vec()).await.unwrap();
        assert_eq!(store.get("doc/raw.txt").await.unwrap(), b"content");
        store.delete("doc/raw.txt").await.unwrap();
        assert!(matches!(
            store.get("doc/raw.txt").await,
            Err(ObjectStoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn fs_store_normalizes_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store
            .put("tenant/doc-1?v=2", b"bytes".to_vec())
            .await
            .unwrap();
        assert_eq!(store.get("tenant/doc-1?v=2").await.unwrap(), b"bytes");
        // The normalized file lives directly under the root.
        assert!(dir.path().join("tenant_doc-1_v_2").exists());
        store.delete("tenant/doc-1?v=2").await.unwrap();
        // Deleting a missing key is not an error.
        store.delete("tenant/doc-1?v=2").await.unwrap();
    }
}
