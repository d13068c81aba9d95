//! Blob storage collaborator: raw uploads in, export artifacts out.
//!
//! The pipeline only ever needs `put(bytes) → handle` and
//! `get(handle) → bytes`; everything else about blob storage (S3, local
//! disk, content addressing) is the host application's business.
//! [`MemoryBlobStore`] backs the test suite; [`FsBlobStore`] is a simple
//! directory-backed implementation used by the CLI, writing atomically
//! (temp file + rename) so a crash can never leave a partial artifact.

use crate::error::DocFieldsError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use uuid::Uuid;

/// Narrow blob-store interface. Handles are opaque strings.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, DocFieldsError>;
    async fn get(&self, handle: &str) -> Result<Vec<u8>, DocFieldsError>;
}

// ── In-memory implementation ─────────────────────────────────────────────

/// In-memory blob store for tests and single-process use.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, DocFieldsError> {
        let handle = Uuid::new_v4().to_string();
        self.blobs
            .write()
            .map_err(|_| DocFieldsError::Storage {
                detail: "blob lock poisoned".into(),
            })?
            .insert(handle.clone(), bytes);
        Ok(handle)
    }

    async fn get(&self, handle: &str) -> Result<Vec<u8>, DocFieldsError> {
        self.blobs
            .read()
            .map_err(|_| DocFieldsError::Storage {
                detail: "blob lock poisoned".into(),
            })?
            .get(handle)
            .cloned()
            .ok_or_else(|| DocFieldsError::BlobNotFound {
                handle: handle.to_string(),
            })
    }
}

// ── Filesystem implementation ────────────────────────────────────────────

/// Directory-backed blob store. Each blob is one file named by its handle.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, DocFieldsError> {
        let handle = Uuid::new_v4().to_string();
        let path = self.root.join(&handle);

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| DocFieldsError::Storage {
                detail: format!("create blob dir: {e}"),
            })?;

        // Atomic write: temp file in the same directory, then rename.
        let tmp = self.root.join(format!("{handle}.tmp"));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| DocFieldsError::Storage {
                detail: format!("write blob: {e}"),
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| DocFieldsError::Storage {
                detail: format!("rename blob: {e}"),
            })?;

        Ok(handle)
    }

    async fn get(&self, handle: &str) -> Result<Vec<u8>, DocFieldsError> {
        let path = self.root.join(handle);
        tokio::fs::read(&path)
            .await
            .map_err(|_| DocFieldsError::BlobNotFound {
                handle: handle.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_roundtrip() {
        let store = MemoryBlobStore::new();
        let handle = store.put(b"hello".to_vec()).await.unwrap();
        assert_eq!(store.get(&handle).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn memory_missing_handle() {
        let store = MemoryBlobStore::new();
        assert!(matches!(
            store.get("nope").await,
            Err(DocFieldsError::BlobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn fs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let handle = store.put(b"artifact".to_vec()).await.unwrap();
        assert_eq!(store.get(&handle).await.unwrap(), b"artifact");
        // No stray temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
