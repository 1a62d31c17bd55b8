//! Blob storage collaborator.
//!
//! The core never talks to a concrete backend directly; it goes through
//! [`BlobStorage`], keyed by opaque string paths of the form
//! `<basePath>/[<sizeKey>/]<filename>`. The backend is a shared,
//! externally synchronized service; the core never assumes exclusive
//! access and must tolerate concurrent writers to different keys.

use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

/// A specification of a blob store.
///
/// - Fetch and write whole blobs asynchronously.
/// - Probe existence of a key.
/// - Map a key to a public URL synchronously (no I/O).
#[async_trait]
pub trait BlobStorage: Send + Sync + 'static {
    /// Fetch the blob stored under `path`.
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Write a blob under `path`, replacing any previous content.
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Copy a local file into the store under `path`.
    async fn upload(&self, local: &Path, path: &str) -> Result<()> {
        let bytes = tokio::fs::read(local)
            .await
            .with_context(|| format!("read local file {local:?}"))
            .map_err(Error::NotFound)?;
        self.put(path, &bytes).await
    }

    /// Whether a blob exists under `path`.
    async fn exists(&self, path: &str) -> bool;

    /// The public URL for the blob under `path`.
    fn url(&self, path: &str) -> String;
}

/// Filesystem-backed blob store.
///
/// Keys map onto files below `root`; URLs are `<url_prefix>/<path>`.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
    url_prefix: String,
}

impl FsStorage {
    pub fn new(root: PathBuf, url_prefix: impl Into<String>) -> Self {
        Self {
            root,
            url_prefix: url_prefix.into(),
        }
    }

    /// Map a storage key onto a real path below the root.
    ///
    /// Keys are built internally, but the filename part originates from a
    /// route parameter, so non-normal components are rejected outright.
    fn real_path(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if !rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(Error::NotFound(anyhow::anyhow!(
                "storage key {path:?} is not a normal relative path"
            )));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStorage for FsStorage {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let real = self.real_path(path)?;
        Ok(tokio::fs::read(real).await?)
    }

    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let real = self.real_path(path)?;
        if let Some(parent) = real.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so concurrent writers of the same key never
        // expose a partial blob.
        let tmp = real.with_extension("part");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, &real).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> bool {
        match self.real_path(path) {
            Ok(real) => tokio::fs::try_exists(real).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.url_prefix.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path().to_path_buf(), "/files");
        (dir, storage)
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (_dir, storage) = store();
        storage.put("images/a/x.png", b"blob").await.unwrap();
        assert!(storage.exists("images/a/x.png").await);
        assert_eq!(storage.get("images/a/x.png").await.unwrap(), b"blob");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (_dir, storage) = store();
        let r = storage.get("images/missing.png").await;
        assert!(matches!(r, Err(Error::NotFound(_))));
        assert!(!storage.exists("images/missing.png").await);
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let (_dir, storage) = store();
        let r = storage.get("../etc/passwd").await;
        assert!(matches!(r, Err(Error::NotFound(_))));
        assert!(!storage.exists("images/../../x").await);
    }

    #[tokio::test]
    async fn put_leaves_no_partial_file() {
        let (dir, storage) = store();
        storage.put("images/x.png", b"data").await.unwrap();
        assert!(!dir.path().join("images/x.part").exists());
    }

    #[test]
    fn url_joins_prefix_and_key() {
        let storage = FsStorage::new(PathBuf::from("/data"), "/files/");
        assert_eq!(storage.url("images/x.png"), "/files/images/x.png");
    }
}
