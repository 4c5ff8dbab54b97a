//! Disk-backed content-addressable store.
//!
//! Objects live under `blobs/sha256/<hex>` and their labels under
//! `labels/sha256/<hex>.json`. Writes land in `ingest/` first and are
//! renamed into place, so an object is either fully visible or absent.
//! Every write and every read re-hashes the bytes against the key.

use std::path::{Path, PathBuf};

use ctr_remote_core::error::{RemoteError, Result};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use super::digest::Digest;
use super::Labels;

/// Size and labels of a stored object.
#[derive(Debug, Clone, Serialize)]
pub struct ContentInfo {
    pub digest: Digest,
    pub size: u64,
    pub labels: Labels,
}

/// Content-addressable object store rooted at a directory.
///
/// Handles are cheap to share behind an `Arc`; there is no process-wide
/// instance.
#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open a store, creating its directory layout if needed.
    pub fn open(root: &Path) -> Result<Self> {
        for dir in ["blobs/sha256", "labels/sha256", "ingest"] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| {
                RemoteError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create content directory {}: {}", path.display(), e),
                ))
            })?;
        }

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the store's directories are still usable.
    pub fn is_available(&self) -> bool {
        self.root.join("blobs").join("sha256").is_dir() && self.root.join("ingest").is_dir()
    }

    /// On-disk location of an object (whether or not it exists).
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join("sha256").join(digest.hex())
    }

    fn labels_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("labels")
            .join("sha256")
            .join(format!("{}.json", digest.hex()))
    }

    /// Existence check. Never touches the network.
    pub async fn has(&self, digest: &Digest) -> bool {
        tokio::fs::metadata(self.blob_path(digest))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Store `data` under `digest` after verifying it hashes to that key.
    ///
    /// Writers are serialized per digest by the registrar; this method is
    /// still safe to race because each writer renames its own ingest file
    /// and all of them carry identical bytes.
    pub(crate) async fn write(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let actual = Digest::of(data);
        if &actual != digest {
            return Err(RemoteError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        if self.has(digest).await {
            return Ok(());
        }

        let ingest = self
            .root
            .join("ingest")
            .join(format!("{}.{}", digest.hex(), uuid::Uuid::new_v4()));
        let result = async {
            let mut file = tokio::fs::File::create(&ingest).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&ingest, self.blob_path(digest)).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&ingest).await;
            return Err(RemoteError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to commit content {}: {}", digest, e),
            )));
        }

        tracing::debug!(digest = %digest, size = data.len(), "Stored content object");
        Ok(())
    }

    /// Read an object back, re-verifying its digest.
    pub async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let data = match tokio::fs::read(self.blob_path(digest)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RemoteError::ObjectNotFound {
                    digest: digest.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let actual = Digest::of(&data);
        if &actual != digest {
            return Err(RemoteError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    /// Labels attached to an object.
    pub async fn labels(&self, digest: &Digest) -> Result<Labels> {
        if !self.has(digest).await {
            return Err(RemoteError::ObjectNotFound {
                digest: digest.to_string(),
            });
        }
        match tokio::fs::read(self.labels_path(digest)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Labels::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Merge `labels` into the object's label set, overwriting existing keys.
    ///
    /// Labels are metadata; the object's bytes and digest are untouched.
    pub(crate) async fn update_labels(&self, digest: &Digest, labels: &Labels) -> Result<Labels> {
        let mut current = self.labels(digest).await?;
        for (key, value) in labels {
            current.insert(key.clone(), value.clone());
        }

        let path = self.labels_path(digest);
        let tmp = path.with_extension(format!("json.{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&current)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(current)
    }

    /// Size and labels of an object.
    pub async fn info(&self, digest: &Digest) -> Result<ContentInfo> {
        let meta = tokio::fs::metadata(self.blob_path(digest))
            .await
            .map_err(|_| RemoteError::ObjectNotFound {
                digest: digest.to_string(),
            })?;
        Ok(ContentInfo {
            digest: digest.clone(),
            size: meta.len(),
            labels: self.labels(digest).await?,
        })
    }

    /// List every stored object.
    pub async fn list(&self) -> Result<Vec<ContentInfo>> {
        let mut infos = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("blobs").join("sha256")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(digest) = Digest::parse(&format!("sha256:{}", name)) else {
                tracing::warn!(file = %name, "Ignoring unexpected file in content store");
                continue;
            };
            infos.push(self.info(&digest).await?);
        }
        infos.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(infos)
    }

    /// Remove an object and its labels. Missing objects are not an error.
    pub(crate) async fn delete(&self, digest: &Digest) -> Result<()> {
        for path in [self.blob_path(digest), self.labels_path(digest)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Remove leftover files from interrupted writes.
    pub(crate) async fn clear_ingest(&self) -> Result<()> {
        let mut ingest = tokio::fs::read_dir(self.root.join("ingest")).await?;
        while let Some(entry) = ingest.next_entry().await? {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(tmp: &TempDir) -> ContentStore {
        ContentStore::open(&tmp.path().join("content")).unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_layout() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        assert!(store.is_available());
        assert!(store.root().join("labels/sha256").is_dir());
    }

    #[tokio::test]
    async fn test_write_then_get() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let data = b"bootstrap bytes".to_vec();
        let digest = Digest::of(&data);

        store.write(&digest, &data).await.unwrap();
        assert!(store.has(&digest).await);

        let back = store.get(&digest).await.unwrap();
        assert_eq!(Digest::of(&back), digest);
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_write_mismatch_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let claimed = Digest::of(b"expected");

        let err = store.write(&claimed, b"tampered").await.unwrap_err();
        assert!(matches!(err, RemoteError::DigestMismatch { .. }));
        assert!(!store.has(&claimed).await);
        assert!(store.list().await.unwrap().is_empty());
        let ingest: Vec<_> = std::fs::read_dir(store.root().join("ingest")).unwrap().collect();
        assert!(ingest.is_empty());
    }

    #[tokio::test]
    async fn test_get_missing() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let err = store.get(&Digest::of(b"nope")).await.unwrap_err();
        assert!(matches!(err, RemoteError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn test_get_detects_corruption() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let digest = Digest::of(b"original");
        store.write(&digest, b"original").await.unwrap();

        std::fs::write(store.blob_path(&digest), b"corrupted").unwrap();
        let err = store.get(&digest).await.unwrap_err();
        assert!(matches!(err, RemoteError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn test_labels_require_object() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let mut labels = Labels::new();
        labels.insert("k".to_string(), "v".to_string());

        let err = store
            .update_labels(&Digest::of(b"absent"), &labels)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn test_labels_merge_and_overwrite() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let digest = Digest::of(b"obj");
        store.write(&digest, b"obj").await.unwrap();

        let mut first = Labels::new();
        first.insert("a".to_string(), "1".to_string());
        first.insert("b".to_string(), "2".to_string());
        store.update_labels(&digest, &first).await.unwrap();

        let mut second = Labels::new();
        second.insert("b".to_string(), "3".to_string());
        store.update_labels(&digest, &second).await.unwrap();

        let labels = store.labels(&digest).await.unwrap();
        assert_eq!(labels.get("a").map(String::as_str), Some("1"));
        assert_eq!(labels.get("b").map(String::as_str), Some("3"));
        // Digest unchanged by labeling
        assert_eq!(Digest::of(&store.get(&digest).await.unwrap()), digest);
    }

    #[tokio::test]
    async fn test_delete_and_clear_ingest() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let digest = Digest::of(b"gone");
        store.write(&digest, b"gone").await.unwrap();
        std::fs::write(store.root().join("ingest").join("partial"), b"half").unwrap();

        store.delete(&digest).await.unwrap();
        store.delete(&digest).await.unwrap();
        store.clear_ingest().await.unwrap();

        assert!(!store.has(&digest).await);
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(store.root().join("ingest")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_writes_converge() {
        let tmp = TempDir::new().unwrap();
        let store = std::sync::Arc::new(open(&tmp));
        let data = vec![7u8; 4096];
        let digest = Digest::of(&data);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let data = data.clone();
            let digest = digest.clone();
            handles.push(tokio::spawn(async move { store.write(&digest, &data).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(store.get(&digest).await.unwrap(), data);
    }
}
