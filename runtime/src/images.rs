//! Persistent index of pulled images.
//!
//! Maps an image reference to the manifest it resolved to and the snapshot
//! chain prepared for it. Backed by `images.json`, rewritten atomically on
//! every change. A record is only written once its pull has produced a
//! mount, so a failed or cancelled pull never leaves one behind.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ctr_remote_core::error::{RemoteError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::content::Digest;

/// A pulled image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Reference as given to the pull, normalized
    pub reference: String,
    pub manifest_digest: Digest,
    /// Snapshot ids, base first
    pub chain: Vec<String>,
    /// Layer digests, base first
    pub layers: Vec<Digest>,
    /// Stored objects the chain was prepared from
    pub content: Vec<Digest>,
    /// Whether the chain has been committed
    pub committed: bool,
    pub pulled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Top snapshot of the chain.
    pub fn top(&self) -> Option<&str> {
        self.chain.last().map(String::as_str)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    images: Vec<ImageRecord>,
}

/// Reference-keyed image index persisted as JSON.
pub struct ImageIndex {
    path: PathBuf,
    images: RwLock<HashMap<String, ImageRecord>>,
}

impl ImageIndex {
    /// Load the index at `path`, starting empty if the file does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        let images = match std::fs::read_to_string(path) {
            Ok(data) => {
                let file: IndexFile = serde_json::from_str(&data).map_err(|e| {
                    RemoteError::Serialization(format!(
                        "failed to parse image index {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                file.images
                    .into_iter()
                    .map(|record| (record.reference.clone(), record))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            images: RwLock::new(images),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, reference: &str) -> Option<ImageRecord> {
        self.images.read().await.get(reference).cloned()
    }

    /// Insert or replace the record for its reference.
    pub async fn put(&self, record: ImageRecord) -> Result<()> {
        let mut images = self.images.write().await;
        images.insert(record.reference.clone(), record);
        self.save(&images).await
    }

    pub async fn set_committed(&self, reference: &str) -> Result<ImageRecord> {
        let mut images = self.images.write().await;
        let record = images
            .get_mut(reference)
            .ok_or_else(|| RemoteError::ImageNotFound(reference.to_string()))?;
        record.committed = true;
        record.updated_at = Utc::now();
        let updated = record.clone();
        self.save(&images).await?;
        Ok(updated)
    }

    pub async fn remove(&self, reference: &str) -> Result<ImageRecord> {
        let mut images = self.images.write().await;
        let record = images
            .remove(reference)
            .ok_or_else(|| RemoteError::ImageNotFound(reference.to_string()))?;
        self.save(&images).await?;
        Ok(record)
    }

    /// All records, sorted by reference.
    pub async fn list(&self) -> Vec<ImageRecord> {
        let mut records: Vec<ImageRecord> = self.images.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.reference.cmp(&b.reference));
        records
    }

    /// Snapshot ids used by any image other than `except`.
    pub async fn live_snapshots(&self, except: Option<&str>) -> HashSet<String> {
        self.images
            .read()
            .await
            .values()
            .filter(|r| Some(r.reference.as_str()) != except)
            .flat_map(|r| r.chain.iter().cloned())
            .collect()
    }

    /// Content digests referenced by any image.
    pub async fn live_content(&self) -> HashSet<Digest> {
        self.images
            .read()
            .await
            .values()
            .flat_map(|r| {
                std::iter::once(r.manifest_digest.clone())
                    .chain(r.layers.iter().cloned())
                    .chain(r.content.iter().cloned())
            })
            .collect()
    }

    async fn save(&self, images: &HashMap<String, ImageRecord>) -> Result<()> {
        let mut records: Vec<ImageRecord> = images.values().cloned().collect();
        records.sort_by(|a, b| a.reference.cmp(&b.reference));
        let data = serde_json::to_vec_pretty(&IndexFile { images: records })?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
