//! Snapshotter collaborator and the chain driver on top of it.
//!
//! A snapshot moves through `Preparing → Prepared → Committed | Abandoned`.
//! The pipeline only talks to the [`Snapshotter`] trait; [`LocalSnapshotter`]
//! is the file-backed implementation the CLI uses.

pub mod driver;
pub mod local;

use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use ctr_remote_core::error::{RemoteError, Result};
use serde::{Deserialize, Serialize};

use crate::content::Labels;

pub use driver::{chain_id, ChainEntry, PrepareOutcome, SnapshotChain, SnapshotDriver};
pub use local::LocalSnapshotter;

/// Mount type for a chain made only of ordinary layers.
pub const MOUNT_TYPE_OVERLAY: &str = "overlay";
/// Mount type for a single ordinary layer.
pub const MOUNT_TYPE_BIND: &str = "bind";
/// Mount type handed to the lazy-loading mount helper.
pub const MOUNT_TYPE_LAZY: &str = "fuse.nydus-overlayfs";

/// Lifecycle state of one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotState {
    Preparing,
    Prepared,
    Committed,
    Abandoned,
}

impl std::fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SnapshotState::Preparing => "preparing",
            SnapshotState::Prepared => "prepared",
            SnapshotState::Committed => "committed",
            SnapshotState::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Snapshot metadata as reported by a snapshotter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub parent: Option<String>,
    pub state: SnapshotState,
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SnapshotInfo {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Everything the lazy mount helper needs for one lazy layer, carried
/// base64-encoded in an `extraoption=` mount option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraOption {
    /// Bootstrap file path
    pub source: String,
    /// Backend config path
    pub config: String,
    pub snapshotdir: String,
}

impl ExtraOption {
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let json = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| RemoteError::Snapshot(format!("malformed extraoption: {}", e)))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// How to mount the top of a snapshot chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Snapshot the spec mounts
    pub snapshot: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    pub options: Vec<String>,
}

impl MountSpec {
    /// Lower directories, top first.
    pub fn lower_dirs(&self) -> Vec<&str> {
        self.options
            .iter()
            .filter_map(|o| o.strip_prefix("lowerdir="))
            .flat_map(|dirs| dirs.split(':'))
            .collect()
    }

    pub fn extra_options(&self) -> Result<Vec<ExtraOption>> {
        self.options
            .iter()
            .filter_map(|o| o.strip_prefix("extraoption="))
            .map(ExtraOption::decode)
            .collect()
    }

    pub fn is_lazy(&self) -> bool {
        self.mount_type == MOUNT_TYPE_LAZY
    }

    /// Check that every path the mount refers to exists.
    pub fn verify(&self) -> Result<()> {
        let missing = |path: &str| {
            RemoteError::Snapshot(format!(
                "mount for snapshot {} refers to missing path {}",
                self.snapshot, path
            ))
        };

        if self.mount_type == MOUNT_TYPE_BIND && !Path::new(&self.source).exists() {
            return Err(missing(self.source.as_str()));
        }
        for dir in self.lower_dirs() {
            if !Path::new(dir).is_dir() {
                return Err(missing(dir));
            }
        }
        for extra in self.extra_options()? {
            for path in [&extra.source, &extra.config] {
                if !Path::new(path).is_file() {
                    return Err(missing(path.as_str()));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for MountSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "type={} source={} options={}",
            self.mount_type,
            self.source,
            self.options.join(",")
        )
    }
}

/// Snapshot operations the driver consumes.
///
/// `prepare`, `commit` and `remove` are idempotent for a given id.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn stat(&self, id: &str) -> Result<Option<SnapshotInfo>>;

    /// Create an active snapshot on top of `parent` from the layer content
    /// at `content`, and return its mount.
    async fn prepare(
        &self,
        id: &str,
        parent: Option<&str>,
        labels: &Labels,
        content: &Path,
    ) -> Result<MountSpec>;

    /// Mount for an existing prepared or committed snapshot.
    async fn mounts(&self, id: &str) -> Result<MountSpec>;

    async fn commit(&self, id: &str) -> Result<()>;

    /// Mark a snapshot that will never be committed as abandoned.
    async fn abandon(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<SnapshotInfo>>;
}
