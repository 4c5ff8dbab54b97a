//! Snapshot chain construction.
//!
//! A [`SnapshotChain`] is an ordered list of entries, base first, with an
//! id-indexed lookup table; each entry refers to its parent by position.
//! Snapshot ids are chain ids: the base layer's id is its digest and every
//! later id is `sha256(parent_id + " " + layer_digest)`, so two images
//! sharing a base prefix share those snapshot ids.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use ctr_remote_core::error::{RemoteError, Result, Stage};
use ctr_remote_core::labels::LABEL_CHAIN;
use tokio_util::sync::CancellationToken;

use super::{MountSpec, SnapshotState, Snapshotter};
use crate::content::{Digest, Labels};
use crate::locks::KeyedLocks;

/// Chain id of a layer stacked on `parent`.
pub fn chain_id(parent: Option<&str>, layer: &Digest) -> String {
    match parent {
        None => layer.to_string(),
        Some(parent) => Digest::of(format!("{} {}", parent, layer).as_bytes()).to_string(),
    }
}

/// One layer of a chain.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    /// Snapshot id (chain id)
    pub id: String,
    /// Position of the parent entry
    pub parent: Option<usize>,
    pub layer: Digest,
    /// Local content the snapshot is prepared from
    pub content: PathBuf,
    pub labels: Labels,
}

/// Ordered layers of one image plus an id index.
#[derive(Debug, Clone)]
pub struct SnapshotChain {
    /// Manifest digest of the image this chain belongs to
    owner: Digest,
    entries: Vec<ChainEntry>,
    index: HashMap<String, usize>,
}

impl SnapshotChain {
    pub fn new(owner: Digest) -> Self {
        Self {
            owner,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn owner(&self) -> &Digest {
        &self.owner
    }

    /// Stack a layer on top of the chain.
    pub fn push(&mut self, layer: Digest, content: PathBuf, labels: Labels) -> &ChainEntry {
        let parent = self.entries.len().checked_sub(1);
        let id = chain_id(parent.map(|p| self.entries[p].id.as_str()), &layer);
        let position = self.entries.len();
        self.index.insert(id.clone(), position);
        self.entries.push(ChainEntry {
            id,
            parent,
            layer,
            content,
            labels,
        });
        &self.entries[position]
    }

    pub fn get(&self, id: &str) -> Option<&ChainEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn parent_of(&self, entry: &ChainEntry) -> Option<&ChainEntry> {
        entry.parent.map(|i| &self.entries[i])
    }

    pub fn top(&self) -> Option<&ChainEntry> {
        self.entries.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainEntry> {
        self.entries.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of walking a chain.
#[derive(Debug, Clone)]
pub struct PrepareOutcome {
    pub mount: MountSpec,
    /// Layers prepared by this walk
    pub prepared: usize,
    /// Layers whose snapshot already existed
    pub reused: usize,
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, stage: Stage, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RemoteError::Cancelled { stage }),
        result = fut => result,
    }
}

/// Drives a [`Snapshotter`] across whole chains.
///
/// Concurrent walks that reach the same snapshot id take turns on it: the
/// later one waits for the earlier prepare and then sees its result.
pub struct SnapshotDriver {
    snapshotter: Arc<dyn Snapshotter>,
    locks: KeyedLocks<String>,
}

impl SnapshotDriver {
    pub fn new(snapshotter: Arc<dyn Snapshotter>) -> Self {
        Self {
            snapshotter,
            locks: KeyedLocks::new(),
        }
    }

    pub fn snapshotter(&self) -> &Arc<dyn Snapshotter> {
        &self.snapshotter
    }

    /// Prepare every layer base to top and return the top's mount.
    ///
    /// Existing snapshots are reused when committed, or when prepared by
    /// this same image. A snapshot another image prepared but has not
    /// committed is not used as a parent. Layers prepared before a failure
    /// or a cancellation are left in place for the next attempt.
    pub async fn prepare_chain(
        &self,
        chain: &SnapshotChain,
        cancel: &CancellationToken,
    ) -> Result<PrepareOutcome> {
        let top = chain.top().ok_or_else(|| {
            RemoteError::Snapshot(format!("image {} has an empty layer chain", chain.owner()))
        })?;
        let owner = chain.owner().to_string();
        let incomplete = |entry: &ChainEntry, message: String| RemoteError::ChainIncomplete {
            digest: entry.layer.to_string(),
            message,
        };

        let mut prepared = 0;
        let mut reused = 0;
        for entry in chain.iter() {
            if cancel.is_cancelled() {
                return Err(RemoteError::Cancelled {
                    stage: Stage::Snapshot,
                });
            }

            let _guard = cancellable(cancel, Stage::Snapshot, async {
                Ok(self.locks.lock(&entry.id).await)
            })
            .await?;
            let existing = self
                .snapshotter
                .stat(&entry.id)
                .await
                .map_err(|e| incomplete(entry, e.to_string()))?;
            match existing {
                Some(info) if info.state == SnapshotState::Committed => {
                    reused += 1;
                    continue;
                }
                Some(info) if info.state == SnapshotState::Prepared => {
                    if info.label(LABEL_CHAIN) == Some(owner.as_str()) {
                        reused += 1;
                        continue;
                    }
                    return Err(incomplete(
                        entry,
                        format!(
                            "snapshot {} was prepared by image {} and is not committed",
                            entry.id,
                            info.label(LABEL_CHAIN).unwrap_or("<unknown>")
                        ),
                    ));
                }
                _ => {}
            }

            let parent = chain.parent_of(entry).map(|p| p.id.as_str());
            let mut labels = entry.labels.clone();
            labels.insert(LABEL_CHAIN.to_string(), owner.clone());

            tracing::debug!(id = %entry.id, layer = %entry.layer, parent = ?parent, "Preparing snapshot");
            cancellable(
                cancel,
                Stage::Snapshot,
                self.snapshotter.prepare(&entry.id, parent, &labels, &entry.content),
            )
            .await
            .map_err(|e| match e {
                RemoteError::Cancelled { .. } => e,
                other => incomplete(entry, other.to_string()),
            })?;
            prepared += 1;
        }

        let mount = self
            .snapshotter
            .mounts(&top.id)
            .await
            .map_err(|e| incomplete(top, e.to_string()))?;

        tracing::info!(
            image = %chain.owner(),
            layers = chain.len(),
            prepared,
            reused,
            "Prepared snapshot chain"
        );
        Ok(PrepareOutcome {
            mount,
            prepared,
            reused,
        })
    }

    /// Commit a prepared chain, base first.
    pub async fn commit_chain(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.snapshotter.commit(id).await?;
        }
        tracing::info!(layers = ids.len(), "Committed snapshot chain");
        Ok(())
    }

    /// Abandon the uncommitted snapshots `owner` prepared, top first.
    ///
    /// Returns how many snapshots were abandoned.
    pub async fn rollback_chain(&self, ids: &[String], owner: &Digest) -> Result<usize> {
        let owner = owner.to_string();
        let mut abandoned = 0;
        for id in ids.iter().rev() {
            let Some(info) = self.snapshotter.stat(id).await? else {
                continue;
            };
            let owned = info.label(LABEL_CHAIN) == Some(owner.as_str());
            if owned && matches!(info.state, SnapshotState::Prepared | SnapshotState::Preparing) {
                self.snapshotter.abandon(id).await?;
                abandoned += 1;
            }
        }
        tracing::info!(image = %owner, abandoned, "Rolled back snapshot chain");
        Ok(abandoned)
    }

    /// Remove an image's snapshots leaf to root, stopping at the first
    /// snapshot another chain still uses.
    ///
    /// Returns the removed ids.
    pub async fn remove_image(&self, ids: &[String], in_use: &HashSet<String>) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for id in ids.iter().rev() {
            if in_use.contains(id) {
                tracing::debug!(id = %id, "Keeping shared snapshot");
                break;
            }
            self.snapshotter.remove(id).await?;
            removed.push(id.clone());
        }
        Ok(removed)
    }
}
