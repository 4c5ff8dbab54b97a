//! File-backed snapshotter.
//!
//! # Layout
//!
//! ```text
//! snapshots/
//! ├── metadata.json                 (every snapshot's state, parent, labels)
//! └── <id>/
//!     ├── fs/                       (unpacked layer, or lazy layer root)
//!     │   └── image/image.boot      (lazy layers only: bootstrap copy)
//!     └── backend.json              (lazy layers only: chunk source config)
//! ```
//!
//! Ordinary layers are unpacked into `fs/` at prepare time. Lazy layers get
//! their bootstrap plus a backend config pointing the mount helper at the
//! registry blob, so file data is fetched on first read.

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ctr_remote_core::error::{RemoteError, Result};
use ctr_remote_core::labels::{KIND_LAZY, LABEL_KIND, LABEL_LAYER_DIGEST, LABEL_MEDIA_TYPE, LABEL_SOURCE};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tar::Archive;
use tokio::sync::Mutex;

use super::{
    ExtraOption, MountSpec, SnapshotInfo, SnapshotState, Snapshotter, MOUNT_TYPE_BIND,
    MOUNT_TYPE_LAZY, MOUNT_TYPE_OVERLAY,
};
use crate::content::{Digest, Labels};
use crate::oci::MediaType;

const METADATA_FILE: &str = "metadata.json";
const BACKEND_CONFIG: &str = "backend.json";
const BOOTSTRAP_FILE: &str = "fs/image/image.boot";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Metadata {
    snapshots: BTreeMap<String, SnapshotInfo>,
}

/// Removes an id from the in-flight set when the prepare that owns it ends,
/// however it ends.
struct InFlight {
    set: Arc<parking_lot::Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

/// Snapshotter storing snapshots as directories under one root.
pub struct LocalSnapshotter {
    root: PathBuf,
    metadata: Mutex<Metadata>,
    in_flight: Arc<parking_lot::Mutex<HashSet<String>>>,
    insecure_registries: Vec<String>,
}

impl LocalSnapshotter {
    /// Open the snapshotter, reaping snapshots a previous process left in
    /// `Preparing`.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| {
            RemoteError::Snapshot(format!(
                "failed to create snapshot directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let path = root.join(METADATA_FILE);
        let mut metadata: Metadata = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Metadata::default(),
            Err(e) => return Err(e.into()),
        };

        let snapshotter = Self {
            root: root.to_path_buf(),
            metadata: Mutex::new(Metadata::default()),
            in_flight: Arc::new(parking_lot::Mutex::new(HashSet::new())),
            insecure_registries: Vec::new(),
        };

        let mut reaped = 0;
        for info in metadata.snapshots.values_mut() {
            if info.state == SnapshotState::Preparing {
                snapshotter.remove_dir(&info.id);
                info.state = SnapshotState::Abandoned;
                info.updated_at = Utc::now();
                reaped += 1;
            }
        }
        if reaped > 0 {
            tracing::info!(reaped, "Reaped stale preparing snapshots");
            snapshotter.save(&metadata)?;
        }

        Ok(Self {
            metadata: Mutex::new(metadata),
            ..snapshotter
        })
    }

    /// Registries whose lazy layers are read over plain HTTP.
    pub fn with_insecure_registries(mut self, registries: Vec<String>) -> Self {
        self.insecure_registries = registries;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.root.join(id.replace([':', '/'], "_"))
    }

    fn remove_dir(&self, id: &str) {
        let dir = self.snapshot_dir(id);
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(id, path = %dir.display(), error = %e, "Failed to remove snapshot directory");
            }
        }
    }

    fn save(&self, metadata: &Metadata) -> Result<()> {
        let path = self.root.join(METADATA_FILE);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(metadata)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Fill a snapshot directory from the layer content.
    async fn populate(&self, id: &str, labels: &Labels, content: &Path) -> Result<()> {
        let dir = self.snapshot_dir(id);
        let fs_dir = dir.join("fs");
        tokio::fs::create_dir_all(&fs_dir).await?;

        if labels.get(LABEL_KIND).map(String::as_str) == Some(KIND_LAZY) {
            let bootstrap = dir.join(BOOTSTRAP_FILE);
            if let Some(parent) = bootstrap.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(content, &bootstrap).await.map_err(|e| {
                RemoteError::Snapshot(format!(
                    "failed to install bootstrap {} for snapshot {}: {}",
                    content.display(),
                    id,
                    e
                ))
            })?;
            let config = self.backend_config(id, labels)?;
            tokio::fs::write(dir.join(BACKEND_CONFIG), serde_json::to_vec_pretty(&config)?).await?;
            tracing::debug!(id, bootstrap = %bootstrap.display(), "Installed lazy layer");
        } else {
            let media_type = labels.get(LABEL_MEDIA_TYPE).map(|m| MediaType::parse(m));
            let content = content.to_path_buf();
            let target = fs_dir.clone();
            tokio::task::spawn_blocking(move || unpack_layer(&content, &target, media_type.as_ref()))
                .await
                .map_err(|e| RemoteError::Snapshot(format!("unpack task failed: {}", e)))??;
            tracing::debug!(id, target = %fs_dir.display(), "Unpacked layer");
        }
        Ok(())
    }

    /// Registry backend config for the mount helper's on-demand reads.
    fn backend_config(&self, id: &str, labels: &Labels) -> Result<serde_json::Value> {
        let source = labels.get(LABEL_SOURCE).ok_or_else(|| {
            RemoteError::Snapshot(format!("lazy snapshot {} has no source label", id))
        })?;
        let (host, repo) = source.split_once('/').ok_or_else(|| {
            RemoteError::Snapshot(format!("lazy snapshot {} has malformed source '{}'", id, source))
        })?;
        let blob = labels
            .get(LABEL_LAYER_DIGEST)
            .map(|d| Digest::parse(d))
            .transpose()
            .map_err(|e| RemoteError::Snapshot(format!("lazy snapshot {}: {}", id, e)))?
            .ok_or_else(|| {
                RemoteError::Snapshot(format!("lazy snapshot {} has no layer digest label", id))
            })?;
        let scheme = if self.insecure_registries.iter().any(|r| r == host) {
            "http"
        } else {
            "https"
        };

        Ok(serde_json::json!({
            "device": {
                "backend": {
                    "type": "registry",
                    "config": {
                        "scheme": scheme,
                        "host": host,
                        "repo": repo,
                        "blob_id": blob.hex(),
                    }
                }
            },
            "mode": "direct",
            "digest_validate": true,
        }))
    }

    fn mount_for(&self, metadata: &Metadata, id: &str) -> Result<MountSpec> {
        // Walk to the root; `chain` ends up top first.
        let mut chain: Vec<&SnapshotInfo> = Vec::new();
        let mut current = Some(id);
        while let Some(cid) = current {
            let info = metadata
                .snapshots
                .get(cid)
                .ok_or_else(|| RemoteError::Snapshot(format!("snapshot {} does not exist", cid)))?;
            if !matches!(info.state, SnapshotState::Prepared | SnapshotState::Committed) {
                return Err(RemoteError::Snapshot(format!(
                    "snapshot {} is {}, not mountable",
                    cid, info.state
                )));
            }
            if chain.len() > metadata.snapshots.len() {
                return Err(RemoteError::Snapshot(format!("parent cycle at snapshot {}", cid)));
            }
            chain.push(info);
            current = info.parent.as_deref();
        }

        let lazy = chain.iter().any(|info| is_lazy(info));

        if chain.len() == 1 && !lazy {
            return Ok(MountSpec {
                snapshot: id.to_string(),
                mount_type: MOUNT_TYPE_BIND.to_string(),
                source: self.snapshot_dir(id).join("fs").display().to_string(),
                options: vec!["rbind".to_string()],
            });
        }

        let lower: Vec<String> = chain
            .iter()
            .map(|info| self.snapshot_dir(&info.id).join("fs").display().to_string())
            .collect();
        let mut options = vec![format!("lowerdir={}", lower.join(":"))];
        if lazy {
            for info in chain.iter().filter(|info| is_lazy(info)) {
                let dir = self.snapshot_dir(&info.id);
                let extra = ExtraOption {
                    source: dir.join(BOOTSTRAP_FILE).display().to_string(),
                    config: dir.join(BACKEND_CONFIG).display().to_string(),
                    snapshotdir: dir.display().to_string(),
                };
                options.push(format!("extraoption={}", extra.encode()?));
            }
        }

        Ok(MountSpec {
            snapshot: id.to_string(),
            mount_type: if lazy { MOUNT_TYPE_LAZY } else { MOUNT_TYPE_OVERLAY }.to_string(),
            source: "overlay".to_string(),
            options,
        })
    }
}

fn is_lazy(info: &SnapshotInfo) -> bool {
    info.label(LABEL_KIND) == Some(KIND_LAZY)
}

/// Unpack a tar layer, gzip-compressed or not, into `target`.
fn unpack_layer(path: &Path, target: &Path, media_type: Option<&MediaType>) -> Result<()> {
    match media_type {
        Some(MediaType::OciLayerZstd) => {
            return Err(RemoteError::Snapshot(format!(
                "zstd layer {} cannot be unpacked",
                path.display()
            )))
        }
        Some(MediaType::NydusBlob) => {
            return Err(RemoteError::Snapshot(format!(
                "lazy-format layer {} has no usable bootstrap and cannot be unpacked",
                path.display()
            )))
        }
        Some(MediaType::Unknown(other)) if !other.contains("tar") => {
            return Err(RemoteError::Snapshot(format!(
                "unsupported layer media type {}",
                other
            )))
        }
        _ => {}
    }

    let mut file = std::fs::File::open(path).map_err(|e| {
        RemoteError::Snapshot(format!("failed to open layer {}: {}", path.display(), e))
    })?;
    let mut magic = [0u8; 2];
    let gzip = matches!(file.read_exact(&mut magic), Ok(()) if magic == [0x1f, 0x8b]);
    file.seek(SeekFrom::Start(0))?;

    let unpacked = if gzip {
        Archive::new(GzDecoder::new(file)).unpack(target)
    } else {
        Archive::new(file).unpack(target)
    };
    unpacked.map_err(|e| {
        RemoteError::Snapshot(format!(
            "failed to extract layer {} to {}: {}",
            path.display(),
            target.display(),
            e
        ))
    })
}

#[async_trait]
impl Snapshotter for LocalSnapshotter {
    async fn stat(&self, id: &str) -> Result<Option<SnapshotInfo>> {
        Ok(self.metadata.lock().await.snapshots.get(id).cloned())
    }

    async fn prepare(
        &self,
        id: &str,
        parent: Option<&str>,
        labels: &Labels,
        content: &Path,
    ) -> Result<MountSpec> {
        let _in_flight = {
            let mut metadata = self.metadata.lock().await;
            let busy = self.in_flight.lock().contains(id);

            if let Some(existing) = metadata.snapshots.get(id) {
                match existing.state {
                    SnapshotState::Prepared | SnapshotState::Committed => {
                        if existing.parent.as_deref() != parent {
                            return Err(RemoteError::Snapshot(format!(
                                "snapshot {} already exists with parent {:?}",
                                id, existing.parent
                            )));
                        }
                        return self.mount_for(&metadata, id);
                    }
                    SnapshotState::Preparing if busy => {
                        return Err(RemoteError::Snapshot(format!(
                            "snapshot {} is already being prepared",
                            id
                        )));
                    }
                    SnapshotState::Preparing | SnapshotState::Abandoned => {
                        tracing::info!(id, state = %existing.state, "Reaping stale snapshot before prepare");
                        self.remove_dir(id);
                    }
                }
            }

            if let Some(p) = parent {
                match metadata.snapshots.get(p).map(|info| info.state) {
                    Some(SnapshotState::Prepared | SnapshotState::Committed) => {}
                    Some(state) => {
                        return Err(RemoteError::Snapshot(format!(
                            "parent {} of snapshot {} is {}",
                            p, id, state
                        )))
                    }
                    None => {
                        return Err(RemoteError::Snapshot(format!(
                            "parent {} of snapshot {} does not exist",
                            p, id
                        )))
                    }
                }
            }

            let now = Utc::now();
            metadata.snapshots.insert(
                id.to_string(),
                SnapshotInfo {
                    id: id.to_string(),
                    parent: parent.map(str::to_string),
                    state: SnapshotState::Preparing,
                    labels: labels.clone(),
                    created_at: now,
                    updated_at: now,
                },
            );
            if let Err(e) = self.save(&metadata) {
                metadata.snapshots.remove(id);
                return Err(e);
            }

            self.in_flight.lock().insert(id.to_string());
            InFlight {
                set: self.in_flight.clone(),
                id: id.to_string(),
            }
        };

        let result = self.populate(id, labels, content).await;

        let mut metadata = self.metadata.lock().await;
        match result {
            Ok(()) => {
                if let Some(info) = metadata.snapshots.get_mut(id) {
                    info.state = SnapshotState::Prepared;
                    info.updated_at = Utc::now();
                }
                self.save(&metadata)?;
                tracing::debug!(id, parent = ?parent, "Prepared snapshot");
                self.mount_for(&metadata, id)
            }
            Err(e) => {
                metadata.snapshots.remove(id);
                self.remove_dir(id);
                if let Err(save_err) = self.save(&metadata) {
                    tracing::warn!(id, error = %save_err, "Failed to persist snapshot metadata");
                }
                Err(e)
            }
        }
    }

    async fn mounts(&self, id: &str) -> Result<MountSpec> {
        let metadata = self.metadata.lock().await;
        self.mount_for(&metadata, id)
    }

    async fn commit(&self, id: &str) -> Result<()> {
        let mut metadata = self.metadata.lock().await;
        let info = metadata
            .snapshots
            .get_mut(id)
            .ok_or_else(|| RemoteError::Snapshot(format!("snapshot {} does not exist", id)))?;
        match info.state {
            SnapshotState::Committed => return Ok(()),
            SnapshotState::Prepared => {
                info.state = SnapshotState::Committed;
                info.updated_at = Utc::now();
            }
            state => {
                return Err(RemoteError::Snapshot(format!(
                    "cannot commit snapshot {} in state {}",
                    id, state
                )))
            }
        }
        self.save(&metadata)?;
        tracing::debug!(id, "Committed snapshot");
        Ok(())
    }

    async fn abandon(&self, id: &str) -> Result<()> {
        let busy = self.in_flight.lock().contains(id);
        let mut metadata = self.metadata.lock().await;
        let Some(info) = metadata.snapshots.get_mut(id) else {
            return Ok(());
        };
        match info.state {
            SnapshotState::Abandoned => return Ok(()),
            SnapshotState::Committed => {
                return Err(RemoteError::Snapshot(format!(
                    "snapshot {} is committed and cannot be abandoned",
                    id
                )))
            }
            SnapshotState::Preparing if busy => {
                return Err(RemoteError::Snapshot(format!(
                    "snapshot {} is being prepared",
                    id
                )))
            }
            SnapshotState::Preparing | SnapshotState::Prepared => {
                info.state = SnapshotState::Abandoned;
                info.updated_at = Utc::now();
            }
        }
        self.remove_dir(id);
        self.save(&metadata)?;
        tracing::debug!(id, "Abandoned snapshot");
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        if self.in_flight.lock().contains(id) {
            return Err(RemoteError::Snapshot(format!(
                "snapshot {} is being prepared",
                id
            )));
        }
        let mut metadata = self.metadata.lock().await;
        if !metadata.snapshots.contains_key(id) {
            return Ok(());
        }

        let (live, abandoned): (Vec<_>, Vec<_>) = metadata
            .snapshots
            .values()
            .filter(|info| info.parent.as_deref() == Some(id))
            .partition(|info| info.state != SnapshotState::Abandoned);
        if let Some(child) = live.first() {
            return Err(RemoteError::Snapshot(format!(
                "snapshot {} still has child {}",
                id, child.id
            )));
        }
        let abandoned: Vec<String> = abandoned.into_iter().map(|info| info.id.clone()).collect();

        for child in &abandoned {
            metadata.snapshots.remove(child);
            self.remove_dir(child);
        }
        metadata.snapshots.remove(id);
        self.remove_dir(id);
        self.save(&metadata)?;
        tracing::debug!(id, "Removed snapshot");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SnapshotInfo>> {
        let metadata = self.metadata.lock().await;
        let mut snapshots: Vec<SnapshotInfo> = metadata.snapshots.values().cloned().collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tar_gz;
    use ctr_remote_core::labels::{KIND_EAGER, MEDIA_TYPE_OCI_LAYER_GZIP};
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        snapshotter: LocalSnapshotter,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let snapshotter = LocalSnapshotter::open(&tmp.path().join("snapshots")).unwrap();
        Fixture { tmp, snapshotter }
    }

    fn write_content(tmp: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = tmp.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn eager_labels() -> Labels {
        let mut labels = Labels::new();
        labels.insert(LABEL_KIND.to_string(), KIND_EAGER.to_string());
        labels.insert(LABEL_MEDIA_TYPE.to_string(), MEDIA_TYPE_OCI_LAYER_GZIP.to_string());
        labels
    }

    fn lazy_labels(layer: &Digest) -> Labels {
        let mut labels = Labels::new();
        labels.insert(LABEL_KIND.to_string(), KIND_LAZY.to_string());
        labels.insert(LABEL_SOURCE.to_string(), "ghcr.io/org/app".to_string());
        labels.insert(LABEL_LAYER_DIGEST.to_string(), layer.to_string());
        labels
    }

    #[tokio::test]
    async fn test_prepare_unpacks_ordinary_layer() {
        let f = fixture();
        let content = write_content(&f.tmp, "base", &tar_gz(&[("etc/os-release", b"ID=test")]));

        let mount = f
            .snapshotter
            .prepare("base", None, &eager_labels(), &content)
            .await
            .unwrap();

        assert_eq!(mount.mount_type, MOUNT_TYPE_BIND);
        assert_eq!(mount.snapshot, "base");
        let unpacked = Path::new(&mount.source).join("etc/os-release");
        assert_eq!(std::fs::read_to_string(unpacked).unwrap(), "ID=test");
        mount.verify().unwrap();

        let info = f.snapshotter.stat("base").await.unwrap().unwrap();
        assert_eq!(info.state, SnapshotState::Prepared);
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let f = fixture();
        let content = write_content(&f.tmp, "base", &tar_gz(&[("a", b"1")]));
        let first = f.snapshotter.prepare("base", None, &eager_labels(), &content).await.unwrap();
        let second = f.snapshotter.prepare("base", None, &eager_labels(), &content).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.snapshotter.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prepare_requires_parent() {
        let f = fixture();
        let content = write_content(&f.tmp, "l", &tar_gz(&[("a", b"1")]));
        let err = f
            .snapshotter
            .prepare("child", Some("missing"), &eager_labels(), &content)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Snapshot(_)));
        assert!(f.snapshotter.stat("child").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_prepare_leaves_no_record() {
        let f = fixture();
        let content = write_content(&f.tmp, "garbage", b"not a tarball at all, just bytes");
        let mut labels = eager_labels();
        labels.insert(LABEL_MEDIA_TYPE.to_string(), "application/vnd.oci.image.layer.v1.tar+zstd".to_string());

        assert!(f.snapshotter.prepare("bad", None, &labels, &content).await.is_err());
        assert!(f.snapshotter.stat("bad").await.unwrap().is_none());
        assert!(!f.snapshotter.snapshot_dir("bad").exists());
    }

    #[tokio::test]
    async fn test_lazy_layer_mount() {
        let f = fixture();
        let base = write_content(&f.tmp, "base", &tar_gz(&[("bin/sh", b"#!")]));
        let bootstrap = write_content(&f.tmp, "bootstrap", b"rafs bootstrap");
        let layer = Digest::of(b"lazy blob");

        f.snapshotter.prepare("base", None, &eager_labels(), &base).await.unwrap();
        let mount = f
            .snapshotter
            .prepare("top", Some("base"), &lazy_labels(&layer), &bootstrap)
            .await
            .unwrap();

        assert!(mount.is_lazy());
        assert_eq!(mount.snapshot, "top");
        let lower = mount.lower_dirs();
        assert_eq!(lower.len(), 2);
        assert!(lower[0].ends_with("top/fs"));
        assert!(lower[1].ends_with("base/fs"));

        let extras = mount.extra_options().unwrap();
        assert_eq!(extras.len(), 1);
        assert_eq!(std::fs::read(&extras[0].source).unwrap(), b"rafs bootstrap");
        let config: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&extras[0].config).unwrap()).unwrap();
        assert_eq!(config["device"]["backend"]["type"], "registry");
        assert_eq!(config["device"]["backend"]["config"]["host"], "ghcr.io");
        assert_eq!(config["device"]["backend"]["config"]["repo"], "org/app");
        assert_eq!(config["device"]["backend"]["config"]["blob_id"], layer.hex());
        assert_eq!(config["device"]["backend"]["config"]["scheme"], "https");
        assert_eq!(config["digest_validate"], true);
        mount.verify().unwrap();
    }

    #[tokio::test]
    async fn test_insecure_registry_scheme() {
        let tmp = TempDir::new().unwrap();
        let snapshotter = LocalSnapshotter::open(&tmp.path().join("s"))
            .unwrap()
            .with_insecure_registries(vec!["ghcr.io".to_string()]);
        let bootstrap = write_content(&tmp, "bootstrap", b"boot");
        let mount = snapshotter
            .prepare("lazy", None, &lazy_labels(&Digest::of(b"x")), &bootstrap)
            .await
            .unwrap();
        let extra = &mount.extra_options().unwrap()[0];
        let config: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&extra.config).unwrap()).unwrap();
        assert_eq!(config["device"]["backend"]["config"]["scheme"], "http");
    }

    #[tokio::test]
    async fn test_commit_and_abandon() {
        let f = fixture();
        let content = write_content(&f.tmp, "l", &tar_gz(&[("a", b"1")]));
        f.snapshotter.prepare("a", None, &eager_labels(), &content).await.unwrap();
        f.snapshotter.prepare("b", None, &eager_labels(), &content).await.unwrap();

        f.snapshotter.commit("a").await.unwrap();
        f.snapshotter.commit("a").await.unwrap();
        assert!(f.snapshotter.abandon("a").await.is_err());

        f.snapshotter.abandon("b").await.unwrap();
        let b = f.snapshotter.stat("b").await.unwrap().unwrap();
        assert_eq!(b.state, SnapshotState::Abandoned);
        assert!(f.snapshotter.commit("b").await.is_err());
        assert!(f.snapshotter.mounts("b").await.is_err());
    }

    #[tokio::test]
    async fn test_remove_refuses_with_children() {
        let f = fixture();
        let content = write_content(&f.tmp, "l", &tar_gz(&[("a", b"1")]));
        f.snapshotter.prepare("base", None, &eager_labels(), &content).await.unwrap();
        f.snapshotter.prepare("top", Some("base"), &eager_labels(), &content).await.unwrap();

        assert!(f.snapshotter.remove("base").await.is_err());
        f.snapshotter.remove("top").await.unwrap();
        f.snapshotter.remove("top").await.unwrap();
        f.snapshotter.remove("base").await.unwrap();
        assert!(f.snapshotter.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_reaps_stale_preparing() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("snapshots");
        {
            let snapshotter = LocalSnapshotter::open(&root).unwrap();
            let mut metadata = snapshotter.metadata.lock().await;
            let now = Utc::now();
            metadata.snapshots.insert(
                "stale".to_string(),
                SnapshotInfo {
                    id: "stale".to_string(),
                    parent: None,
                    state: SnapshotState::Preparing,
                    labels: Labels::new(),
                    created_at: now,
                    updated_at: now,
                },
            );
            snapshotter.save(&metadata).unwrap();
            std::fs::create_dir_all(snapshotter.snapshot_dir("stale").join("fs")).unwrap();
        }

        let reopened = LocalSnapshotter::open(&root).unwrap();
        let info = reopened.stat("stale").await.unwrap().unwrap();
        assert_eq!(info.state, SnapshotState::Abandoned);
        assert!(!reopened.snapshot_dir("stale").exists());
    }

    #[tokio::test]
    async fn test_prepare_redoes_stale_preparing() {
        let f = fixture();
        let content = write_content(&f.tmp, "l", &tar_gz(&[("a", b"1")]));
        {
            let mut metadata = f.snapshotter.metadata.lock().await;
            let now = Utc::now();
            metadata.snapshots.insert(
                "base".to_string(),
                SnapshotInfo {
                    id: "base".to_string(),
                    parent: None,
                    state: SnapshotState::Preparing,
                    labels: Labels::new(),
                    created_at: now,
                    updated_at: now,
                },
            );
        }

        f.snapshotter.prepare("base", None, &eager_labels(), &content).await.unwrap();
        let info = f.snapshotter.stat("base").await.unwrap().unwrap();
        assert_eq!(info.state, SnapshotState::Prepared);
    }

    #[tokio::test]
    async fn test_metadata_persists() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("snapshots");
        let content = write_content(&tmp, "l", &tar_gz(&[("a", b"1")]));
        {
            let snapshotter = LocalSnapshotter::open(&root).unwrap();
            snapshotter.prepare("base", None, &eager_labels(), &content).await.unwrap();
            snapshotter.commit("base").await.unwrap();
        }
        let reopened = LocalSnapshotter::open(&root).unwrap();
        let info = reopened.stat("base").await.unwrap().unwrap();
        assert_eq!(info.state, SnapshotState::Committed);
        reopened.mounts("base").await.unwrap().verify().unwrap();
    }
}
