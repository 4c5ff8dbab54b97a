//! Remote image pull pipeline.
//!
//! [`RemotePuller`] wires the stages together for one state root:
//!
//! ```text
//! lease ─► resolve ─► classify ─► fetch (parallel) ─► prepare chain ─► record
//! ```
//!
//! The lease is acquired before any network call and released on every exit
//! path. A pull whose image is already recorded with an intact chain is
//! answered from local state without touching the registry.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ctr_remote_core::config::RemoteConfig;
use ctr_remote_core::error::{RemoteError, Result, Stage};
use ctr_remote_core::labels::{KIND_LAZY, LABEL_CHAIN, LABEL_KIND};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use crate::content::{ContentRegistrar, ContentStore, Digest, Ensured, LeaseManager};
use crate::fetch::{FetchedLayer, LayerFetcher};
use crate::images::{ImageIndex, ImageRecord};
use crate::oci::{ImageReference, LayerClassifier, ManifestResolver, RegistryClient};
use crate::snapshot::driver::cancellable;
use crate::snapshot::{
    LocalSnapshotter, MountSpec, SnapshotChain, SnapshotDriver, SnapshotInfo, SnapshotState,
    Snapshotter,
};

/// Outcome of a pull.
#[derive(Debug, Clone)]
pub struct PullResult {
    pub reference: String,
    pub manifest_digest: Digest,
    /// Snapshot ids, base first
    pub chain: Vec<String>,
    /// Mount for the top of the chain
    pub mount: MountSpec,
    pub layers: usize,
    pub lazy_layers: usize,
    /// Objects fetched from the registry by this pull
    pub blobs_fetched: usize,
    pub bytes_fetched: u64,
    pub snapshots_prepared: usize,
    pub snapshots_reused: usize,
    /// Answered from local state without contacting the registry
    pub cached: bool,
}

/// What a `gc` pass removed.
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    pub content_removed: Vec<Digest>,
    pub snapshots_removed: Vec<String>,
}

/// Summary of the local state.
#[derive(Debug, Clone)]
pub struct PullerInfo {
    pub version: &'static str,
    pub root: PathBuf,
    pub images: usize,
    pub content_objects: usize,
    pub content_bytes: u64,
    /// Snapshot count per state
    pub snapshots: BTreeMap<String, usize>,
}

/// Pulls images into one state root.
pub struct RemotePuller {
    root: PathBuf,
    store: Arc<ContentStore>,
    registrar: Arc<ContentRegistrar>,
    leases: LeaseManager,
    resolver: ManifestResolver,
    classifier: LayerClassifier,
    fetcher: LayerFetcher,
    driver: SnapshotDriver,
    images: ImageIndex,
    max_concurrent_fetches: usize,
}

impl RemotePuller {
    /// Open the state under `config.root_dir` with the file-backed
    /// snapshotter.
    pub fn open(config: &RemoteConfig, registry: Arc<dyn RegistryClient>) -> Result<Self> {
        let snapshotter = LocalSnapshotter::open(&config.snapshots_dir())?
            .with_insecure_registries(config.insecure_registries.clone());
        Self::with_snapshotter(config, registry, Arc::new(snapshotter))
    }

    /// Open the state under `config.root_dir` driving `snapshotter`.
    pub fn with_snapshotter(
        config: &RemoteConfig,
        registry: Arc<dyn RegistryClient>,
        snapshotter: Arc<dyn Snapshotter>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(ContentStore::open(&config.content_dir())?);
        let registrar = Arc::new(ContentRegistrar::new(store.clone()));
        let leases = LeaseManager::new(store.clone(), Duration::from_secs(config.lease_ttl_secs));

        Ok(Self {
            root: config.root_dir.clone(),
            leases,
            resolver: ManifestResolver::new(registry.clone()),
            classifier: LayerClassifier::new()
                .with_lazy_media_types(config.lazy_media_types.iter().cloned()),
            fetcher: LayerFetcher::new(registry, registrar.clone()),
            driver: SnapshotDriver::new(snapshotter),
            images: ImageIndex::open(&config.images_path())?,
            store,
            registrar,
            max_concurrent_fetches: config.max_concurrent_fetches.max(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Pull `reference`, reusing local state when the image is already
    /// recorded with an intact chain.
    pub async fn pull(&self, reference: &str, cancel: &CancellationToken) -> Result<PullResult> {
        let reference = ImageReference::parse(reference)?;
        if let Some(result) = self.cached(&reference).await? {
            tracing::info!(reference = %reference, digest = %result.manifest_digest, "Image already prepared");
            return Ok(result);
        }
        self.pull_remote(&reference, cancel).await
    }

    /// Pull `reference`, always resolving against the registry.
    pub async fn force_pull(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<PullResult> {
        let reference = ImageReference::parse(reference)?;
        self.pull_remote(&reference, cancel).await
    }

    async fn pull_remote(
        &self,
        reference: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<PullResult> {
        let mut lease = self.leases.acquire()?;

        let manifest = cancellable(cancel, Stage::Resolve, self.resolver.resolve(reference)).await?;
        lease.add(manifest.referenced_digests())?;

        let classifications: Vec<_> = manifest
            .layers
            .iter()
            .map(|layer| self.classifier.classify(layer))
            .collect();
        let lazy_layers = classifications.iter().filter(|c| c.is_lazy()).count();
        tracing::info!(
            reference = %reference,
            layers = manifest.layers.len(),
            lazy = lazy_layers,
            "Classified layers"
        );

        let fetches = stream::iter(manifest.layers.iter().zip(classifications.iter()))
            .map(|(layer, classification)| self.fetcher.fetch(reference, layer, classification))
            .buffered(self.max_concurrent_fetches)
            .try_collect::<Vec<FetchedLayer>>();
        let fetched = cancellable(cancel, Stage::Fetch, fetches).await?;

        let (blobs_fetched, bytes_fetched) = fetched.iter().fold((0usize, 0u64), |(n, bytes), f| match f.ensured {
            Ensured::Fetched(size) => (n + 1, bytes + size),
            Ensured::Present => (n, bytes),
        });
        tracing::info!(
            reference = %reference,
            fetched = blobs_fetched,
            bytes = bytes_fetched,
            "Layer content ready"
        );

        let mut chain = SnapshotChain::new(manifest.digest.clone());
        for layer in &fetched {
            chain.push(
                layer.digest.clone(),
                self.store.blob_path(&layer.content),
                layer.labels.clone(),
            );
        }
        let outcome = self.driver.prepare_chain(&chain, cancel).await?;

        let ids = chain.ids();
        let committed = self.chain_committed(&ids).await?;
        let previous = self.images.get(&reference.to_string()).await;
        let now = Utc::now();
        let record = ImageRecord {
            reference: reference.to_string(),
            manifest_digest: manifest.digest.clone(),
            chain: ids,
            layers: fetched.iter().map(|f| f.digest.clone()).collect(),
            content: fetched.iter().map(|f| f.content.clone()).collect(),
            committed,
            pulled_at: now,
            updated_at: now,
        };
        self.images.put(record.clone()).await?;
        lease.release();

        if let Some(previous) = previous.filter(|p| p.chain != record.chain) {
            self.retire(&previous).await;
        }

        tracing::info!(
            reference = %reference,
            digest = %manifest.digest,
            snapshot = %outcome.mount.snapshot,
            "Pulled image"
        );
        Ok(PullResult {
            reference: record.reference,
            manifest_digest: record.manifest_digest,
            chain: record.chain,
            mount: outcome.mount,
            layers: fetched.len(),
            lazy_layers,
            blobs_fetched,
            bytes_fetched,
            snapshots_prepared: outcome.prepared,
            snapshots_reused: outcome.reused,
            cached: false,
        })
    }

    /// Answer a pull from the image index when every snapshot of the
    /// recorded chain is still usable and its content is still stored.
    async fn cached(&self, reference: &ImageReference) -> Result<Option<PullResult>> {
        let Some(record) = self.images.get(&reference.to_string()).await else {
            return Ok(None);
        };
        let Some(top) = record.top() else {
            return Ok(None);
        };

        let owner = record.manifest_digest.to_string();
        let mut lazy_layers = 0;
        for id in &record.chain {
            let Some(info) = self.driver.snapshotter().stat(id).await? else {
                return Ok(None);
            };
            let usable = match info.state {
                SnapshotState::Committed => true,
                SnapshotState::Prepared => info.label(LABEL_CHAIN) == Some(owner.as_str()),
                SnapshotState::Preparing | SnapshotState::Abandoned => false,
            };
            if !usable {
                tracing::debug!(id = %id, state = %info.state, "Recorded chain no longer usable");
                return Ok(None);
            }
            if info.label(LABEL_KIND) == Some(KIND_LAZY) {
                lazy_layers += 1;
            }
        }
        for digest in &record.content {
            if !self.registrar.has(digest).await {
                return Ok(None);
            }
        }

        let mount = match self.driver.snapshotter().mounts(top).await {
            Ok(mount) => mount,
            Err(e) => {
                tracing::debug!(reference = %reference, error = %e, "Recorded mount unavailable");
                return Ok(None);
            }
        };

        Ok(Some(PullResult {
            reference: record.reference.clone(),
            manifest_digest: record.manifest_digest.clone(),
            layers: record.layers.len(),
            chain: record.chain,
            mount,
            lazy_layers,
            blobs_fetched: 0,
            bytes_fetched: 0,
            snapshots_prepared: 0,
            snapshots_reused: record.layers.len(),
            cached: true,
        }))
    }

    /// Whether every snapshot of the chain is already committed.
    async fn chain_committed(&self, ids: &[String]) -> Result<bool> {
        for id in ids {
            let state = self.driver.snapshotter().stat(id).await?.map(|info| info.state);
            if state != Some(SnapshotState::Committed) {
                return Ok(false);
            }
        }
        Ok(!ids.is_empty())
    }

    /// Remove the part of a replaced chain that no recorded image uses.
    ///
    /// The new record is already in place, so a failure here only leaves
    /// unreferenced snapshots behind and does not fail the pull.
    async fn retire(&self, previous: &ImageRecord) {
        let in_use = self.images.live_snapshots(None).await;
        match self.driver.remove_image(&previous.chain, &in_use).await {
            Ok(removed) => tracing::info!(
                reference = %previous.reference,
                digest = %previous.manifest_digest,
                removed = removed.len(),
                "Removed replaced snapshot chain"
            ),
            Err(e) => tracing::warn!(
                reference = %previous.reference,
                digest = %previous.manifest_digest,
                error = %e,
                "Failed to remove replaced snapshot chain"
            ),
        }
    }

    async fn record(&self, reference: &str) -> Result<ImageRecord> {
        let key = ImageReference::parse(reference)?.to_string();
        self.images
            .get(&key)
            .await
            .ok_or(RemoteError::ImageNotFound(key))
    }

    /// Confirm the image's mount is usable, then commit its chain.
    pub async fn commit(&self, reference: &str) -> Result<ImageRecord> {
        let record = self.record(reference).await?;
        let top = record
            .top()
            .ok_or_else(|| RemoteError::Snapshot(format!("image {} has no snapshots", record.reference)))?;
        let mount = self.driver.snapshotter().mounts(top).await?;
        mount.verify()?;

        self.driver.commit_chain(&record.chain).await?;
        let record = self.images.set_committed(&record.reference).await?;
        tracing::info!(reference = %record.reference, "Committed image");
        Ok(record)
    }

    /// Abandon an uncommitted image's snapshots and forget the image.
    ///
    /// Returns how many snapshots were abandoned.
    pub async fn rollback(&self, reference: &str) -> Result<usize> {
        let record = self.record(reference).await?;
        if record.committed {
            return Err(RemoteError::Snapshot(format!(
                "image {} is committed; remove it instead",
                record.reference
            )));
        }
        let abandoned = self
            .driver
            .rollback_chain(&record.chain, &record.manifest_digest)
            .await?;
        self.images.remove(&record.reference).await?;
        Ok(abandoned)
    }

    /// Remove an image and the part of its chain no other image uses.
    ///
    /// Returns the removed snapshot ids.
    pub async fn remove(&self, reference: &str) -> Result<Vec<String>> {
        let record = self.record(reference).await?;
        let in_use = self.images.live_snapshots(Some(&record.reference)).await;
        let removed = self.driver.remove_image(&record.chain, &in_use).await?;
        self.images.remove(&record.reference).await?;
        tracing::info!(
            reference = %record.reference,
            removed = removed.len(),
            kept = record.chain.len() - removed.len(),
            "Removed image"
        );
        Ok(removed)
    }

    /// Delete unreferenced content and abandoned snapshots.
    ///
    /// Content survives when a live lease pins it, a recorded image
    /// references it, or it is labeled as a GC root.
    pub async fn gc(&self) -> Result<GcReport> {
        let mut live: HashSet<Digest> = self.leases.live_digests()?;
        live.extend(self.images.live_content().await);
        let content_removed = self.registrar.collect(&live, &self.leases).await?;

        let mut snapshots_removed = Vec::new();
        for info in self.driver.snapshotter().list().await? {
            if info.state == SnapshotState::Abandoned {
                self.driver.snapshotter().remove(&info.id).await?;
                snapshots_removed.push(info.id);
            }
        }

        tracing::info!(
            content = content_removed.len(),
            snapshots = snapshots_removed.len(),
            "Garbage collection finished"
        );
        Ok(GcReport {
            content_removed,
            snapshots_removed,
        })
    }

    pub async fn images(&self) -> Vec<ImageRecord> {
        self.images.list().await
    }

    pub async fn snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        self.driver.snapshotter().list().await
    }

    pub async fn info(&self) -> Result<PullerInfo> {
        let content = self.store.list().await?;
        let mut snapshots = BTreeMap::new();
        for info in self.snapshots().await? {
            *snapshots.entry(info.state.to_string()).or_insert(0) += 1;
        }
        Ok(PullerInfo {
            version: crate::VERSION,
            root: self.root.clone(),
            images: self.images.list().await.len(),
            content_objects: content.len(),
            content_bytes: content.iter().map(|c| c.size).sum(),
            snapshots,
        })
    }
}
