//! In-memory registry double shared by the pipeline tests.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use ctr_remote_core::labels::{LABEL_BOOTSTRAP_DIGEST, MEDIA_TYPE_NYDUS_BLOB};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;

use crate::content::Digest;
use crate::oci::reference::ImageReference;
use crate::oci::registry::{
    ManifestResponse, RawDescriptor, RawImageManifest, RawIndexEntry, RegistryClient,
    RegistryError,
};

/// Descriptor for `data` without registering the bytes anywhere.
pub(crate) fn layer_blob(data: &[u8], media_type: &str) -> RawDescriptor {
    RawDescriptor {
        media_type: media_type.to_string(),
        digest: Digest::of(data).to_string(),
        size: data.len() as i64,
        annotations: BTreeMap::new(),
    }
}

pub(crate) fn raw_manifest(layers: &[RawDescriptor]) -> RawImageManifest {
    RawImageManifest {
        schema_version: 2,
        config: Some(layer_blob(
            b"{\"architecture\":\"amd64\",\"os\":\"linux\"}",
            "application/vnd.oci.image.config.v1+json",
        )),
        layers: layers.to_vec(),
    }
}

/// A gzip-compressed tar holding `files`.
pub(crate) fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

#[derive(Default)]
struct State {
    tags: HashMap<String, ManifestResponse>,
    by_digest: HashMap<Digest, ManifestResponse>,
    blobs: HashMap<Digest, Vec<u8>>,
    failing: HashSet<Digest>,
    manifest_fetches: usize,
    blob_fetches: Vec<Digest>,
}

/// Registry serving canned manifests and blobs, counting every request.
#[derive(Default)]
pub(crate) struct MockRegistry {
    state: Mutex<State>,
}

fn tag_key(reference: &str) -> String {
    let r = ImageReference::parse(reference).unwrap();
    format!("{}:{}", r.source(), r.tag.unwrap_or_default())
}

impl MockRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Serve `data` as a blob; returns its digest.
    pub(crate) fn add_blob(&self, data: &[u8]) -> Digest {
        let digest = Digest::of(data);
        self.state.lock().blobs.insert(digest.clone(), data.to_vec());
        digest
    }

    /// Serve `data` under a digest it does not hash to.
    pub(crate) fn add_corrupt_blob(&self, digest: &Digest, data: &[u8]) {
        self.state.lock().blobs.insert(digest.clone(), data.to_vec());
    }

    /// Fail every fetch of `digest` with a transport error.
    pub(crate) fn fail_blob(&self, digest: &Digest) {
        self.state.lock().failing.insert(digest.clone());
    }

    /// Serve an ordinary gzip tar layer; returns its descriptor.
    pub(crate) fn add_tar_layer(&self, files: &[(&str, &[u8])]) -> RawDescriptor {
        let data = tar_gz(files);
        self.add_blob(&data);
        layer_blob(&data, ctr_remote_core::labels::MEDIA_TYPE_OCI_LAYER_GZIP)
    }

    /// Serve a lazy layer's bootstrap but not its data blob.
    ///
    /// Returns the layer descriptor and the bootstrap digest.
    pub(crate) fn add_lazy_layer(&self, name: &str) -> (RawDescriptor, Digest) {
        let blob = format!("{}-data-blob-{}", name, "x".repeat(4096));
        let bootstrap = self.add_blob(format!("{}-bootstrap", name).as_bytes());
        let mut descriptor = layer_blob(blob.as_bytes(), MEDIA_TYPE_NYDUS_BLOB);
        descriptor
            .annotations
            .insert(LABEL_BOOTSTRAP_DIGEST.to_string(), bootstrap.to_string());
        (descriptor, bootstrap)
    }

    /// Serve `manifest` at a tag reference; returns the manifest digest.
    pub(crate) fn add_image(&self, reference: &str, manifest: RawImageManifest) -> Digest {
        let digest = Digest::of(format!("{:?}", manifest).as_bytes());
        let response = ManifestResponse::Image {
            manifest,
            digest: digest.to_string(),
        };
        let mut state = self.state.lock();
        state.tags.insert(tag_key(reference), response.clone());
        state.by_digest.insert(digest.clone(), response);
        digest
    }

    /// Serve a manifest list at `reference` with one `linux/<arch>` entry.
    ///
    /// Returns the entry's manifest digest.
    pub(crate) fn add_image_index(
        &self,
        reference: &str,
        manifest: RawImageManifest,
        arch: &str,
    ) -> Digest {
        let digest = Digest::of(format!("{:?}", manifest).as_bytes());
        let index_digest = Digest::of(format!("index:{}", digest).as_bytes());
        let mut state = self.state.lock();
        state.by_digest.insert(
            digest.clone(),
            ManifestResponse::Image {
                manifest,
                digest: digest.to_string(),
            },
        );
        state.tags.insert(
            tag_key(reference),
            ManifestResponse::Index {
                entries: vec![RawIndexEntry {
                    digest: digest.to_string(),
                    os: Some("linux".to_string()),
                    architecture: Some(arch.to_string()),
                }],
                digest: index_digest.to_string(),
            },
        );
        digest
    }

    /// Make fetches of manifest `key` report `returned` as their digest.
    pub(crate) fn override_manifest_digest(&self, key: &Digest, returned: Digest) {
        let mut state = self.state.lock();
        if let Some(ManifestResponse::Image { digest, .. }) = state.by_digest.get_mut(key) {
            *digest = returned.to_string();
        }
    }

    /// Serve manifest `target` when `alias` is requested.
    pub(crate) fn alias_manifest(&self, alias: &Digest, target: &Digest) {
        let mut state = self.state.lock();
        if let Some(response) = state.by_digest.get(target).cloned() {
            state.by_digest.insert(alias.clone(), response);
        }
    }

    pub(crate) fn manifest_fetches(&self) -> usize {
        self.state.lock().manifest_fetches
    }

    pub(crate) fn blob_fetches(&self) -> usize {
        self.state.lock().blob_fetches.len()
    }

    /// How many times `digest` was requested.
    pub(crate) fn fetch_count(&self, digest: &Digest) -> usize {
        self.state
            .lock()
            .blob_fetches
            .iter()
            .filter(|d| *d == digest)
            .count()
    }

    pub(crate) fn reset_counts(&self) {
        let mut state = self.state.lock();
        state.manifest_fetches = 0;
        state.blob_fetches.clear();
    }
}

#[async_trait]
impl RegistryClient for MockRegistry {
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<ManifestResponse, RegistryError> {
        let mut state = self.state.lock();
        state.manifest_fetches += 1;
        let found = match &reference.digest {
            Some(digest) => state.by_digest.get(digest).cloned(),
            None => state
                .tags
                .get(&format!(
                    "{}:{}",
                    reference.source(),
                    reference.tag.clone().unwrap_or_default()
                ))
                .cloned(),
        };
        found.ok_or(RegistryError::NotFound)
    }

    async fn fetch_blob(
        &self,
        _reference: &ImageReference,
        digest: &Digest,
        _size: Option<u64>,
    ) -> Result<Vec<u8>, RegistryError> {
        let mut state = self.state.lock();
        state.blob_fetches.push(digest.clone());
        if state.failing.contains(digest) {
            return Err(RegistryError::Transport("connection reset".to_string()));
        }
        state.blobs.get(digest).cloned().ok_or(RegistryError::NotFound)
    }
}
