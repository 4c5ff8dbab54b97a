//! Manifest resolution.
//!
//! Turns an image reference into a validated [`Manifest`]. Manifest lists
//! are narrowed to the linux entry for the host architecture. Nothing is
//! written to the content store here.

use std::sync::Arc;

use ctr_remote_core::error::{RemoteError, Result};

use super::manifest::{Descriptor, LayerDescriptor, Manifest, ANNOTATION_UNCOMPRESSED_SIZE};
use super::reference::ImageReference;
use super::registry::{ManifestResponse, RawDescriptor, RawImageManifest, RawIndexEntry, RegistryClient};
use crate::content::Digest;

/// Resolves references to manifests through a registry client.
pub struct ManifestResolver {
    client: Arc<dyn RegistryClient>,
}

fn failed(reference: &ImageReference, message: impl Into<String>) -> RemoteError {
    RemoteError::ResolveFailed {
        reference: reference.to_string(),
        message: message.into(),
    }
}

impl ManifestResolver {
    pub fn new(client: Arc<dyn RegistryClient>) -> Self {
        Self { client }
    }

    /// Resolve `reference` to its manifest, layers ordered base first.
    pub async fn resolve(&self, reference: &ImageReference) -> Result<Manifest> {
        let response = self
            .client
            .fetch_manifest(reference)
            .await
            .map_err(|e| failed(reference, e.to_string()))?;

        let (raw, digest) = match response {
            ManifestResponse::Image { manifest, digest } => {
                let digest = parse_digest(reference, &digest, "manifest")?;
                check_pinned(reference, &digest)?;
                (manifest, digest)
            }
            ManifestResponse::Index { entries, digest } => {
                let index_digest = parse_digest(reference, &digest, "manifest list")?;
                check_pinned(reference, &index_digest)?;
                self.resolve_index_entry(reference, &entries).await?
            }
        };

        let manifest = validate(reference, raw, digest)?;
        tracing::info!(
            reference = %reference,
            digest = %manifest.digest,
            layers = manifest.layers.len(),
            "Resolved manifest"
        );
        Ok(manifest)
    }

    async fn resolve_index_entry(
        &self,
        reference: &ImageReference,
        entries: &[RawIndexEntry],
    ) -> Result<(RawImageManifest, Digest)> {
        let arch = host_architecture();
        let entry = select_platform(entries, arch).ok_or_else(|| {
            failed(
                reference,
                format!("manifest list has no entry for linux/{}", arch),
            )
        })?;
        let expected = parse_digest(reference, &entry.digest, "manifest list entry")?;
        tracing::debug!(reference = %reference, arch, digest = %expected, "Selected platform manifest");

        let pinned = reference.with_digest(expected.clone());
        let response = self
            .client
            .fetch_manifest(&pinned)
            .await
            .map_err(|e| failed(reference, e.to_string()))?;

        match response {
            ManifestResponse::Image { manifest, digest } => {
                let actual = parse_digest(reference, &digest, "manifest")?;
                if actual != expected {
                    return Err(failed(
                        reference,
                        format!(
                            "manifest list entry {} does not match fetched manifest {}",
                            expected, actual
                        ),
                    ));
                }
                Ok((manifest, actual))
            }
            ManifestResponse::Index { .. } => Err(failed(
                reference,
                format!("manifest list entry {} is itself a manifest list", expected),
            )),
        }
    }
}

fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn select_platform<'a>(entries: &'a [RawIndexEntry], arch: &str) -> Option<&'a RawIndexEntry> {
    entries
        .iter()
        .find(|e| e.os.as_deref() == Some("linux") && e.architecture.as_deref() == Some(arch))
}

fn parse_digest(reference: &ImageReference, digest: &str, what: &str) -> Result<Digest> {
    Digest::parse(digest).map_err(|e| failed(reference, format!("{} digest: {}", what, e)))
}

fn check_pinned(reference: &ImageReference, digest: &Digest) -> Result<()> {
    match &reference.digest {
        Some(pinned) if pinned != digest => Err(failed(
            reference,
            format!("registry returned {} for a reference pinned to {}", digest, pinned),
        )),
        _ => Ok(()),
    }
}

fn size_of(reference: &ImageReference, d: &RawDescriptor) -> Result<u64> {
    u64::try_from(d.size)
        .map_err(|_| failed(reference, format!("descriptor {} has negative size", d.digest)))
}

fn validate(reference: &ImageReference, raw: RawImageManifest, digest: Digest) -> Result<Manifest> {
    if raw.schema_version != 2 {
        return Err(failed(
            reference,
            format!("unsupported schema version {}", raw.schema_version),
        ));
    }

    let config = raw
        .config
        .ok_or_else(|| failed(reference, "manifest has no config descriptor"))?;
    let config = Descriptor {
        digest: parse_digest(reference, &config.digest, "config")?,
        size: size_of(reference, &config)?,
        media_type: config.media_type,
    };

    if raw.layers.is_empty() {
        return Err(failed(reference, "manifest has no layers"));
    }

    let mut layers = Vec::with_capacity(raw.layers.len());
    for (index, layer) in raw.layers.into_iter().enumerate() {
        if layer.media_type.is_empty() {
            return Err(failed(reference, format!("layer {} has no media type", index)));
        }
        let size = size_of(reference, &layer)?;
        let uncompressed_size = layer
            .annotations
            .get(ANNOTATION_UNCOMPRESSED_SIZE)
            .and_then(|s| s.parse::<u64>().ok());
        layers.push(LayerDescriptor {
            digest: parse_digest(reference, &layer.digest, &format!("layer {}", index))?,
            size,
            uncompressed_size,
            media_type: layer.media_type,
            annotations: layer.annotations,
        });
    }

    Ok(Manifest {
        digest,
        config,
        layers,
    })
}
