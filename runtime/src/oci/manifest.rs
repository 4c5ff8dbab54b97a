//! Validated image manifest and layer descriptors.

use std::collections::BTreeMap;

use ctr_remote_core::labels::{
    LABEL_BOOTSTRAP_DIGEST, MEDIA_TYPE_DOCKER_LAYER_GZIP, MEDIA_TYPE_NYDUS_BLOB,
    MEDIA_TYPE_OCI_LAYER, MEDIA_TYPE_OCI_LAYER_GZIP, MEDIA_TYPE_OCI_LAYER_ZSTD,
};
use serde::{Deserialize, Serialize};

use crate::content::Digest;

/// Annotation carrying a layer's uncompressed size, when the producer set it.
pub const ANNOTATION_UNCOMPRESSED_SIZE: &str = "containerd.io/uncompressed-size";

/// Closed set of layer media types the pipeline recognizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    OciLayer,
    OciLayerGzip,
    OciLayerZstd,
    DockerLayerGzip,
    NydusBlob,
    Unknown(String),
}

impl MediaType {
    pub fn parse(s: &str) -> Self {
        match s {
            MEDIA_TYPE_OCI_LAYER => MediaType::OciLayer,
            MEDIA_TYPE_OCI_LAYER_GZIP => MediaType::OciLayerGzip,
            MEDIA_TYPE_OCI_LAYER_ZSTD => MediaType::OciLayerZstd,
            MEDIA_TYPE_DOCKER_LAYER_GZIP => MediaType::DockerLayerGzip,
            MEDIA_TYPE_NYDUS_BLOB => MediaType::NydusBlob,
            other => MediaType::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MediaType::OciLayer => MEDIA_TYPE_OCI_LAYER,
            MediaType::OciLayerGzip => MEDIA_TYPE_OCI_LAYER_GZIP,
            MediaType::OciLayerZstd => MEDIA_TYPE_OCI_LAYER_ZSTD,
            MediaType::DockerLayerGzip => MEDIA_TYPE_DOCKER_LAYER_GZIP,
            MediaType::NydusBlob => MEDIA_TYPE_NYDUS_BLOB,
            MediaType::Unknown(s) => s,
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Config descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

/// One layer of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// Content hash; the layer's identity
    pub digest: Digest,
    /// Compressed (blob) size
    pub size: u64,
    pub uncompressed_size: Option<u64>,
    pub media_type: String,
    pub annotations: BTreeMap<String, String>,
}

impl LayerDescriptor {
    pub fn media_type(&self) -> MediaType {
        MediaType::parse(&self.media_type)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Image manifest: config plus layers, index 0 being the base layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Digest of the manifest itself
    pub digest: Digest,
    pub config: Descriptor,
    pub layers: Vec<LayerDescriptor>,
}

impl Manifest {
    /// Every digest the manifest references: config, layers and any
    /// well-formed bootstrap annotation.
    pub fn referenced_digests(&self) -> Vec<Digest> {
        let mut digests = vec![self.config.digest.clone()];
        for layer in &self.layers {
            digests.push(layer.digest.clone());
            if let Some(Ok(bootstrap)) = layer.annotation(LABEL_BOOTSTRAP_DIGEST).map(Digest::parse) {
                digests.push(bootstrap);
            }
        }
        digests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(data: &[u8], media_type: &str) -> LayerDescriptor {
        LayerDescriptor {
            digest: Digest::of(data),
            size: data.len() as u64,
            uncompressed_size: None,
            media_type: media_type.to_string(),
            annotations: BTreeMap::new(),
        }
    }

    #[test]
    fn test_media_type_parse() {
        assert_eq!(MediaType::parse(MEDIA_TYPE_NYDUS_BLOB), MediaType::NydusBlob);
        assert_eq!(MediaType::parse(MEDIA_TYPE_OCI_LAYER_GZIP), MediaType::OciLayerGzip);
        assert_eq!(
            MediaType::parse("application/x-custom"),
            MediaType::Unknown("application/x-custom".to_string())
        );
        assert_eq!(MediaType::parse("application/x-custom").as_str(), "application/x-custom");
    }

    #[test]
    fn test_referenced_digests_include_bootstraps() {
        let bootstrap = Digest::of(b"bootstrap");
        let mut lazy = layer(b"blob", MEDIA_TYPE_NYDUS_BLOB);
        lazy.annotations
            .insert(LABEL_BOOTSTRAP_DIGEST.to_string(), bootstrap.to_string());
        let mut broken = layer(b"other", MEDIA_TYPE_NYDUS_BLOB);
        broken
            .annotations
            .insert(LABEL_BOOTSTRAP_DIGEST.to_string(), "sha256:short".to_string());

        let manifest = Manifest {
            digest: Digest::of(b"manifest"),
            config: Descriptor {
                media_type: "application/vnd.oci.image.config.v1+json".to_string(),
                digest: Digest::of(b"config"),
                size: 6,
            },
            layers: vec![layer(b"base", MEDIA_TYPE_OCI_LAYER_GZIP), lazy, broken],
        };

        let digests = manifest.referenced_digests();
        assert_eq!(digests.len(), 5);
        assert!(digests.contains(&bootstrap));
        assert!(digests.contains(&Digest::of(b"config")));
    }
}
