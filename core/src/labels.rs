//! Persisted label keys and well-known media types.
//!
//! Label keys are stored alongside content objects and snapshots. Existing
//! state directories are reused across versions, so these strings must
//! never change.
//!
//! # Label Schema
//!
//! - `containerd.io/snapshot/remote/source` - origin `registry/repository`
//! - `containerd.io/snapshot/remote/kind` - `lazy` or `eager`
//! - `containerd.io/snapshot/remote/layer-digest` - layer blob digest, the
//!   chunk source for on-demand reads
//! - `containerd.io/snapshot/remote/media-type` - layer media type
//! - `containerd.io/snapshot/remote/chain` - manifest digest of the image
//!   whose pull prepared a snapshot
//! - `containerd.io/snapshot/nydus-bootstrap-digest` - bootstrap digest,
//!   also read from layer annotations
//! - `containerd.io/snapshot/nydus-bootstrap-size` - optional bootstrap size
//!   annotation
//! - `containerd.io/gc.root` - content that garbage collection keeps

pub const LABEL_SOURCE: &str = "containerd.io/snapshot/remote/source";
pub const LABEL_KIND: &str = "containerd.io/snapshot/remote/kind";
pub const LABEL_LAYER_DIGEST: &str = "containerd.io/snapshot/remote/layer-digest";
pub const LABEL_MEDIA_TYPE: &str = "containerd.io/snapshot/remote/media-type";
pub const LABEL_CHAIN: &str = "containerd.io/snapshot/remote/chain";
pub const LABEL_BOOTSTRAP_DIGEST: &str = "containerd.io/snapshot/nydus-bootstrap-digest";
pub const LABEL_BOOTSTRAP_SIZE: &str = "containerd.io/snapshot/nydus-bootstrap-size";
pub const LABEL_GC_ROOT: &str = "containerd.io/gc.root";

/// Value of [`LABEL_KIND`] for lazily loaded layers.
pub const KIND_LAZY: &str = "lazy";
/// Value of [`LABEL_KIND`] for fully fetched layers.
pub const KIND_EAGER: &str = "eager";

pub const MEDIA_TYPE_OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MEDIA_TYPE_NYDUS_BLOB: &str = "application/vnd.oci.image.layer.nydus.blob.v1";
