//! ctr-remote Runtime - remote image pull and snapshot preparation.
//!
//! Resolves an image reference, fetches only what a lazy-loading snapshotter
//! needs to mount it (bootstrap objects for lazy layers, full blobs for
//! ordinary ones), and drives the snapshotter across the layer chain.

#![allow(clippy::result_large_err)]

pub mod content;
pub mod fetch;
pub mod images;
mod locks;
pub mod oci;
pub mod pull;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types
pub use content::{ContentRegistrar, ContentStore, Digest, Labels, Lease, LeaseManager};
pub use fetch::{FetchedLayer, LayerFetcher};
pub use images::{ImageIndex, ImageRecord};
pub use oci::{Classification, ImageReference, LayerClassifier, Manifest, ManifestResolver};
pub use oci::{CredentialStore, OciRegistryClient, RegistryAuth, RegistryClient};
pub use pull::{GcReport, PullResult, PullerInfo, RemotePuller};
pub use snapshot::{LocalSnapshotter, MountSpec, SnapshotDriver, SnapshotInfo, SnapshotState, Snapshotter};

/// ctr-remote Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
