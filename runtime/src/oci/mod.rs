//! Registry-facing half of the pipeline.
//!
//! Reference parsing, manifest resolution through a [`RegistryClient`], and
//! layer classification. Nothing here writes to local state.
//!
//! ```text
//! reference ──► ManifestResolver ──► Manifest ──► LayerClassifier (per layer)
//!                     │                               │
//!              RegistryClient                Ordinary | Lazy(bootstrap)
//! ```

pub mod classify;
pub mod credentials;
pub mod manifest;
pub mod reference;
pub mod registry;
pub mod resolver;

pub use classify::{Classification, LayerClassifier};
pub use credentials::CredentialStore;
pub use manifest::{Descriptor, LayerDescriptor, Manifest, MediaType};
pub use reference::ImageReference;
pub use registry::{
    ManifestResponse, OciRegistryClient, RawDescriptor, RawImageManifest, RawIndexEntry,
    RegistryAuth, RegistryClient, RegistryError,
};
pub use resolver::ManifestResolver;
