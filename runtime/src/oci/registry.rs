//! Registry client collaborator.
//!
//! The pipeline only sees the [`RegistryClient`] trait: fetch a manifest,
//! fetch a blob by digest. [`OciRegistryClient`] implements it over the
//! `oci-distribution` crate. Neither performs retries; failures surface to
//! the caller, which owns retry policy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::{OciDescriptor, OciManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use parking_lot::Mutex;

use super::credentials::CredentialStore;
use super::reference::ImageReference;
use crate::content::Digest;

/// Failure reported by a registry client.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry has nothing at the requested reference or digest
    #[error("not found")]
    NotFound,
    /// Network, protocol, or authentication failure
    #[error("{0}")]
    Transport(String),
}

/// Descriptor as received, before validation.
#[derive(Debug, Clone, Default)]
pub struct RawDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    pub annotations: BTreeMap<String, String>,
}

/// Image manifest as received, before validation.
#[derive(Debug, Clone, Default)]
pub struct RawImageManifest {
    pub schema_version: u32,
    pub config: Option<RawDescriptor>,
    pub layers: Vec<RawDescriptor>,
}

/// One platform entry of a manifest list.
#[derive(Debug, Clone, Default)]
pub struct RawIndexEntry {
    pub digest: String,
    pub os: Option<String>,
    pub architecture: Option<String>,
}

/// What a manifest fetch returned.
#[derive(Debug, Clone)]
pub enum ManifestResponse {
    Image {
        manifest: RawImageManifest,
        digest: String,
    },
    Index {
        entries: Vec<RawIndexEntry>,
        digest: String,
    },
}

/// Registry operations the pipeline consumes.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetch the manifest (or manifest list) a reference points at.
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
    ) -> std::result::Result<ManifestResponse, RegistryError>;

    /// Fetch one blob from the reference's repository.
    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        digest: &Digest,
        size: Option<u64>,
    ) -> std::result::Result<Vec<u8>, RegistryError>;
}

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    /// Look up credentials in the credential file, then env vars, then
    /// fall back to anonymous.
    pub fn from_credential_store(credentials: &Path, registry: &str) -> Self {
        let store = CredentialStore::new(credentials.to_path_buf());
        match store.get(registry) {
            Ok(Some((username, password))) => Self::basic(username, password),
            Ok(None) => Self::from_env(),
            Err(e) => {
                tracing::warn!(registry, error = %e, "Ignoring unreadable credential store");
                Self::from_env()
            }
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    /// Convert to oci-distribution auth type.
    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// [`RegistryClient`] backed by `oci-distribution`.
pub struct OciRegistryClient {
    client: Client,
    auth: RegistryAuth,
    /// Repositories a pull token has been obtained for
    authenticated: Mutex<HashSet<String>>,
}

impl OciRegistryClient {
    /// Create a client. Registries in `insecure` are reached over plain HTTP.
    pub fn new(auth: RegistryAuth, insecure: &[String]) -> Self {
        let protocol = if insecure.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(insecure.to_vec())
        };
        let config = ClientConfig {
            protocol,
            ..Default::default()
        };

        Self {
            client: Client::new(config),
            auth,
            authenticated: Mutex::new(HashSet::new()),
        }
    }

    /// Convert an ImageReference to an oci-distribution Reference.
    fn to_oci_reference(&self, reference: &ImageReference) -> std::result::Result<Reference, RegistryError> {
        let ref_str = if let Some(ref digest) = reference.digest {
            format!("{}@{}", reference.source(), digest)
        } else {
            format!(
                "{}:{}",
                reference.source(),
                reference.tag.as_deref().unwrap_or("latest")
            )
        };

        ref_str
            .parse::<Reference>()
            .map_err(|e| RegistryError::Transport(format!("invalid OCI reference '{}': {}", ref_str, e)))
    }

    async fn ensure_authenticated(&self, reference: &ImageReference, oci_ref: &Reference) -> std::result::Result<(), RegistryError> {
        let key = reference.source();
        if self.authenticated.lock().contains(&key) {
            return Ok(());
        }
        self.client
            .auth(oci_ref, &self.auth.to_oci_auth(), RegistryOperation::Pull)
            .await
            .map_err(map_oci_error)?;
        self.authenticated.lock().insert(key);
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
    ) -> std::result::Result<ManifestResponse, RegistryError> {
        let oci_ref = self.to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();

        tracing::debug!(reference = %reference, "Fetching manifest");
        let (manifest, digest) = self
            .client
            .pull_manifest(&oci_ref, &auth)
            .await
            .map_err(map_oci_error)?;
        self.authenticated.lock().insert(reference.source());

        let response = match manifest {
            OciManifest::Image(image) => ManifestResponse::Image {
                manifest: RawImageManifest {
                    schema_version: u32::from(image.schema_version),
                    config: Some(raw_descriptor(&image.config)),
                    layers: image.layers.iter().map(raw_descriptor).collect(),
                },
                digest,
            },
            OciManifest::ImageIndex(index) => ManifestResponse::Index {
                entries: index
                    .manifests
                    .iter()
                    .map(|entry| RawIndexEntry {
                        digest: entry.digest.clone(),
                        os: entry.platform.as_ref().map(|p| p.os.clone()),
                        architecture: entry.platform.as_ref().map(|p| p.architecture.clone()),
                    })
                    .collect(),
                digest,
            },
        };
        Ok(response)
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        digest: &Digest,
        size: Option<u64>,
    ) -> std::result::Result<Vec<u8>, RegistryError> {
        let oci_ref = self.to_oci_reference(reference)?;
        self.ensure_authenticated(reference, &oci_ref).await?;

        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            size: size.map(|s| s as i64).unwrap_or_default(),
            ..Default::default()
        };

        tracing::debug!(reference = %reference, digest = %digest, "Fetching blob");
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&oci_ref, &descriptor, &mut data)
            .await
            .map_err(map_oci_error)?;
        Ok(data)
    }
}

fn raw_descriptor(d: &OciDescriptor) -> RawDescriptor {
    RawDescriptor {
        media_type: d.media_type.clone(),
        digest: d.digest.clone(),
        size: d.size,
        annotations: d
            .annotations
            .clone()
            .unwrap_or_else(HashMap::new)
            .into_iter()
            .collect(),
    }
}

fn map_oci_error(e: OciDistributionError) -> RegistryError {
    match e {
        OciDistributionError::ImageManifestNotFoundError(_) => RegistryError::NotFound,
        OciDistributionError::ServerError { code: 404, .. } => RegistryError::NotFound,
        OciDistributionError::RequestError(ref err)
            if err.status().map(|s| s.as_u16()) == Some(404) =>
        {
            RegistryError::NotFound
        }
        other => RegistryError::Transport(other.to_string()),
    }
}
