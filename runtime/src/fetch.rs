//! Layer content fetching.
//!
//! Lazy layers fetch only their bootstrap object; ordinary layers fetch the
//! full blob. Both go through [`ContentRegistrar::ensure`], so an object
//! already in the store is never fetched again and concurrent requests for
//! the same digest collapse into one.

use std::sync::Arc;

use ctr_remote_core::error::{RemoteError, Result};
use ctr_remote_core::labels::{
    KIND_EAGER, KIND_LAZY, LABEL_BOOTSTRAP_DIGEST, LABEL_KIND, LABEL_LAYER_DIGEST,
    LABEL_MEDIA_TYPE, LABEL_SOURCE,
};

use crate::content::{ContentRegistrar, Digest, Ensured, Labels};
use crate::oci::{Classification, ImageReference, LayerDescriptor, RegistryClient, RegistryError};

/// A layer whose content object is in the store.
#[derive(Debug, Clone)]
pub struct FetchedLayer {
    /// Layer blob digest
    pub digest: Digest,
    pub classification: Classification,
    /// Stored object: the bootstrap for lazy layers, the blob otherwise
    pub content: Digest,
    /// Labels now attached to `content`
    pub labels: Labels,
    pub ensured: Ensured,
}

/// Fetches layer content into the store.
pub struct LayerFetcher {
    registry: Arc<dyn RegistryClient>,
    registrar: Arc<ContentRegistrar>,
}

impl LayerFetcher {
    pub fn new(registry: Arc<dyn RegistryClient>, registrar: Arc<ContentRegistrar>) -> Self {
        Self {
            registry,
            registrar,
        }
    }

    /// Make the content a classified layer needs locally available.
    pub async fn fetch(
        &self,
        reference: &ImageReference,
        layer: &LayerDescriptor,
        classification: &Classification,
    ) -> Result<FetchedLayer> {
        let (content, labels, ensured) = match classification {
            Classification::Lazy { bootstrap, size } => {
                let ensured = self.fetch_bootstrap(reference, bootstrap, *size).await?;
                let mut labels = Labels::new();
                labels.insert(LABEL_SOURCE.to_string(), reference.source());
                labels.insert(LABEL_KIND.to_string(), KIND_LAZY.to_string());
                labels.insert(LABEL_LAYER_DIGEST.to_string(), layer.digest.to_string());
                labels.insert(LABEL_BOOTSTRAP_DIGEST.to_string(), bootstrap.to_string());
                (bootstrap.clone(), labels, ensured)
            }
            Classification::Ordinary { media_type } => {
                let ensured = self.fetch_blob(reference, layer).await?;
                let mut labels = Labels::new();
                labels.insert(LABEL_SOURCE.to_string(), reference.source());
                labels.insert(LABEL_KIND.to_string(), KIND_EAGER.to_string());
                labels.insert(LABEL_LAYER_DIGEST.to_string(), layer.digest.to_string());
                labels.insert(LABEL_MEDIA_TYPE.to_string(), media_type.to_string());
                (layer.digest.clone(), labels, ensured)
            }
        };

        let labels = self.registrar.label_all(&content, &labels).await?;
        tracing::debug!(
            layer = %layer.digest,
            content = %content,
            lazy = classification.is_lazy(),
            fetched = ensured.was_fetched(),
            "Layer content ready"
        );

        Ok(FetchedLayer {
            digest: layer.digest.clone(),
            classification: classification.clone(),
            content,
            labels,
            ensured,
        })
    }

    /// Fetch a bootstrap object unless already stored.
    ///
    /// Only the bootstrap digest is requested from the registry, never the
    /// layer's data blob. A hash or size mismatch fails the fetch and stores
    /// nothing.
    pub async fn fetch_bootstrap(
        &self,
        reference: &ImageReference,
        bootstrap: &Digest,
        size: Option<u64>,
    ) -> Result<Ensured> {
        self.registrar
            .ensure(bootstrap, || async {
                let data = self
                    .registry
                    .fetch_blob(reference, bootstrap, size)
                    .await
                    .map_err(|e| match e {
                        RegistryError::NotFound => RemoteError::BootstrapNotFound {
                            digest: bootstrap.to_string(),
                        },
                        RegistryError::Transport(message) => RemoteError::BootstrapFetchFailed {
                            digest: bootstrap.to_string(),
                            message,
                        },
                    })?;

                if let Some(expected) = size {
                    if data.len() as u64 != expected {
                        return Err(RemoteError::BootstrapFetchFailed {
                            digest: bootstrap.to_string(),
                            message: format!(
                                "size mismatch: annotated {} bytes, received {}",
                                expected,
                                data.len()
                            ),
                        });
                    }
                }

                let actual = Digest::of(&data);
                if &actual != bootstrap {
                    return Err(RemoteError::BootstrapFetchFailed {
                        digest: bootstrap.to_string(),
                        message: format!("digest mismatch: received {}", actual),
                    });
                }

                tracing::debug!(digest = %bootstrap, size = data.len(), "Fetched bootstrap");
                Ok(data)
            })
            .await
    }

    /// Fetch an ordinary layer blob unless already stored.
    pub async fn fetch_blob(
        &self,
        reference: &ImageReference,
        layer: &LayerDescriptor,
    ) -> Result<Ensured> {
        self.registrar
            .ensure(&layer.digest, || async {
                let data = self
                    .registry
                    .fetch_blob(reference, &layer.digest, Some(layer.size))
                    .await
                    .map_err(|e| RemoteError::LayerFetchFailed {
                        digest: layer.digest.to_string(),
                        message: e.to_string(),
                    })?;
                tracing::debug!(digest = %layer.digest, size = data.len(), "Fetched layer blob");
                Ok(data)
            })
            .await
    }
}
