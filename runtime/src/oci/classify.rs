//! Layer classification: ordinary tar layer or lazy-loadable layer.
//!
//! Pure metadata inspection. A layer is lazy only when its media type is a
//! recognized lazy format and it carries a well-formed bootstrap digest
//! annotation; everything else is ordinary.

use std::collections::HashSet;

use ctr_remote_core::labels::{LABEL_BOOTSTRAP_DIGEST, LABEL_BOOTSTRAP_SIZE};

use super::manifest::{LayerDescriptor, MediaType};
use crate::content::Digest;

/// How a layer must be materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Fetch the full blob and unpack it.
    Ordinary { media_type: MediaType },
    /// Fetch only the bootstrap; data is read on demand.
    Lazy {
        bootstrap: Digest,
        /// Declared bootstrap size, if annotated
        size: Option<u64>,
    },
}

impl Classification {
    pub fn is_lazy(&self) -> bool {
        matches!(self, Classification::Lazy { .. })
    }
}

/// Classifies layers against the built-in lazy media type plus any
/// configured extras.
#[derive(Debug, Clone, Default)]
pub struct LayerClassifier {
    extra_lazy: HashSet<String>,
}

impl LayerClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also treat these media types as lazy formats.
    pub fn with_lazy_media_types<I, S>(mut self, media_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_lazy.extend(media_types.into_iter().map(Into::into));
        self
    }

    fn is_lazy_media_type(&self, media_type: &str) -> bool {
        MediaType::parse(media_type) == MediaType::NydusBlob || self.extra_lazy.contains(media_type)
    }

    pub fn classify(&self, layer: &LayerDescriptor) -> Classification {
        if self.is_lazy_media_type(&layer.media_type) {
            match layer.annotation(LABEL_BOOTSTRAP_DIGEST).map(Digest::parse) {
                Some(Ok(bootstrap)) => {
                    let size = layer
                        .annotation(LABEL_BOOTSTRAP_SIZE)
                        .and_then(|s| s.parse::<u64>().ok());
                    return Classification::Lazy { bootstrap, size };
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        digest = %layer.digest,
                        error = %e,
                        "Lazy layer has a malformed bootstrap annotation, treating as ordinary"
                    );
                }
                None => {
                    tracing::warn!(
                        digest = %layer.digest,
                        "Lazy layer has no bootstrap annotation, treating as ordinary"
                    );
                }
            }
        }

        Classification::Ordinary {
            media_type: layer.media_type(),
        }
    }
}
