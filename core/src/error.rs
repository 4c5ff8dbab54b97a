use thiserror::Error;

/// Pipeline stage an error is attributed to.
///
/// The CLI prints this next to every failure so the user knows which part
/// of the remote pull broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Reference,
    Resolve,
    Classify,
    Fetch,
    Store,
    Snapshot,
    Lease,
    Config,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Reference => "reference",
            Stage::Resolve => "resolve",
            Stage::Classify => "classify",
            Stage::Fetch => "fetch",
            Stage::Store => "store",
            Stage::Snapshot => "snapshot",
            Stage::Lease => "lease",
            Stage::Config => "config",
        };
        f.write_str(name)
    }
}

/// ctr-remote error types
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The image reference could not be parsed
    #[error("Invalid image reference '{reference}': {message}")]
    ReferenceInvalid { reference: String, message: String },

    /// Registry unreachable or manifest malformed
    #[error("Failed to resolve {reference}: {message}")]
    ResolveFailed { reference: String, message: String },

    /// Network or verification failure while fetching a bootstrap
    #[error("Failed to fetch bootstrap {digest}: {message}")]
    BootstrapFetchFailed { digest: String, message: String },

    /// The registry has no object at the bootstrap digest
    #[error("Bootstrap {digest} not found in registry")]
    BootstrapNotFound { digest: String },

    /// Network failure while fetching an ordinary layer blob
    #[error("Failed to fetch layer {digest}: {message}")]
    LayerFetchFailed { digest: String, message: String },

    /// Stored bytes do not hash to the key they were stored under
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// No content object stored under the digest
    #[error("Content object {digest} not found")]
    ObjectNotFound { digest: String },

    /// Snapshot chain construction stopped at a layer
    #[error("Snapshot chain incomplete at layer {digest}: {message}")]
    ChainIncomplete { digest: String, message: String },

    /// The lease backing a pull could not be acquired
    #[error("Lease unavailable: {0}")]
    LeaseUnavailable(String),

    /// The pull was cancelled
    #[error("Cancelled during {stage}")]
    Cancelled { stage: Stage },

    /// Snapshotter state or I/O error outside a chain walk
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// No recorded image for the reference
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Pipeline stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            RemoteError::ReferenceInvalid { .. } => Stage::Reference,
            RemoteError::ResolveFailed { .. } => Stage::Resolve,
            RemoteError::BootstrapFetchFailed { .. }
            | RemoteError::BootstrapNotFound { .. }
            | RemoteError::LayerFetchFailed { .. } => Stage::Fetch,
            RemoteError::DigestMismatch { .. }
            | RemoteError::ObjectNotFound { .. }
            | RemoteError::Serialization(_)
            | RemoteError::Io(_) => Stage::Store,
            RemoteError::ChainIncomplete { .. }
            | RemoteError::Snapshot(_)
            | RemoteError::ImageNotFound(_) => Stage::Snapshot,
            RemoteError::LeaseUnavailable(_) => Stage::Lease,
            RemoteError::Cancelled { stage } => *stage,
            RemoteError::Config(_) => Stage::Config,
        }
    }

    /// Whether a caller-owned retry could succeed.
    ///
    /// Digest mismatches and malformed input never are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::ResolveFailed { .. }
                | RemoteError::BootstrapFetchFailed { .. }
                | RemoteError::LayerFetchFailed { .. }
                | RemoteError::ChainIncomplete { .. }
                | RemoteError::Cancelled { .. }
        )
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for RemoteError {
    fn from(err: serde_yaml::Error) -> Self {
        RemoteError::Serialization(err.to_string())
    }
}

/// Result type alias for ctr-remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_invalid_display() {
        let error = RemoteError::ReferenceInvalid {
            reference: "".to_string(),
            message: "empty".to_string(),
        };
        assert_eq!(error.to_string(), "Invalid image reference '': empty");
        assert_eq!(error.stage(), Stage::Reference);
    }

    #[test]
    fn test_digest_mismatch_display() {
        let error = RemoteError::DigestMismatch {
            expected: "sha256:aaa".to_string(),
            actual: "sha256:bbb".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Digest mismatch: expected sha256:aaa, got sha256:bbb"
        );
        assert_eq!(error.stage(), Stage::Store);
        assert!(!error.is_transient());
    }

    #[test]
    fn test_chain_incomplete_names_layer() {
        let error = RemoteError::ChainIncomplete {
            digest: "sha256:abc".to_string(),
            message: "prepare failed".to_string(),
        };
        assert!(error.to_string().contains("sha256:abc"));
        assert_eq!(error.stage(), Stage::Snapshot);
        assert!(error.is_transient());
    }

    #[test]
    fn test_bootstrap_errors_are_fetch_stage() {
        let not_found = RemoteError::BootstrapNotFound {
            digest: "sha256:b1".to_string(),
        };
        assert_eq!(not_found.stage(), Stage::Fetch);
        assert!(!not_found.is_transient());

        let failed = RemoteError::BootstrapFetchFailed {
            digest: "sha256:b1".to_string(),
            message: "connection reset".to_string(),
        };
        assert_eq!(failed.stage(), Stage::Fetch);
        assert!(failed.is_transient());
    }

    #[test]
    fn test_cancelled_reports_its_stage() {
        let error = RemoteError::Cancelled {
            stage: Stage::Snapshot,
        };
        assert_eq!(error.stage(), Stage::Snapshot);
        assert_eq!(error.to_string(), "Cancelled during snapshot");
    }

    #[test]
    fn test_lease_unavailable_stage() {
        let error = RemoteError::LeaseUnavailable("store offline".to_string());
        assert_eq!(error.stage(), Stage::Lease);
        assert_eq!(error.to_string(), "Lease unavailable: store offline");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: RemoteError = io_error.into();
        assert!(matches!(error, RemoteError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: RemoteError = err.into();
        assert!(matches!(error, RemoteError::Serialization(_)));
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Resolve.to_string(), "resolve");
        assert_eq!(Stage::Lease.to_string(), "lease");
    }
}
