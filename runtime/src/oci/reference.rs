//! OCI image reference parsing.
//!
//! Parses image references like `ghcr.io/org/app:v1` into structured components.

use ctr_remote_core::error::{RemoteError, Result};

use crate::content::Digest;

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/app")
    pub repository: String,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Manifest digest the reference is pinned to
    pub digest: Option<Digest>,
}

fn invalid(reference: &str, message: impl Into<String>) -> RemoteError {
    RemoteError::ReferenceInvalid {
        reference: reference.to_string(),
        message: message.into(),
    }
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `myuser/myimage` → docker.io/myuser/myimage:latest
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let original = reference;
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(original, "empty image reference"));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest = Digest::parse(&reference[at_pos + 1..])
                    .map_err(|e| invalid(reference, e))?;
                (&reference[..at_pos], Some(digest))
            }
            None => (reference, None),
        };

        // Split tag: the last colon after the last slash. Without a slash a
        // numeric suffix is a port, not a tag.
        let (name, tag) = match name_tag.rfind('/') {
            Some(slash_pos) => match name_tag[slash_pos + 1..].rfind(':') {
                Some(colon_pos) => {
                    let split = slash_pos + 1 + colon_pos;
                    (&name_tag[..split], Some(&name_tag[split + 1..]))
                }
                None => (name_tag, None),
            },
            None => match name_tag.rfind(':') {
                Some(colon_pos) => {
                    let after = &name_tag[colon_pos + 1..];
                    if digest.is_none() && after.chars().all(|c| c.is_ascii_digit()) {
                        (name_tag, None)
                    } else {
                        (&name_tag[..colon_pos], Some(after))
                    }
                }
                None => (name_tag, None),
            },
        };

        if let Some(tag) = tag {
            Self::validate_tag(reference, tag)?;
        }

        let (registry, repository) = Self::split_registry_repository(reference, name)?;

        // Apply default tag if no tag and no digest
        let tag = match (tag, &digest) {
            (Some(t), _) => Some(t.to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (None, Some(_)) => None,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    fn validate_tag(reference: &str, tag: &str) -> Result<()> {
        if tag.is_empty() || tag.len() > 128 {
            return Err(invalid(reference, "tag must be 1 to 128 characters"));
        }
        let mut chars = tag.chars();
        let first_ok = chars
            .next()
            .map(|c| c.is_ascii_alphanumeric() || c == '_')
            .unwrap_or(false);
        if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c)) {
            return Err(invalid(reference, format!("invalid tag '{}'", tag)));
        }
        Ok(())
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(reference: &str, name: &str) -> Result<(String, String)> {
        // The first component is a registry hostname if it contains a dot
        // or colon, or is "localhost"
        let (registry, repository) = match name.find('/') {
            Some(slash_pos)
                if {
                    let first = &name[..slash_pos];
                    first.contains('.') || first.contains(':') || first == "localhost"
                } =>
            {
                (name[..slash_pos].to_string(), name[slash_pos + 1..].to_string())
            }
            _ if name.contains('/') => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            // Single name like "nginx" → "library/nginx" for Docker Hub
            _ => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
        };

        if repository.is_empty() || repository.split('/').any(|c| c.is_empty()) {
            return Err(invalid(reference, "empty repository path component"));
        }
        let valid = repository
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/".contains(c));
        if !valid {
            return Err(invalid(
                reference,
                format!("repository '{}' must be lowercase alphanumeric", repository),
            ));
        }

        Ok((registry, repository))
    }

    /// `registry/repository`, the origin recorded in labels.
    pub fn source(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Same repository, pinned to a manifest digest.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: self.tag.clone(),
            digest: Some(digest),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.source();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest.as_str());
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_str() -> String {
        Digest::of(b"manifest").to_string()
    }

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, Some("1.25".to_string()));
    }

    #[test]
    fn test_parse_user_repo() {
        let r = ImageReference::parse("myuser/myimage").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "myuser/myimage");
        assert_eq!(r.tag, Some("latest".to_string()));
    }

    #[test]
    fn test_parse_custom_registry() {
        let r = ImageReference::parse("ghcr.io/org/app:v0.1.0").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/app");
        assert_eq!(r.tag, Some("v0.1.0".to_string()));
        assert_eq!(r.source(), "ghcr.io/org/app");
    }

    #[test]
    fn test_parse_digest_only() {
        let d = digest_str();
        let r = ImageReference::parse(&format!("ghcr.io/org/app@{}", d)).unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_ref().map(|d| d.to_string()), Some(d));
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let d = digest_str();
        let r = ImageReference::parse(&format!("ghcr.io/org/app:v1@{}", d)).unwrap();
        assert_eq!(r.tag, Some("v1".to_string()));
        assert!(r.digest.is_some());
        assert_eq!(r.full_reference(), format!("ghcr.io/org/app:v1@{}", d));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("myregistry.io:5000/myimage:v1").unwrap();
        assert_eq!(r.registry, "myregistry.io:5000");
        assert_eq!(r.repository, "myimage");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_localhost_registry() {
        let r = ImageReference::parse("localhost/myimage:test").unwrap();
        assert_eq!(r.registry, "localhost");
        assert_eq!(r.repository, "myimage");
    }

    #[test]
    fn test_parse_deep_repository_path() {
        let r = ImageReference::parse("ghcr.io/org/sub/image:v1").unwrap();
        assert_eq!(r.repository, "org/sub/image");
    }

    #[test]
    fn test_parse_whitespace_reference() {
        let r = ImageReference::parse("  nginx  ").unwrap();
        assert_eq!(r.repository, "library/nginx");
    }

    #[test]
    fn test_parse_rejects_empty() {
        let err = ImageReference::parse("").unwrap_err();
        assert!(matches!(err, RemoteError::ReferenceInvalid { .. }));
    }

    #[test]
    fn test_parse_rejects_bad_digest() {
        assert!(ImageReference::parse("nginx@invaliddigest").is_err());
        assert!(ImageReference::parse("nginx@sha256:abc").is_err());
    }

    #[test]
    fn test_parse_rejects_uppercase_repository() {
        let err = ImageReference::parse("ghcr.io/Org/App:v1").unwrap_err();
        assert!(matches!(err, RemoteError::ReferenceInvalid { .. }));
    }

    #[test]
    fn test_parse_rejects_bad_tag() {
        assert!(ImageReference::parse("nginx:-bad").is_err());
        assert!(ImageReference::parse("nginx:").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_component() {
        assert!(ImageReference::parse("ghcr.io//app").is_err());
        assert!(ImageReference::parse("ghcr.io/").is_err());
    }

    #[test]
    fn test_with_digest_pins() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        let d = Digest::of(b"m");
        let pinned = r.with_digest(d.clone());
        assert_eq!(pinned.digest, Some(d));
        assert_eq!(pinned.tag, r.tag);
    }

    #[test]
    fn test_display() {
        let r = ImageReference::parse("nginx:1.25").unwrap();
        assert_eq!(format!("{}", r), "docker.io/library/nginx:1.25");
    }
}
