//! Registry credential lookup.
//!
//! Credentials live at `<root>/auth/credentials.json`. Two layouts are
//! accepted: the native one
//!
//! ```json
//! { "registries": { "ghcr.io": { "username": "u", "password": "p" } } }
//! ```
//!
//! and the docker `config.json` one, where `auths.<host>.auth` is
//! `base64(username:password)`, so an existing docker login file can be
//! pointed at directly.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine;
use ctr_remote_core::error::{RemoteError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialEntry {
    username: String,
    password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    registries: HashMap<String, CredentialEntry>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    auths: HashMap<String, DockerAuth>,
}

/// Credential file for container registries.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store credentials for a registry, replacing any existing entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.load()?;
        file.registries.insert(
            normalize_registry(registry),
            CredentialEntry {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.save(&file)
    }

    /// Credentials for a registry as `(username, password)`.
    ///
    /// Native entries win over docker-style `auths` entries.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let file = self.load()?;
        let key = normalize_registry(registry);

        if let Some(entry) = file.registries.get(&key) {
            return Ok(Some((entry.username.clone(), entry.password.clone())));
        }

        let docker = file
            .auths
            .iter()
            .find(|(host, _)| normalize_registry(strip_scheme(host)) == key)
            .map(|(_, auth)| auth);
        match docker {
            Some(auth) => decode_docker_auth(registry, auth),
            None => Ok(None),
        }
    }

    fn load(&self) -> Result<CredentialFile> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CredentialFile::default())
            }
            Err(e) => {
                return Err(RemoteError::Config(format!(
                    "failed to read credential store {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        serde_json::from_str(&data).map_err(|e| {
            RemoteError::Config(format!(
                "failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Write tmp, then rename.
    fn save(&self, file: &CredentialFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, serde_json::to_string_pretty(file)?)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn decode_docker_auth(registry: &str, auth: &DockerAuth) -> Result<Option<(String, String)>> {
    if let (Some(u), Some(p)) = (&auth.username, &auth.password) {
        return Ok(Some((u.clone(), p.clone())));
    }
    let Some(encoded) = auth.auth.as_deref() else {
        return Ok(None);
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| RemoteError::Config(format!("bad auth entry for {}: {}", registry, e)))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| RemoteError::Config(format!("bad auth entry for {}: {}", registry, e)))?;
    match decoded.split_once(':') {
        Some((u, p)) => Ok(Some((u.to_string(), p.to_string()))),
        None => Err(RemoteError::Config(format!(
            "bad auth entry for {}: expected username:password",
            registry
        ))),
    }
}

fn strip_scheme(host: &str) -> &str {
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    host.split('/').next().unwrap_or(host)
}

/// Docker Hub aliases collapse to `index.docker.io`.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}
