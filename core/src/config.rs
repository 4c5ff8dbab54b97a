use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RemoteError, Result};

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV: &str = "CTR_REMOTE_CONFIG";

/// ctr-remote configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// State root holding `content/`, `snapshots/` and `images.json`
    pub root_dir: PathBuf,

    /// Maximum number of layers fetched in parallel during one pull
    pub max_concurrent_fetches: usize,

    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,

    /// Media types treated as lazy in addition to the built-in nydus blob type
    pub lazy_media_types: Vec<String>,

    /// Lease lifetime in seconds; expired leases no longer pin content
    pub lease_ttl_secs: u64,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            max_concurrent_fetches: 4,
            insecure_registries: Vec::new(),
            lazy_media_types: Vec::new(),
            lease_ttl_secs: 3600, // 1 hour
            log_level: LogLevel::Warn,
        }
    }
}

impl RemoteConfig {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `$CTR_REMOTE_CONFIG` and then
    /// `~/.ctr-remote/config.yaml` are tried, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let candidate = std::env::var_os(CONFIG_ENV)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| default_root_dir().join("config.yaml"));
                if candidate.is_file() {
                    Self::from_file(&candidate)?
                } else {
                    Self::default()
                }
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            RemoteError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_str(&data)
            .map_err(|e| RemoteError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_fetches == 0 {
            return Err(RemoteError::Config(
                "max_concurrent_fetches must be at least 1".to_string(),
            ));
        }
        if self.lease_ttl_secs == 0 {
            return Err(RemoteError::Config(
                "lease_ttl_secs must be at least 1".to_string(),
            ));
        }
        if self.root_dir.as_os_str().is_empty() {
            return Err(RemoteError::Config("root_dir must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn content_dir(&self) -> PathBuf {
        self.root_dir.join("content")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root_dir.join("snapshots")
    }

    pub fn images_path(&self) -> PathBuf {
        self.root_dir.join("images.json")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.root_dir.join("auth").join("credentials.json")
    }
}

/// Default state root (`~/.ctr-remote`).
fn default_root_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".ctr-remote"))
        .unwrap_or_else(|| PathBuf::from(".ctr-remote"))
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: '{}' (supported: trace, debug, info, warn, error)",
                s
            )),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
