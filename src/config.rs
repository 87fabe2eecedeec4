//! Runtime configuration.
//!
//! Loaded once at startup from `config.toml` in the platform config
//! directory (override with `--config`). Every recognized field is
//! explicit and unknown keys are rejected, so a typo fails fast instead
//! of silently meaning nothing. Credentials never live in the file —
//! token and passphrase are named *environment variables*.

use crate::conflict::Strategy;
use crate::sync::SyncMode;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which blob store backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteBackend {
    /// A local directory (network share, externally synced folder).
    Fs,
    /// The Drive-like REST service.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyncSection {
    pub mode: SyncMode,
    /// Designated host device (`host_to_many` mode).
    pub host: bool,
    pub strategy: Strategy,
    pub auto_sync: bool,
    pub debounce_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            mode: SyncMode::Global,
            host: false,
            strategy: Strategy::PreferNewest,
            auto_sync: true,
            debounce_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RemoteSection {
    pub backend: RemoteBackend,
    /// Service root for the `http` backend.
    pub base_url: Option<String>,
    /// Directory for the `fs` backend; defaults to `<data_dir>/remote`.
    pub path: Option<PathBuf>,
    /// Remote folder blobs live under.
    pub folder: String,
    /// Environment variable holding the bearer token (`http` backend).
    pub token_env: String,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            backend: RemoteBackend::Fs,
            base_url: None,
            path: None,
            folder: "bookvault".into(),
            token_env: "BOOKVAULT_TOKEN".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EncryptionSection {
    pub enabled: bool,
    /// Environment variable holding the passphrase.
    pub passphrase_env: String,
}

impl Default for EncryptionSection {
    fn default() -> Self {
        Self {
            enabled: false,
            passphrase_env: "BOOKVAULT_PASSPHRASE".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackupSection {
    /// Prefer incremental payloads when a base exists.
    pub incremental: bool,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self { incremental: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScanSection {
    pub main_secs: u64,
    pub retry_secs: u64,
    pub deferred_secs: u64,
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            main_secs: 15 * 60,
            retry_secs: 2 * 60,
            deferred_secs: 10 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetrySection {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = crate::queue::RetryPolicy::default();
        Self {
            base_delay_secs: policy.base_delay_secs,
            max_delay_secs: policy.max_delay_secs,
            max_attempts: policy.max_attempts,
        }
    }
}

/// The whole configuration record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Override for the state/bookmarks directory.
    pub data_dir: Option<PathBuf>,
    pub verbose_logs: bool,
    pub sync: SyncSection,
    pub remote: RemoteSection,
    pub encryption: EncryptionSection,
    pub backup: BackupSection,
    pub scans: ScanSection,
    pub retry: RetrySection,
}

impl Config {
    /// Load from an explicit path, or from the default location. A
    /// missing file yields the defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read config at {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parse config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "bookvault")
            .context("cannot determine a config directory on this platform")?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Where mutable state lives.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let dirs = directories::ProjectDirs::from("", "", "bookvault")
            .context("cannot determine a data directory on this platform")?;
        Ok(dirs.data_dir().to_path_buf())
    }

    fn validate(&self) -> Result<()> {
        if self.remote.backend == RemoteBackend::Http && self.remote.base_url.is_none() {
            bail!("remote.backend = \"http\" requires remote.base_url");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.remote.backend, RemoteBackend::Fs);
        assert_eq!(config.scans.main_secs, 15 * 60);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.sync.auto_sync);
    }

    #[test]
    fn sections_parse() {
        let config: Config = toml::from_str(
            r#"
            verbose_logs = true

            [sync]
            mode = "host_to_many"
            host = true
            strategy = "prefer_local"

            [remote]
            backend = "http"
            base_url = "https://blobs.example.com/v1"

            [retry]
            base_delay_secs = 60
            "#,
        )
        .unwrap();
        assert!(config.verbose_logs);
        assert_eq!(config.sync.mode, SyncMode::HostToMany);
        assert!(config.sync.host);
        assert_eq!(config.sync.strategy, Strategy::PreferLocal);
        assert_eq!(config.remote.backend, RemoteBackend::Http);
        assert_eq!(config.retry.base_delay_secs, 60);
        // Untouched fields keep their defaults.
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("definitely_not_a_key = 1").is_err());
        assert!(toml::from_str::<Config>("[sync]\nshiny = true").is_err());
    }

    #[test]
    fn http_backend_requires_base_url() {
        let config: Config = toml::from_str("[remote]\nbackend = \"http\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_of_missing_file_yields_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::load(Some(&tmp.path().join("nope.toml"))).unwrap();
        assert_eq!(config.remote.folder, "bookvault");
    }
}
