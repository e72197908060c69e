//! Configuration types and loading for the dirserv system.
//!
//! The main entry point is [`ServerConfig`], which represents the contents
//! of `config.yaml`: global settings plus one [`BackendConfig`] per served
//! suffix. Configuration is loaded with [`load_config`] (file merged with
//! `DIRSERV_*` environment overrides) and saved with [`save_config`].

use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read or written.
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// The configuration file contained invalid YAML.
    #[error("failed to parse config file: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Merging file and environment sources failed.
    #[error("failed to load configuration: {0}")]
    LoadError(#[from] Box<figment::Error>),

    /// A configuration value was invalid.
    #[error("invalid configuration value for key '{key}': {reason}")]
    InvalidValue {
        /// The configuration key that had an invalid value.
        key: String,
        /// A description of why the value is invalid.
        reason: String,
    },
}

/// A specialized `Result` type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Checkpoint thresholds for a backend's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Checkpoint after this many kilobytes of log.
    #[serde(default = "default_checkpoint_kbytes")]
    pub kbytes: u32,

    /// Checkpoint after this many minutes.
    #[serde(default = "default_checkpoint_minutes")]
    pub minutes: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            kbytes: default_checkpoint_kbytes(),
            minutes: default_checkpoint_minutes(),
        }
    }
}

fn default_checkpoint_kbytes() -> u32 {
    256
}

fn default_checkpoint_minutes() -> u32 {
    5
}

/// Restart policy for transient storage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Restarts allowed before giving up.
    #[serde(default = "default_max_retries", rename = "max-retries")]
    pub max_retries: u32,

    /// First backoff in milliseconds; doubles per retry.
    #[serde(default = "default_backoff_ms", rename = "backoff-ms")]
    pub backoff_ms: u64,

    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_backoff_cap_ms", rename = "backoff-cap-ms")]
    pub backoff_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    8
}

fn default_backoff_ms() -> u64 {
    10
}

fn default_backoff_cap_ms() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Backend config
// ---------------------------------------------------------------------------

/// Configuration of one backend (one served suffix).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// The suffix this backend serves (e.g., `dc=example,dc=com`).
    pub suffix: String,

    /// Path of the backing database; empty runs in memory.
    #[serde(default)]
    pub database: String,

    /// Attribute types mirrored into the value index.
    #[serde(default)]
    pub index: Vec<String>,

    /// Per-backend override of the global lastmod stamping default.
    #[serde(default)]
    pub lastmod: Option<bool>,

    /// A read-only backend refuses all writes.
    #[serde(default)]
    pub readonly: bool,

    /// Replication principal; set on replicas. Writes bound as anyone else
    /// are referred away.
    #[serde(default, rename = "update-dn")]
    pub update_dn: Option<String>,

    /// Referral URIs handed to writers that are not the replication
    /// principal; the global referral applies when empty.
    #[serde(default, rename = "update-referral")]
    pub update_referral: Vec<String>,

    /// Checkpoint thresholds; no checkpointing when absent.
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,

    /// Restart policy for transient storage errors.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl BackendConfig {
    /// A minimal backend serving `suffix` with defaults everywhere else.
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            database: String::new(),
            index: Vec::new(),
            lastmod: None,
            readonly: false,
            update_dn: None,
            update_referral: Vec::new(),
            checkpoint: None,
            retry: RetryConfig::default(),
        }
    }

    /// Whether operational-attribute stamping applies, given the global
    /// default.
    pub fn lastmod_enabled(&self, global_default: bool) -> bool {
        self.lastmod.unwrap_or(global_default)
    }

    /// A backend with a replication principal is a replica.
    pub fn is_replica(&self) -> bool {
        self.update_dn.is_some()
    }
}

// ---------------------------------------------------------------------------
// Server config
// ---------------------------------------------------------------------------

/// The whole server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Default referral URIs for names no backend serves.
    #[serde(default)]
    pub referral: Vec<String>,

    /// Global default for operational-attribute stamping; backends can
    /// override.
    #[serde(default = "default_lastmod")]
    pub lastmod: bool,

    /// Log filter directive (tracing syntax).
    #[serde(default = "default_log_filter", rename = "log-filter")]
    pub log_filter: String,

    /// The served backends.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            referral: Vec::new(),
            lastmod: default_lastmod(),
            log_filter: default_log_filter(),
            backends: Vec::new(),
        }
    }
}

fn default_lastmod() -> bool {
    true
}

fn default_log_filter() -> String {
    "dirserv=info".to_owned()
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Loads configuration from `<dir>/config.yaml`, merged with `DIRSERV_*`
/// environment variables. A missing or empty file yields defaults.
pub fn load_config(dir: &Path) -> Result<ServerConfig> {
    let config_path = dir.join("config.yaml");
    let config = Figment::new()
        .merge(Yaml::file(config_path))
        .merge(Env::prefixed("DIRSERV_").split("__"))
        .extract()
        .map_err(Box::new)?;
    Ok(config)
}

/// Saves configuration to `<dir>/config.yaml`.
pub fn save_config(dir: &Path, config: &ServerConfig) -> Result<()> {
    let content = serde_yaml::to_string(config)?;
    std::fs::write(dir.join("config.yaml"), content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(dir.path()).unwrap();
        assert!(cfg.lastmod);
        assert_eq!(cfg.log_filter, "dirserv=info");
        assert!(cfg.backends.is_empty());
        assert!(cfg.referral.is_empty());
    }

    #[test]
    fn yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ServerConfig {
            referral: vec!["ldap://master.example.com".to_owned()],
            lastmod: true,
            ..ServerConfig::default()
        };
        let mut backend = BackendConfig::new("dc=example,dc=com");
        backend.index = vec!["cn".to_owned(), "mail".to_owned()];
        backend.lastmod = Some(false);
        backend.checkpoint = Some(CheckpointConfig::default());
        cfg.backends.push(backend);

        save_config(dir.path(), &cfg).unwrap();
        let loaded = load_config(dir.path()).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn kebab_case_keys_parse() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            r#"
referral:
  - ldap://root.example.com
backends:
  - suffix: dc=example,dc=com
    index: [cn]
    update-dn: cn=replicator,dc=example,dc=com
    update-referral:
      - ldap://master.example.com
    retry:
      max-retries: 3
      backoff-ms: 5
"#,
        )
        .unwrap();

        let cfg = load_config(dir.path()).unwrap();
        let be = &cfg.backends[0];
        assert!(be.is_replica());
        assert_eq!(be.update_dn.as_deref(), Some("cn=replicator,dc=example,dc=com"));
        assert_eq!(be.update_referral, vec!["ldap://master.example.com"]);
        assert_eq!(be.retry.max_retries, 3);
        assert_eq!(be.retry.backoff_ms, 5);
        // Unset keys fall back to defaults.
        assert_eq!(be.retry.backoff_cap_ms, 1000);
        assert!(be.checkpoint.is_none());
    }

    #[test]
    fn lastmod_override_logic() {
        let mut be = BackendConfig::new("dc=example");
        assert!(be.lastmod_enabled(true));
        assert!(!be.lastmod_enabled(false));
        be.lastmod = Some(false);
        assert!(!be.lastmod_enabled(true));
        be.lastmod = Some(true);
        assert!(be.lastmod_enabled(false));
    }
}
