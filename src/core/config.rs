//! Configuration parsing and validation.
//!
//! The server loads a TOML file with CLI overrides; the client honors a
//! JSON deploy-configuration document describing how to reach the service
//! (directly or through the L4 proxy).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener and handshake configuration.
    pub server: ServerSection,

    /// Store tuning.
    #[serde(default)]
    pub store: StoreSection,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// Listener and handshake configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Bind address (e.g., "0.0.0.0:5447").
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Scratch root; each shuffle gets a directory beneath it.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,

    /// Directory holding cert.pem, key.pem, and optionally ca.pem.
    #[serde(default)]
    pub tls_dir: Option<String>,

    /// Allow plaintext connections for development and testing.
    #[serde(default)]
    pub insecure: bool,

    /// JSON file mapping namespace to a base64 32-byte session token.
    /// When absent, the handshake accepts any token pair.
    #[serde(default)]
    pub token_file: Option<String>,

    /// Idle-connection read timeout in seconds.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

/// Store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Memtable payload size that triggers a flush to a run file.
    #[serde(default = "default_memtable_flush_bytes")]
    pub memtable_flush_bytes: usize,

    /// Run count that triggers compaction.
    #[serde(default = "default_max_runs")]
    pub max_runs: usize,

    /// Reservoir capacity for partition-bound sampling.
    #[serde(default = "default_sample_capacity")]
    pub sample_capacity: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            memtable_flush_bytes: default_memtable_flush_bytes(),
            max_runs: default_max_runs(),
            sample_capacity: default_sample_capacity(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySection {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:5447".to_string()
}

fn default_scratch_dir() -> String {
    "/tmp/riffle".to_string()
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_memtable_flush_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_max_runs() -> usize {
    8
}

fn default_sample_capacity() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.server.tls_dir.is_none() && !self.server.insecure {
            anyhow::bail!(
                "listener requires TLS material or insecure=true; \
                set server.tls_dir, or server.insecure=true for testing"
            );
        }
        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("invalid bind address: {}", self.server.bind);
        }
        if self.store.max_runs == 0 {
            anyhow::bail!("store.max_runs must be at least 1");
        }
        Ok(())
    }

    /// The store tuning knobs as a [`crate::store::StoreConfig`].
    pub fn store_config(&self) -> crate::store::StoreConfig {
        crate::store::StoreConfig {
            memtable_flush_bytes: self.store.memtable_flush_bytes,
            max_runs: self.store.max_runs,
            sample_capacity: self.store.sample_capacity,
        }
    }
}

/// How the client reaches the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Location {
    /// Resolve `<service>.<namespace>` and connect on the configured port.
    Direct,
    /// Connect through the in-cluster proxy.
    ProxiedInternal,
    /// Connect through the public proxy on the deploy domain.
    ProxiedExternal,
}

/// Client deploy-configuration document (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Reachability mode.
    pub location: Location,

    /// Namespace services live in by default.
    #[serde(default = "default_namespace")]
    pub default_namespace: String,

    /// Deploy domain, used to derive proxy hostnames.
    #[serde(default = "default_domain")]
    pub domain: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_domain() -> String {
    "localhost".to_string()
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            location: Location::Direct,
            default_namespace: default_namespace(),
            domain: default_domain(),
        }
    }
}

impl DeployConfig {
    /// Load the deploy document from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read deploy config {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse deploy config {}", path.display()))
    }

    /// The namespace a service lives in (always the default namespace in
    /// this deployment model).
    pub fn service_namespace(&self, _service: &str) -> &str {
        &self.default_namespace
    }
}
