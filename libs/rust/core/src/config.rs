//! Registry configuration. Built once and handed to [`crate::Registry::from_config`];
//! nothing here is cached process-wide.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use arca_resilience::RetryConfig;
use serde::{Deserialize, Serialize};

use crate::lock::LockConfig;

pub const ENV_PREFIX: &str = "ARCA";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Local { root_path: PathBuf },
    Bucket(BucketConfig),
    CloudBlob(CloudBlobConfig),
}

impl Default for BackendConfig {
    fn default() -> Self { BackendConfig::Local { root_path: PathBuf::from("./registry") } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    pub bucket: String,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl BucketConfig {
    pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudBlobConfig {
    #[serde(default)]
    pub project_id: Option<String>,
    pub bucket: String,
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl CloudBlobConfig {
    pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs) }
}

fn default_true() -> bool { true }
fn default_request_timeout_secs() -> u64 { 60 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub lease_ms: u64,
    pub max_wait_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub jitter: f64,
}

impl Default for LockSettings {
    fn default() -> Self { Self { lease_ms: 30_000, max_wait_ms: 60_000, backoff_base_ms: 25, backoff_cap_ms: 2_000, jitter: 0.25 } }
}

impl From<&LockSettings> for LockConfig {
    fn from(s: &LockSettings) -> Self {
        LockConfig {
            lease: Duration::from_millis(s.lease_ms),
            max_wait: Duration::from_millis(s.max_wait_ms),
            backoff_base: Duration::from_millis(s.backoff_base_ms),
            backoff_cap: Duration::from_millis(s.backoff_cap_ms),
            jitter: s.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self { Self { max_retries: 3, base_delay_ms: 50, max_delay_ms: 1_000, jitter: 0.25 } }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        RetryConfig {
            max_retries: s.max_retries,
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            jitter: s.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub backend: BackendConfig,
    pub lock: LockSettings,
    pub retry: RetrySettings,
    /// Delete payload bytes when a version is deleted, not just tombstone the catalog entry.
    pub purge_payloads: bool,
    /// Check the recorded SHA-256 of a payload on every pull.
    pub verify_checksums: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            lock: LockSettings::default(),
            retry: RetrySettings::default(),
            purge_payloads: true,
            verify_checksums: true,
        }
    }
}

impl RegistryConfig {
    pub fn local(root_path: impl Into<PathBuf>) -> Self {
        Self { backend: BackendConfig::Local { root_path: root_path.into() }, ..Default::default() }
    }

    /// Layers defaults, an optional file (format by extension) and `ARCA__*` environment
    /// variables, e.g. `ARCA__LOCK__LEASE_MS=10000`.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&RegistryConfig::default()).context("encoding config defaults")?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).prefix_separator("__").separator("__").try_parsing(true));
        let cfg = builder.build().context("building registry config")?;
        let parsed: RegistryConfig = cfg.try_deserialize().context("decoding registry config")?;
        tracing::debug!(backend = ?parsed.backend, "registry config loaded");
        Ok(parsed)
    }

    /// Parses an inline YAML document on top of the defaults.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let defaults = config::Config::try_from(&RegistryConfig::default())?;
        let cfg = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from_str(text, config::FileFormat::Yaml))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}
