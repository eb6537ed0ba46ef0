use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::field::catalog;

/// Top-level configuration for potiron ingestion.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity recorded with the run parameters. Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Shared store connection.
    #[serde(default)]
    pub store: StoreConfig,

    /// External dissection tool.
    #[serde(default)]
    pub dissector: DissectorConfig,

    /// Ingestion run settings.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Shared store connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Store target, e.g. "redis://127.0.0.1:6379/0" or
    /// "unix:///var/run/redis.sock".
    #[serde(default)]
    pub url: String,

    /// Connection timeout. Default: 5s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Dissection tool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DissectorConfig {
    /// Executable name or path. Default: "tshark".
    #[serde(default = "default_program")]
    pub program: String,

    /// Display filter every run starts from.
    #[serde(default = "default_base_filter")]
    pub base_filter: String,
}

/// Ingestion run settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Number of files processed concurrently. Default: available cores.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Split histograms by protocol (`sensor:proto:day:field`).
    #[serde(default)]
    pub combined_keys: bool,

    /// Dissector field names to extract. Empty selects every known field.
    #[serde(default)]
    pub field_filter: Vec<String>,

    /// Extra display filter appended to the base filter with `&&`.
    #[serde(default)]
    pub display_filter: String,

    /// Sensor name override. Derived from file names when empty.
    #[serde(default)]
    pub sensor: String,

    /// Lifetime of an in-flight ingestion claim. Default: 1h. Workers
    /// renew their claim every third of this while a file is in flight.
    #[serde(default = "default_claim_ttl", with = "humantime_serde")]
    pub claim_ttl: Duration,

    /// Optional `name<TAB>number` protocol table replacing the built-in one.
    #[serde(default)]
    pub protocols_file: Option<PathBuf>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Serve `/metrics` and `/healthz`. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_program() -> String {
    "tshark".to_string()
}

fn default_base_filter() -> String {
    "ip.dst ne 255.255.255.255".to_string()
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

fn default_claim_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            store: StoreConfig::default(),
            dissector: DissectorConfig::default(),
            ingest: IngestConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for DissectorConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            base_filter: default_base_filter(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            combined_keys: false,
            field_filter: Vec::new(),
            display_filter: String::new(),
            sensor: String::new(),
            claim_ttl: default_claim_ttl(),
            protocols_file: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file. Validation is left to the
    /// caller so command line overrides can be applied first.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Validate the configuration for an ingestion run.
    pub fn validate(&self) -> Result<()> {
        if self.store.url.is_empty() {
            bail!("store.url is required");
        }

        if self.store.connect_timeout.is_zero() {
            bail!("store.connect_timeout must be positive");
        }

        if self.dissector.program.is_empty() {
            bail!("dissector.program is required");
        }

        if self.ingest.workers == 0 {
            bail!("ingest.workers must be positive");
        }

        if self.ingest.claim_ttl.as_secs() == 0 {
            bail!("ingest.claim_ttl must be at least one second");
        }

        catalog::resolve_filter(&self.ingest.field_filter)
            .context("ingest.field_filter is invalid")?;

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }

    /// Full display filter: the base filter, extended with the user filter.
    pub fn display_filter(&self) -> String {
        let extra = self.ingest.display_filter.trim();
        if extra.is_empty() {
            self.dissector.base_filter.clone()
        } else {
            format!("{} && {}", self.dissector.base_filter, extra)
        }
    }
}
