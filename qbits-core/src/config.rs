//! Configuration management for qbits components
//!
//! Each component has its own section: `cache` for the core engine, `proxy`
//! for the HTTP layer, `uploader` for the batch upload pipeline. All three
//! load from a shared YAML file or from `QBITS_`-prefixed environment
//! variables, with serde defaults filling the gaps.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Cache engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Bits fetched per batch
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Start prefetching once the active buffer drops to this many bits
    #[serde(default = "default_prefetch_threshold")]
    pub prefetch_threshold: usize,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum fetch attempts per batch
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Upper bound on bits returned by a single `get_bits` call
    #[serde(default = "default_max_bits_per_call")]
    pub max_bits_per_call: usize,

    /// Wait after an HTTP 429 before the next attempt, in seconds
    #[serde(default = "default_rate_limit_wait_secs")]
    pub rate_limit_wait_secs: u64,

    /// Cap on the exponential retry backoff, in seconds
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,

    /// Alpha for the bias significance test
    #[serde(default = "default_significance_level")]
    pub significance_level: f64,

    /// Expected share of zeros under the fair-coin null hypothesis
    #[serde(default = "default_fair_ratio")]
    pub fair_ratio: f64,

    /// Base URL of the quantum random number service
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Credential for the random source (QBITS_API_KEY)
    #[serde(default)]
    pub api_key: Option<String>,
}

impl CacheConfig {
    /// Load the `cache` section from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut cfg: Self = load_section(path, "cache")?;
        if cfg.api_key.is_none() {
            cfg.api_key = std::env::var("QBITS_API_KEY").ok();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from `QBITS_`-prefixed environment variables
    pub fn from_env() -> Result<Self> {
        let cfg: Self = envy::prefixed("QBITS_")
            .from_env()
            .map_err(|e| Error::Config(format!("Failed to parse environment variables: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 {
            return Err(Error::Config("cache_size must be > 0".to_string()));
        }

        if self.cache_size <= self.prefetch_threshold {
            return Err(Error::Config(
                "cache_size must be greater than prefetch_threshold".to_string(),
            ));
        }

        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be > 0".to_string()));
        }

        if self.max_bits_per_call == 0 {
            return Err(Error::Config("max_bits_per_call must be > 0".to_string()));
        }

        if !(0.0..1.0).contains(&self.significance_level) || self.significance_level == 0.0 {
            return Err(Error::Config(
                "significance_level must be in (0, 1)".to_string(),
            ));
        }

        if self.fair_ratio <= 0.0 || self.fair_ratio >= 1.0 {
            return Err(Error::Config("fair_ratio must be in (0, 1)".to_string()));
        }

        Url::parse(&self.api_url)
            .map_err(|e| Error::Config(format!("Invalid api_url '{}': {}", self.api_url, e)))?;

        match &self.api_key {
            Some(key) if !key.is_empty() => Ok(()),
            _ => Err(Error::Config(
                "API key is required. Set QBITS_API_KEY or the cache.api_key field.".to_string(),
            )),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn rate_limit_wait(&self) -> Duration {
        Duration::from_secs(self.rate_limit_wait_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }
}

/// HTTP proxy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Bind address for the HTTP server
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Directory receiving write-behind bit files
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Flush the write-behind buffer once it holds this many bits
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Periodic flush interval in seconds
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Router-level maximum for `/bits?count=N`, independent of the
    /// cache's own per-call limit
    #[serde(default = "default_max_bits_per_request")]
    pub max_bits_per_request: usize,
}

impl ProxyConfig {
    /// Load the `proxy` section from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let cfg: Self = load_section(path, "proxy")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from `QBITS_`-prefixed environment variables
    pub fn from_env() -> Result<Self> {
        let cfg: Self = envy::prefixed("QBITS_")
            .from_env()
            .map_err(|e| Error::Config(format!("Failed to parse environment variables: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.flush_threshold == 0 {
            return Err(Error::Config("flush_threshold must be > 0".to_string()));
        }

        if self.max_bits_per_request == 0 {
            return Err(Error::Config("max_bits_per_request must be > 0".to_string()));
        }

        if self.flush_interval_secs == 0 {
            return Err(Error::Config("flush_interval_secs must be > 0".to_string()));
        }

        self.listen_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| Error::Config(format!("Invalid listen_address: {}", e)))?;

        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Batch uploader configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploaderConfig {
    /// Ingest endpoint of the remote dataset store
    pub dataset_url: String,

    /// Bearer token for the dataset store (QBITS_DATASET_TOKEN)
    #[serde(default)]
    pub dataset_token: Option<String>,

    /// Directory scanned for pending bit files
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Seconds between upload cycles
    #[serde(default = "default_upload_interval_secs")]
    pub upload_interval_secs: u64,

    /// Maximum records per upload batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between consecutive batches of one cycle, in seconds
    #[serde(default = "default_inter_batch_delay_secs")]
    pub inter_batch_delay_secs: u64,

    /// Pack 32 bits into one MSB-first word per record
    #[serde(default)]
    pub pack_words: bool,

    /// Seconds between status log lines
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

impl UploaderConfig {
    /// Load the `uploader` section from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut cfg: Self = load_section(path, "uploader")?;
        if cfg.dataset_token.is_none() {
            cfg.dataset_token = std::env::var("QBITS_DATASET_TOKEN").ok();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from `QBITS_`-prefixed environment variables
    pub fn from_env() -> Result<Self> {
        let cfg: Self = envy::prefixed("QBITS_")
            .from_env()
            .map_err(|e| Error::Config(format!("Failed to parse environment variables: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.dataset_url).map_err(|e| {
            Error::Config(format!("Invalid dataset_url '{}': {}", self.dataset_url, e))
        })?;

        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be > 0".to_string()));
        }

        if self.upload_interval_secs == 0 || self.status_interval_secs == 0 {
            return Err(Error::Config("upload and status intervals must be > 0".to_string()));
        }

        match &self.dataset_token {
            Some(token) if !token.is_empty() => Ok(()),
            _ => Err(Error::Config(
                "Dataset token is required. Set QBITS_DATASET_TOKEN or the uploader.dataset_token field.".to_string(),
            )),
        }
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_interval_secs)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_secs(self.inter_batch_delay_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

fn load_section<T: serde::de::DeserializeOwned>(path: &Path, section: &str) -> Result<T> {
    let file = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    file.get(section)
        .map_err(|e| Error::Config(format!("Invalid '{}' section: {}", section, e)))
}

// Default value functions
fn default_cache_size() -> usize {
    crate::DEFAULT_CACHE_SIZE
}

fn default_prefetch_threshold() -> usize {
    crate::DEFAULT_PREFETCH_THRESHOLD
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_bits_per_call() -> usize {
    1024
}

fn default_rate_limit_wait_secs() -> u64 {
    60
}

fn default_backoff_cap_secs() -> u64 {
    60
}

fn default_significance_level() -> f64 {
    0.05
}

fn default_fair_ratio() -> f64 {
    0.5
}

fn default_api_url() -> String {
    "https://api.quantumnumbers.anu.edu.au/".to_string()
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_data_dir() -> String {
    "quantum_data".to_string()
}

fn default_flush_threshold() -> usize {
    100
}

fn default_flush_interval_secs() -> u64 {
    60
}

fn default_max_bits_per_request() -> usize {
    1000
}

fn default_upload_interval_secs() -> u64 {
    600
}

fn default_batch_size() -> usize {
    10_000
}

fn default_inter_batch_delay_secs() -> u64 {
    5
}

fn default_status_interval_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cache_config() -> CacheConfig {
        CacheConfig {
            cache_size: 1024,
            prefetch_threshold: 512,
            request_timeout_secs: 10,
            max_retries: 5,
            max_bits_per_call: 1024,
            rate_limit_wait_secs: 60,
            backoff_cap_secs: 60,
            significance_level: 0.05,
            fair_ratio: 0.5,
            api_url: "https://example.com/random".to_string(),
            api_key: Some("test-key".to_string()),
        }
    }

    #[test]
    fn cache_config_valid() {
        assert!(base_cache_config().validate().is_ok());
    }

    #[test]
    fn cache_size_must_exceed_threshold() {
        let mut config = base_cache_config();
        config.cache_size = 512;
        config.prefetch_threshold = 512;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.prefetch_threshold = 600;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let mut config = base_cache_config();
        config.api_key = None;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.api_key = Some(String::new());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn significance_and_fairness_bounds() {
        let mut config = base_cache_config();
        config.significance_level = 1.0;
        assert!(config.validate().is_err());

        let mut config = base_cache_config();
        config.fair_ratio = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn proxy_config_defaults_are_valid() {
        let config = ProxyConfig {
            listen_address: default_listen_address(),
            data_dir: default_data_dir(),
            flush_threshold: default_flush_threshold(),
            flush_interval_secs: default_flush_interval_secs(),
            max_bits_per_request: default_max_bits_per_request(),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn uploader_requires_token() {
        let config = UploaderConfig {
            dataset_url: "https://datasets.example.com/ingest".to_string(),
            dataset_token: None,
            data_dir: default_data_dir(),
            upload_interval_secs: 600,
            batch_size: 10_000,
            inter_batch_delay_secs: 5,
            pack_words: false,
            status_interval_secs: 60,
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
