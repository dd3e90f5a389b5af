//! qbits core library
//!
//! Buffered cache for true-random bits obtained from an external quantum
//! random number service. Network latency, rate limits, and transient
//! failures are hidden behind double buffering with background prefetch;
//! consumers read single bits or small batches and never wait on the
//! network after the initial load.
//!
//! # Architecture
//!
//! - `config`: configuration for the cache, proxy, and uploader components
//! - `error`: unified error taxonomy
//! - `fetcher`: resilient HTTPS client for the quantum source
//! - `buffer`: one batch of bits plus its read cursor
//! - `cache`: double buffering, buffer swap, single-flight prefetch
//! - `stats`: operational counters and online bias detection
//! - `record`: data shapes shared by the persistence pipeline

pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod record;
pub mod stats;

pub use cache::{BitCache, CacheStatus};
pub use config::{CacheConfig, ProxyConfig, UploaderConfig};
pub use error::{Error, Result};
pub use fetcher::{BitFetcher, BitSource};
pub use stats::{BiasReport, CacheStats, StatsSnapshot};

/// Library version for diagnostics
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of bits fetched per batch
pub const DEFAULT_CACHE_SIZE: usize = 1024;

/// Default refill trigger level
pub const DEFAULT_PREFETCH_THRESHOLD: usize = 512;
