//! HTTPS client for fetching random bits from the quantum source
//!
//! Implements resilient fetching with retry, exponential backoff, and
//! rate-limit handling. Transient failures are absorbed here; callers only
//! ever see success, a terminal auth rejection, or retry exhaustion.

use crate::{config::CacheConfig, stats::CacheStats, Error, Result};
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};
use url::Url;

/// Source of bit batches
///
/// The seam between the cache engine and the network: production code uses
/// [`BitFetcher`], tests substitute scripted sources.
pub trait BitSource: Send + Sync + 'static {
    /// Fetch one batch of 0/1 values from the source
    fn fetch_batch(&self) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Response envelope of the quantum numbers API
#[derive(Debug, Deserialize)]
struct SourceResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Vec<u8>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for the external quantum random number service
pub struct BitFetcher {
    client: Client,
    url: Url,
    api_key: String,
    batch_size: usize,
    max_retries: u32,
    rate_limit_wait: Duration,
    backoff_cap: Duration,
    stats: CacheStats,
}

impl BitFetcher {
    /// Create a new fetcher from the cache configuration
    pub fn new(config: &CacheConfig, stats: CacheStats) -> Result<Self> {
        let api_key = match &config.api_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => return Err(Error::Config("API key is required".to_string())),
        };

        let url = Url::parse(&config.api_url)
            .map_err(|e| Error::Config(format!("Invalid api_url: {}", e)))?;

        let client = ClientBuilder::new()
            .timeout(config.request_timeout())
            .build()
            .map_err(Error::Network)?;

        Ok(Self {
            client,
            url,
            api_key,
            batch_size: config.cache_size,
            max_retries: config.max_retries,
            rate_limit_wait: config.rate_limit_wait(),
            backoff_cap: config.backoff_cap(),
            stats,
        })
    }

    /// Fetch one batch of bits, retrying transient failures
    ///
    /// Per call, `total_requests` advances exactly once and exactly one of
    /// `successful_requests` / `failed_requests` follows.
    #[instrument(skip(self), fields(batch_size = self.batch_size))]
    pub async fn fetch_batch(&self) -> Result<Vec<u8>> {
        self.stats.record_request();

        for attempt in 0..self.max_retries {
            debug!("Fetching batch (attempt {}/{})", attempt + 1, self.max_retries);

            match self.fetch_once().await {
                Ok(bits) => {
                    self.stats.record_success();
                    debug!("Fetched {} bits", bits.len());
                    return Ok(bits);
                }
                Err(Error::RateLimit) => {
                    warn!(
                        "Rate limit exceeded, waiting {:?} before next attempt",
                        self.rate_limit_wait
                    );
                    self.stats.record_rate_limit();
                    sleep(self.rate_limit_wait).await;
                    // Skips the exponential backoff but still spends a retry slot
                    continue;
                }
                Err(e @ Error::Auth(_)) => {
                    self.stats.record_failure();
                    return Err(e);
                }
                Err(e) => {
                    match &e {
                        Error::Timeout => self.stats.record_timeout(),
                        Error::Network(_) => self.stats.record_network_error(),
                        _ => {}
                    }
                    warn!("Fetch attempt {} failed: {}", attempt + 1, e);
                }
            }

            if attempt + 1 < self.max_retries {
                let backoff = exponential_backoff(attempt, self.backoff_cap);
                debug!("Waiting {:?} before retry", backoff);
                sleep(backoff).await;
            }
        }

        self.stats.record_failure();
        Err(Error::Exhausted {
            attempts: self.max_retries,
        })
    }

    /// Perform a single request without retry
    async fn fetch_once(&self) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.url.clone())
            .header("x-api-key", &self.api_key)
            .query(&[
                ("length", self.batch_size.to_string()),
                ("type", "uint8".to_string()),
            ])
            .send()
            .await
            .map_err(classify_request_error)?;

        match response.status() {
            StatusCode::OK => {
                let body: SourceResponse =
                    response.json().await.map_err(classify_request_error)?;

                if body.success && !body.data.is_empty() {
                    // Raw byte values become bits
                    Ok(body.data.iter().map(|value| value % 2).collect())
                } else {
                    Err(Error::Api(
                        body.message
                            .unwrap_or_else(|| "source reported failure".to_string()),
                    ))
                }
            }
            StatusCode::TOO_MANY_REQUESTS => Err(Error::RateLimit),
            StatusCode::UNAUTHORIZED => Err(Error::Auth("invalid API key".to_string())),
            StatusCode::FORBIDDEN => Err(Error::Auth(
                "access forbidden, check API key permissions".to_string(),
            )),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::Api(format!("HTTP {}: {}", status, body)))
            }
        }
    }
}

impl BitSource for BitFetcher {
    fn fetch_batch(&self) -> impl Future<Output = Result<Vec<u8>>> + Send {
        BitFetcher::fetch_batch(self)
    }
}

fn classify_request_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::Network(e)
    }
}

/// `min(2^attempt, cap)` seconds
fn exponential_backoff(attempt: u32, cap: Duration) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(cap)
}
