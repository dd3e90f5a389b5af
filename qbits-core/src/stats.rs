//! Operational counters and bit-distribution statistics
//!
//! `CacheStats` tracks two independent concerns that share a reset: the
//! operational counters (requests, errors, cache hits) and the 0/1
//! histogram used for online bias detection. Counters are atomics so
//! concurrent consumers and the background prefetch task can update them
//! without a lock; callers only ever see owned snapshots.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared statistics handle
#[derive(Clone)]
pub struct CacheStats {
    inner: Arc<StatsInner>,
}

struct StatsInner {
    started: Instant,

    // Operational counters
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    cache_hits: AtomicU64,
    prefetch_count: AtomicU64,
    rate_limit_hits: AtomicU64,
    timeout_errors: AtomicU64,
    network_errors: AtomicU64,

    // Bit histogram for bias measurement
    count_0: AtomicU64,
    count_1: AtomicU64,
    total_bits: AtomicU64,
}

/// Owned copy of the operational counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cache_hits: u64,
    pub prefetch_count: u64,
    pub rate_limit_hits: u64,
    pub timeout_errors: u64,
    pub network_errors: u64,
}

/// Bias significance report over the delivered bit stream
#[derive(Debug, Clone, Serialize)]
pub struct BiasReport {
    pub sample_size: u64,
    pub count_0: u64,
    pub count_1: u64,
    pub ratio_0: f64,
    pub ratio_1: f64,
    pub bias: f64,
    pub p_value: f64,
    pub significant: bool,
    pub runtime_seconds: u64,
    pub runtime: String,
}

impl Default for CacheStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatsInner {
                started: Instant::now(),
                total_requests: AtomicU64::new(0),
                successful_requests: AtomicU64::new(0),
                failed_requests: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                prefetch_count: AtomicU64::new(0),
                rate_limit_hits: AtomicU64::new(0),
                timeout_errors: AtomicU64::new(0),
                network_errors: AtomicU64::new(0),
                count_0: AtomicU64::new(0),
                count_1: AtomicU64::new(0),
                total_bits: AtomicU64::new(0),
            }),
        }
    }

    // Fetch accounting
    pub fn record_request(&self) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.inner
            .successful_requests
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.inner.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit(&self) {
        self.inner.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.inner.timeout_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_error(&self) {
        self.inner.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch(&self) {
        self.inner.prefetch_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Account one delivered bit: a cache hit plus a histogram update
    pub fn record_bit(&self, bit: u8) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
        if bit == 0 {
            self.inner.count_0.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.count_1.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.total_bits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.inner.total_requests.load(Ordering::Relaxed)
    }

    pub fn prefetch_count(&self) -> u64 {
        self.inner.prefetch_count.load(Ordering::Relaxed)
    }

    pub fn rate_limit_hits(&self) -> u64 {
        self.inner.rate_limit_hits.load(Ordering::Relaxed)
    }

    /// Owned copy of the operational counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.inner.total_requests.load(Ordering::Relaxed),
            successful_requests: self.inner.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.inner.failed_requests.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            prefetch_count: self.inner.prefetch_count.load(Ordering::Relaxed),
            rate_limit_hits: self.inner.rate_limit_hits.load(Ordering::Relaxed),
            timeout_errors: self.inner.timeout_errors.load(Ordering::Relaxed),
            network_errors: self.inner.network_errors.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter and the histogram. The runtime clock keeps running.
    pub fn reset(&self) {
        self.inner.total_requests.store(0, Ordering::Relaxed);
        self.inner.successful_requests.store(0, Ordering::Relaxed);
        self.inner.failed_requests.store(0, Ordering::Relaxed);
        self.inner.cache_hits.store(0, Ordering::Relaxed);
        self.inner.prefetch_count.store(0, Ordering::Relaxed);
        self.inner.rate_limit_hits.store(0, Ordering::Relaxed);
        self.inner.timeout_errors.store(0, Ordering::Relaxed);
        self.inner.network_errors.store(0, Ordering::Relaxed);
        self.inner.count_0.store(0, Ordering::Relaxed);
        self.inner.count_1.store(0, Ordering::Relaxed);
        self.inner.total_bits.store(0, Ordering::Relaxed);
    }

    /// Bias significance report for the bits delivered so far
    ///
    /// Tests the observed count of ones against the null hypothesis that a
    /// bit is 1 with probability `fair_ratio`, using an exact two-sided
    /// binomial test.
    pub fn bias_report(&self, significance_level: f64, fair_ratio: f64) -> BiasReport {
        let sample_size = self.inner.total_bits.load(Ordering::Relaxed);
        let count_0 = self.inner.count_0.load(Ordering::Relaxed);
        let count_1 = self.inner.count_1.load(Ordering::Relaxed);
        let runtime_seconds = self.inner.started.elapsed().as_secs();

        if sample_size == 0 {
            return BiasReport {
                sample_size: 0,
                count_0: 0,
                count_1: 0,
                ratio_0: 0.0,
                ratio_1: 0.0,
                bias: 0.0,
                p_value: 1.0,
                significant: false,
                runtime_seconds,
                runtime: humanize_duration(runtime_seconds),
            };
        }

        let ratio_0 = count_0 as f64 / sample_size as f64;
        let ratio_1 = count_1 as f64 / sample_size as f64;
        let bias = (ratio_0 - fair_ratio).abs();

        let p_value = binomial_two_sided(count_1, sample_size, fair_ratio);
        let significant = p_value < significance_level;

        BiasReport {
            sample_size,
            count_0,
            count_1,
            ratio_0: round4(ratio_0),
            ratio_1: round4(ratio_1),
            bias: round4(bias),
            p_value: round4(p_value),
            significant,
            runtime_seconds,
            runtime: humanize_duration(runtime_seconds),
        }
    }
}

/// Exact two-sided binomial test
///
/// Probability, under `X ~ Binomial(trials, p)`, of any outcome at most as
/// likely as the observed `successes`. Probabilities are accumulated from a
/// running log-pmf recurrence so arbitrarily large samples stay in range;
/// the small tolerance on the comparison absorbs floating-point drift, the
/// same way scipy's `binomtest` does.
pub fn binomial_two_sided(successes: u64, trials: u64, p: f64) -> f64 {
    if trials == 0 {
        return 1.0;
    }

    let ln_p = p.ln();
    let ln_q = (1.0 - p).ln();

    // ln pmf(k+1) = ln pmf(k) + ln(n-k) - ln(k+1) + ln(p) - ln(1-p)
    let step = |ln_pmf: f64, k: u64| {
        ln_pmf + ((trials - k) as f64).ln() - ((k + 1) as f64).ln() + ln_p - ln_q
    };

    let mut ln_observed = (trials as f64) * ln_q;
    for k in 0..successes {
        ln_observed = step(ln_observed, k);
    }
    let cutoff = ln_observed + 1e-7;

    let mut p_value = 0.0;
    let mut ln_pmf = (trials as f64) * ln_q;
    for k in 0..=trials {
        if ln_pmf <= cutoff {
            p_value += ln_pmf.exp();
        }
        if k < trials {
            ln_pmf = step(ln_pmf, k);
        }
    }

    p_value.min(1.0)
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Rough human-readable rendering of an elapsed duration
fn humanize_duration(secs: u64) -> String {
    fn plural(count: u64, unit: &str) -> String {
        if count == 1 {
            format!("1 {}", unit)
        } else {
            format!("{} {}s", count, unit)
        }
    }

    match secs {
        0..=59 => plural(secs, "second"),
        60..=3599 => plural(secs / 60, "minute"),
        3600..=86_399 => plural(secs / 3600, "hour"),
        _ => plural(secs / 86_400, "day"),
    }
}
