//! Double-buffered bit cache with background prefetch
//!
//! The cache hides the latency and failure modes of the external quantum
//! source behind two buffers: consumers drain `active` while a single
//! background task refills `standby`. One mutex guards both slots and the
//! read cursor, so serving a bit and swapping buffers are atomic even with
//! concurrent consumers. Only the very first load blocks the caller; in
//! steady state an empty cache is reported as [`Error::NoData`] rather than
//! waited out.

use crate::buffer::BitBuffer;
use crate::config::CacheConfig;
use crate::fetcher::{BitFetcher, BitSource};
use crate::stats::{BiasReport, CacheStats, StatsSnapshot};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Buffered cache of quantum random bits
///
/// Cheap to clone; all clones share the same buffers and statistics.
/// `get_bit`/`get_bits` must run inside a tokio runtime because a depleted
/// buffer may spawn the background prefetch task.
pub struct BitCache<S = BitFetcher> {
    inner: Arc<CacheInner<S>>,
}

impl<S> Clone for BitCache<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CacheInner<S> {
    config: CacheConfig,
    source: S,
    slots: Mutex<BufferSlots>,
    prefetch_in_flight: AtomicBool,
    prefetch_task: Mutex<Option<JoinHandle<()>>>,
    last_fetch: Mutex<Option<DateTime<Utc>>>,
    stats: CacheStats,
}

/// Both buffer slots live under one lock so the cursor advance and the
/// swap cannot interleave between consumers.
struct BufferSlots {
    active: BitBuffer,
    standby: Vec<u8>,
}

/// Point-in-time view of the buffers
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub remaining_bits: usize,
    pub standby_bits: usize,
    pub prefetching: bool,
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub cache_size: usize,
    pub prefetch_threshold: usize,
}

/// Clears the single-flight flag on every exit path of the prefetch task,
/// including an abort before the task is ever polled
struct InFlightGuard<S>(Arc<CacheInner<S>>);

impl<S> Drop for InFlightGuard<S> {
    fn drop(&mut self) {
        self.0.prefetch_in_flight.store(false, Ordering::Release);
    }
}

impl BitCache<BitFetcher> {
    /// Build a cache backed by the HTTP fetcher and perform the initial load
    pub async fn connect(config: CacheConfig) -> Result<Self> {
        let stats = CacheStats::new();
        let fetcher = BitFetcher::new(&config, stats.clone())?;
        Self::with_source(config, fetcher, stats).await
    }
}

impl<S: BitSource> BitCache<S> {
    /// Build a cache over an arbitrary bit source
    ///
    /// The initial load is the one place the cache blocks on the network:
    /// it awaits a full fetch (including its retry loop) and fails
    /// construction if the source cannot deliver.
    pub async fn with_source(config: CacheConfig, source: S, stats: CacheStats) -> Result<Self> {
        config.validate()?;

        info!("Loading initial batch of {} bits", config.cache_size);
        let initial = match source.fetch_batch().await {
            Ok(bits) => bits,
            Err(e @ Error::Auth(_)) => return Err(e),
            Err(e) => return Err(Error::Init(format!("initial batch fetch failed: {}", e))),
        };
        info!("Initial load complete: {} bits ready", initial.len());

        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                source,
                slots: Mutex::new(BufferSlots {
                    active: BitBuffer::filled(initial),
                    standby: Vec::new(),
                }),
                prefetch_in_flight: AtomicBool::new(false),
                prefetch_task: Mutex::new(None),
                last_fetch: Mutex::new(Some(Utc::now())),
                stats,
            }),
        })
    }

    /// Serve one bit
    ///
    /// Evaluates the prefetch trigger, then the swap trigger, then reads
    /// from the active buffer. An exhausted cache returns
    /// [`Error::NoData`]; the caller may retry once the background fetch
    /// lands.
    pub fn get_bit(&self) -> Result<u8> {
        let bit = {
            let mut slots = self.inner.slots.lock();

            if self.should_prefetch(&slots) {
                self.spawn_prefetch();
            }

            if slots.active.is_exhausted() && !slots.standby.is_empty() {
                let fresh = std::mem::take(&mut slots.standby);
                info!("Buffer swapped: {} bits available", fresh.len());
                slots.active = BitBuffer::filled(fresh);
            }

            slots.active.next_bit().ok_or(Error::NoData)?
        };

        self.inner.stats.record_bit(bit);
        Ok(bit)
    }

    /// Serve `count` bits in source order
    ///
    /// Zero is a valid no-op request. Fails atomically: on any underlying
    /// error the partial output is dropped with it.
    pub fn get_bits(&self, count: usize) -> Result<Vec<u8>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        if count > self.inner.config.max_bits_per_call {
            return Err(Error::Validation(format!(
                "requested bits ({}) exceed the per-call maximum ({})",
                count, self.inner.config.max_bits_per_call
            )));
        }

        let mut bits = Vec::with_capacity(count);
        for _ in 0..count {
            bits.push(self.get_bit()?);
        }
        Ok(bits)
    }

    /// Snapshot of buffer fill and prefetch state
    pub fn status(&self) -> CacheStatus {
        let slots = self.inner.slots.lock();
        CacheStatus {
            remaining_bits: slots.active.remaining(),
            standby_bits: slots.standby.len(),
            prefetching: self.inner.prefetch_in_flight.load(Ordering::Acquire),
            last_fetch_time: *self.inner.last_fetch.lock(),
            cache_size: self.inner.config.cache_size,
            prefetch_threshold: self.inner.config.prefetch_threshold,
        }
    }

    /// Owned copy of the operational counters
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Zero all counters and the bit histogram
    pub fn reset_stats(&self) {
        self.inner.stats.reset();
        info!("Statistics reset");
    }

    /// Bias significance report over the delivered bit stream
    pub fn bias_report(&self) -> BiasReport {
        self.inner
            .stats
            .bias_report(self.inner.config.significance_level, self.inner.config.fair_ratio)
    }

    /// Abort any in-flight prefetch so no background work outlives the cache
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.prefetch_task.lock().take() {
            handle.abort();
        }
    }

    fn should_prefetch(&self, slots: &BufferSlots) -> bool {
        slots.active.remaining() <= self.inner.config.prefetch_threshold
            && !self.inner.prefetch_in_flight.load(Ordering::Acquire)
            && slots.standby.is_empty()
    }

    /// Start the background refill unless one is already in flight
    fn spawn_prefetch(&self) {
        if self
            .inner
            .prefetch_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Single-flight: somebody else won the race
            return;
        }

        self.inner.stats.record_prefetch();
        debug!("Starting background prefetch");

        let guard = InFlightGuard(Arc::clone(&self.inner));
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let _clear = guard;

            match inner.source.fetch_batch().await {
                Ok(bits) => {
                    let count = bits.len();
                    inner.slots.lock().standby = bits;
                    *inner.last_fetch.lock() = Some(Utc::now());
                    info!("Prefetch complete: {} bits ready", count);
                }
                Err(e) => {
                    // The active buffer is never discarded on prefetch failure
                    error!("Prefetch failed, keeping current buffer: {}", e);
                }
            }
        });

        *self.inner.prefetch_task.lock() = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Semaphore;

    /// Deterministic source: pops scripted outcomes, counts calls, and can
    /// hold a fetch open on a semaphore.
    struct ScriptedSource {
        batches: Mutex<VecDeque<Result<Vec<u8>>>>,
        calls: AtomicU32,
        gate: Option<Arc<Semaphore>>,
    }

    impl ScriptedSource {
        fn new(batches: Vec<Result<Vec<u8>>>) -> Self {
            Self {
                batches: Mutex::new(batches.into_iter().collect()),
                calls: AtomicU32::new(0),
                gate: None,
            }
        }

        fn gated(batches: Vec<Result<Vec<u8>>>, gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(batches)
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl BitSource for ScriptedSource {
        async fn fetch_batch(&self) -> Result<Vec<u8>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            // First call is the initial load; only later calls wait on the gate
            if call > 0 {
                if let Some(gate) = &self.gate {
                    gate.acquire().await.expect("gate closed").forget();
                }
            }
            self.batches
                .lock()
                .pop_front()
                .unwrap_or(Err(Error::Exhausted { attempts: 1 }))
        }
    }

    fn test_config(cache_size: usize, prefetch_threshold: usize) -> CacheConfig {
        CacheConfig {
            cache_size,
            prefetch_threshold,
            request_timeout_secs: 1,
            max_retries: 1,
            max_bits_per_call: 16,
            rate_limit_wait_secs: 0,
            backoff_cap_secs: 0,
            significance_level: 0.05,
            fair_ratio: 0.5,
            api_url: "https://example.com/".to_string(),
            api_key: Some("test-key".to_string()),
        }
    }

    async fn cache_with(
        config: CacheConfig,
        source: ScriptedSource,
    ) -> Result<BitCache<ScriptedSource>> {
        BitCache::with_source(config, source, CacheStats::new()).await
    }

    /// Block until the in-flight prefetch task (if any) has finished
    async fn settle_prefetch(cache: &BitCache<ScriptedSource>) {
        let handle = cache.inner.prefetch_task.lock().take();
        if let Some(handle) = handle {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn invalid_threshold_fails_construction() {
        let source = ScriptedSource::new(vec![Ok(vec![1, 0])]);
        let result = cache_with(test_config(4, 4), source).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn initial_load_exhaustion_is_fatal() {
        let source = ScriptedSource::new(vec![Err(Error::Exhausted { attempts: 5 })]);
        let result = cache_with(test_config(4, 2), source).await;
        assert!(matches!(result, Err(Error::Init(_))));
    }

    #[tokio::test]
    async fn auth_rejection_propagates_from_construction() {
        let source = ScriptedSource::new(vec![Err(Error::Auth("bad key".to_string()))]);
        let result = cache_with(test_config(4, 2), source).await;
        assert!(matches!(result, Err(Error::Auth(_))));
    }

    #[tokio::test]
    async fn bits_come_back_in_batch_order() {
        let batch = vec![1, 0, 1, 1, 0, 0, 1, 0];
        let source = ScriptedSource::new(vec![Ok(batch.clone())]);
        let cache = cache_with(test_config(8, 2), source).await.unwrap();

        let served: Vec<u8> = (0..8).map(|_| cache.get_bit().unwrap()).collect();
        assert_eq!(served, batch);
    }

    #[tokio::test]
    async fn threshold_crossing_triggers_one_prefetch() {
        let source = ScriptedSource::new(vec![
            Ok(vec![1, 0, 1, 1, 0, 0, 1, 0, 1, 0]),
            Ok(vec![1; 10]),
        ]);
        let cache = cache_with(test_config(10, 5), source).await.unwrap();

        let served: Vec<u8> = (0..6).map(|_| cache.get_bit().unwrap()).collect();
        assert_eq!(served, vec![1, 0, 1, 1, 0, 0]);

        let status = cache.status();
        assert!(status.remaining_bits <= 5);
        assert_eq!(cache.stats().prefetch_count, 1);
    }

    #[tokio::test]
    async fn swap_serves_the_former_standby_head() {
        let source = ScriptedSource::new(vec![
            Ok(vec![0, 0, 0, 0]),
            Ok(vec![1, 0, 1, 0]),
        ]);
        let cache = cache_with(test_config(4, 1), source).await.unwrap();

        for _ in 0..4 {
            cache.get_bit().unwrap();
        }
        settle_prefetch(&cache).await;
        assert_eq!(cache.status().standby_bits, 4);

        // Old active is fully drained; the next bit is the standby's first
        assert_eq!(cache.get_bit().unwrap(), 1);
        let status = cache.status();
        assert_eq!(status.remaining_bits, 3);
        assert_eq!(status.standby_bits, 0);
    }

    #[tokio::test]
    async fn concurrent_triggers_start_a_single_fetch() {
        let gate = Arc::new(Semaphore::new(0));
        let source = ScriptedSource::gated(
            vec![Ok(vec![0, 1, 0, 1]), Ok(vec![1; 4])],
            Arc::clone(&gate),
        );
        let cache = cache_with(test_config(4, 3), source).await.unwrap();

        // The second call crosses the threshold; the later ones see the
        // gated fetch still in flight and must not start another
        for _ in 0..3 {
            cache.get_bit().unwrap();
        }
        assert_eq!(cache.stats().prefetch_count, 1);

        gate.add_permits(1);
        settle_prefetch(&cache).await;

        assert_eq!(cache.inner.source.calls(), 2);
        assert_eq!(cache.stats().prefetch_count, 1);
    }

    #[tokio::test]
    async fn failed_prefetch_keeps_the_active_buffer() {
        let source = ScriptedSource::new(vec![Ok(vec![1, 1, 0, 0])]);
        let cache = cache_with(test_config(4, 3), source).await.unwrap();

        cache.get_bit().unwrap();
        cache.get_bit().unwrap();
        settle_prefetch(&cache).await;

        // Prefetch failed; the two remaining active bits still serve
        assert_eq!(cache.status().standby_bits, 0);
        assert_eq!(cache.get_bit().unwrap(), 0);
        assert_eq!(cache.get_bit().unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_cache_reports_no_data() {
        let source = ScriptedSource::new(vec![Ok(vec![1, 0])]);
        let cache = cache_with(test_config(2, 1), source).await.unwrap();

        cache.get_bit().unwrap();
        cache.get_bit().unwrap();
        settle_prefetch(&cache).await;

        assert!(matches!(cache.get_bit(), Err(Error::NoData)));
        // Recoverable: the consumer is expected to retry later
        settle_prefetch(&cache).await;
        assert!(matches!(cache.get_bit(), Err(Error::NoData)));
    }

    #[tokio::test]
    async fn get_bits_validation_bounds() {
        let source = ScriptedSource::new(vec![Ok(vec![1; 20])]);
        let cache = cache_with(test_config(20, 2), source).await.unwrap();

        assert_eq!(cache.get_bits(0).unwrap(), Vec::<u8>::new());
        assert!(matches!(cache.get_bits(17), Err(Error::Validation(_))));

        let bits = cache.get_bits(16).unwrap();
        assert_eq!(bits.len(), 16);
    }

    #[tokio::test]
    async fn delivered_bits_feed_the_histogram() {
        let source = ScriptedSource::new(vec![Ok(vec![1, 1, 1, 0])]);
        let cache = cache_with(test_config(4, 1), source).await.unwrap();

        cache.get_bits(4).unwrap();
        settle_prefetch(&cache).await;

        let report = cache.bias_report();
        assert_eq!(report.sample_size, 4);
        assert_eq!(report.count_1, 3);
        assert_eq!(report.count_0, 1);

        let stats = cache.stats();
        assert_eq!(stats.cache_hits, 4);

        cache.reset_stats();
        assert_eq!(cache.stats().cache_hits, 0);
        assert_eq!(cache.bias_report().sample_size, 0);
    }

    #[tokio::test]
    async fn shutdown_aborts_the_background_task() {
        let gate = Arc::new(Semaphore::new(0));
        let source = ScriptedSource::gated(vec![Ok(vec![0, 1]), Ok(vec![1; 2])], Arc::clone(&gate));
        let cache = cache_with(test_config(2, 1), source).await.unwrap();

        cache.get_bit().unwrap(); // triggers the gated prefetch
        cache.shutdown();

        // The aborted task must still clear the single-flight flag
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        while cache.status().prefetching {
            assert!(std::time::Instant::now() < deadline, "flag never cleared");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}
