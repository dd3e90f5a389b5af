//! Write-behind persistence for served bits
//!
//! Every bit the proxy hands out is appended here with its capture
//! timestamp. The buffer spills to a `bits_*.json` spool file once it
//! reaches the flush threshold; a periodic task and the shutdown path
//! flush whatever is left. The uploader consumes these files later; the
//! sink itself never talks to the cache.

use chrono::Utc;
use parking_lot::Mutex;
use qbits_core::record::BitRecord;
use qbits_core::{ProxyConfig, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Buffered file sink for captured bits
#[derive(Clone)]
pub struct BitSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    data_dir: PathBuf,
    flush_threshold: usize,
    pending: Mutex<Vec<BitRecord>>,
    // Distinguishes files flushed within the same second
    file_seq: AtomicU64,
}

impl BitSink {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let data_dir = PathBuf::from(&config.data_dir);
        fs::create_dir_all(&data_dir)?;

        Ok(Self {
            inner: Arc::new(SinkInner {
                data_dir,
                flush_threshold: config.flush_threshold,
                pending: Mutex::new(Vec::new()),
                file_seq: AtomicU64::new(0),
            }),
        })
    }

    /// Append served bits, all stamped with the same capture time
    pub fn record_many(&self, bits: &[u8]) {
        if bits.is_empty() {
            return;
        }

        let timestamp = Utc::now();
        let mut pending = self.inner.pending.lock();
        pending.extend(bits.iter().map(|&bit| BitRecord::new(timestamp, bit)));

        if pending.len() >= self.inner.flush_threshold {
            self.flush_locked(&mut pending);
        }
    }

    /// Spill any buffered bits to a spool file
    pub fn flush(&self) {
        let mut pending = self.inner.pending.lock();
        self.flush_locked(&mut pending);
    }

    /// Number of bits waiting in memory
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn flush_locked(&self, pending: &mut Vec<BitRecord>) {
        if pending.is_empty() {
            return;
        }

        let seq = self.inner.file_seq.fetch_add(1, Ordering::Relaxed);
        let filename = format!("bits_{}_{:04}.json", Utc::now().format("%Y%m%d_%H%M%S"), seq);
        let path = self.inner.data_dir.join(&filename);

        match serde_json::to_vec_pretty(&*pending) {
            Ok(body) => match fs::write(&path, body) {
                Ok(()) => {
                    info!("Flushed {} bits to {}", pending.len(), filename);
                    pending.clear();
                }
                Err(e) => {
                    // Records stay buffered for the next flush attempt
                    error!("Failed to write {}: {}", path.display(), e);
                }
            },
            Err(e) => {
                error!("Failed to serialize pending bits: {}", e);
            }
        }
    }
}

/// Periodic flush loop, aborted at shutdown
pub async fn flush_loop(sink: BitSink, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // immediate first tick

    loop {
        ticker.tick().await;
        debug!("Periodic sink flush ({} pending)", sink.pending_len());
        sink.flush();
    }
}
