//! qbits uploader - ships captured bits to a remote dataset store
//!
//! Watches the spool directory the proxy writes into, packs the bits into
//! fixed-width words when configured, and uploads them in batches. A spool
//! file is deleted only after every record read from it has been accepted
//! by the remote store; any failure leaves the files in place for the next
//! cycle, so delivery is at-least-once.

mod spool;

use anyhow::{bail, Context, Result};
use clap::Parser;
use qbits_core::record::pack_words;
use qbits_core::UploaderConfig;
use reqwest::Client;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "qbits-uploader")]
#[command(about = "Uploads captured quantum bits to a dataset store", long_about = None)]
struct Args {
    /// Path to configuration file (ignored if --env-mode is set)
    #[arg(short, long, default_value = "config/qbits.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Load configuration from environment variables instead of file
    #[arg(long, default_value = "false")]
    env_mode: bool,
}

/// Upload pipeline counters
#[derive(Default)]
struct UploadCounters {
    bits_uploaded: AtomicU64,
    uploads: AtomicU64,
    files_processed: AtomicU64,
    upload_errors: AtomicU64,
    file_errors: AtomicU64,
}

/// Main uploader application state
struct Uploader {
    config: UploaderConfig,
    client: Client,
    token: String,
    counters: UploadCounters,
}

impl Uploader {
    fn new(config: UploaderConfig) -> Result<Self> {
        let token = config
            .dataset_token
            .clone()
            .context("Dataset token missing")?;

        fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create data dir {}", config.data_dir))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            config,
            client,
            token,
            counters: UploadCounters::default(),
        })
    }

    /// Main run loop
    async fn run(self: Arc<Self>) -> Result<()> {
        info!("qbits uploader v{}", env!("CARGO_PKG_VERSION"));
        info!("Dataset store: {}", self.config.dataset_url);
        info!("Spool directory: {}", self.config.data_dir);
        info!("Upload interval: {:?}", self.config.upload_interval());
        info!(
            "Word packing: {}",
            if self.config.pack_words { "on (32 bits per record)" } else { "off" }
        );

        let upload_handle = {
            let uploader = Arc::clone(&self);
            tokio::spawn(async move { uploader.upload_loop().await })
        };

        let status_handle = {
            let uploader = Arc::clone(&self);
            tokio::spawn(async move { uploader.status_loop().await })
        };

        Self::wait_for_shutdown().await;

        info!("Shutdown signal received, draining spool...");
        upload_handle.abort();
        status_handle.abort();

        // One final cycle so flushed-but-unsent bits are not stranded
        if let Err(e) = self.process_cycle().await {
            error!("Final drain failed: {}", e);
        }

        self.log_status();
        info!("Uploader shut down gracefully");
        Ok(())
    }

    /// Upload loop: process the spool on every tick
    async fn upload_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.upload_interval());

        loop {
            ticker.tick().await;

            if let Err(e) = self.process_cycle().await {
                error!("Upload cycle failed: {}", e);
            }
        }
    }

    /// Status loop: periodic counter summary
    async fn status_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.status_interval());
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.log_status();
        }
    }

    fn log_status(&self) {
        let pending = spool::scan_pending(Path::new(&self.config.data_dir))
            .map(|files| files.len())
            .unwrap_or(0);

        info!(
            "Uploader status: {} bits uploaded in {} uploads, {} files processed, {} pending files, {} upload errors, {} file errors",
            self.counters.bits_uploaded.load(Ordering::Relaxed),
            self.counters.uploads.load(Ordering::Relaxed),
            self.counters.files_processed.load(Ordering::Relaxed),
            pending,
            self.counters.upload_errors.load(Ordering::Relaxed),
            self.counters.file_errors.load(Ordering::Relaxed),
        );
    }

    /// One full spool pass: read, upload, then delete accepted sources
    async fn process_cycle(&self) -> Result<()> {
        let dir = PathBuf::from(&self.config.data_dir);
        let files = spool::scan_pending(&dir).context("Failed to scan spool directory")?;

        if files.is_empty() {
            debug!("No pending spool files");
            return Ok(());
        }

        info!("Found {} spool files to process", files.len());

        let mut records = Vec::new();
        let mut sources = Vec::new();

        for path in files {
            match spool::read_bit_file(&path) {
                Ok(mut file_records) => {
                    records.append(&mut file_records);
                    sources.push(path);
                }
                Err(e) => {
                    // Left in place; an operator has to look at it
                    warn!("Skipping unreadable spool file {}: {}", path.display(), e);
                    self.counters.file_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if records.is_empty() {
            return Ok(());
        }

        let uploaded_bits = if self.config.pack_words {
            let (words, remainder) = pack_words(records);
            if words.is_empty() {
                // Not enough bits for a single word yet; leave sources alone
                debug!("Only {} bits pending, below one word", remainder.len());
                return Ok(());
            }

            self.upload_batches(&words).await?;

            // Re-persist the sub-word tail before touching the sources, so
            // every bit is either accepted remotely or still on disk
            if !remainder.is_empty() {
                spool::write_pending(&dir, &remainder)
                    .context("Failed to persist word remainder")?;
            }

            words.len() as u64 * qbits_core::record::WORD_BITS as u64
        } else {
            let count = records.len() as u64;
            self.upload_batches(&records).await?;
            count
        };

        // Durably accepted: now the sources may go
        for path in &sources {
            if let Err(e) = fs::remove_file(path) {
                warn!("Failed to remove {}: {}", path.display(), e);
                self.counters.file_errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.counters
            .bits_uploaded
            .fetch_add(uploaded_bits, Ordering::Relaxed);
        self.counters
            .files_processed
            .fetch_add(sources.len() as u64, Ordering::Relaxed);

        info!(
            "Cycle complete: {} bits uploaded from {} files",
            uploaded_bits,
            sources.len()
        );
        Ok(())
    }

    /// Upload records in `batch_size` chunks, pausing between chunks
    async fn upload_batches<T: Serialize>(&self, records: &[T]) -> Result<()> {
        let batches = records.chunks(self.config.batch_size);

        for (i, batch) in batches.enumerate() {
            if i > 0 {
                sleep(self.config.inter_batch_delay()).await;
            }

            self.push_batch(batch).await?;
            self.counters.uploads.fetch_add(1, Ordering::Relaxed);
            info!("Uploaded batch of {} records", batch.len());
        }

        Ok(())
    }

    /// POST one batch to the dataset store
    async fn push_batch<T: Serialize>(&self, batch: &[T]) -> Result<()> {
        let response = match self
            .client
            .post(&self.config.dataset_url)
            .bearer_auth(&self.token)
            .json(&batch)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.counters.upload_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e).context("Failed to reach dataset store");
            }
        };

        if response.status().is_success() {
            Ok(())
        } else {
            self.counters.upload_errors.fetch_add(1, Ordering::Relaxed);
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Dataset store rejected batch: HTTP {} {}", status, body);
        }
    }

    /// Wait for shutdown signal (SIGINT or SIGTERM)
    async fn wait_for_shutdown() {
        #[cfg(unix)]
        {
            use futures::stream::StreamExt;
            use signal_hook::consts::signal::*;
            use signal_hook_tokio::Signals;

            let mut signals =
                Signals::new([SIGINT, SIGTERM]).expect("Failed to register signal handlers");

            if let Some(signal) = signals.next().await {
                info!("Received signal: {:?}", signal);
            }
        }

        #[cfg(windows)]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for Ctrl+C");
            info!("Received Ctrl+C signal");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = if args.env_mode {
        info!("Loading configuration from environment variables");
        UploaderConfig::from_env().context("Failed to load uploader configuration")?
    } else {
        info!("Loading configuration from file: {:?}", args.config);
        UploaderConfig::from_file(&args.config)
            .context("Failed to load uploader configuration")?
    };

    let uploader = Arc::new(Uploader::new(config)?);
    uploader.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use qbits_core::record::BitRecord;

    fn test_config(dataset_url: String, data_dir: &Path, pack_words: bool) -> UploaderConfig {
        UploaderConfig {
            dataset_url,
            dataset_token: Some("test-token".to_string()),
            data_dir: data_dir.to_string_lossy().into_owned(),
            upload_interval_secs: 600,
            batch_size: 4,
            inter_batch_delay_secs: 0,
            pack_words,
            status_interval_secs: 60,
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("qbits-uploader-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn seed_spool(dir: &Path, name: &str, bits: &[u8]) -> PathBuf {
        let records: Vec<BitRecord> = bits
            .iter()
            .map(|&bit| BitRecord::new(Utc::now(), bit))
            .collect();
        let path = dir.join(name);
        fs::write(&path, serde_json::to_vec(&records).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn accepted_upload_deletes_the_sources() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            // 6 records in batches of 4
            .expect(2)
            .create_async()
            .await;

        let dir = temp_dir("accepted");
        let file_a = seed_spool(&dir, "bits_20250101_000000_0000.json", &[1, 0, 1]);
        let file_b = seed_spool(&dir, "bits_20250101_000001_0000.json", &[0, 0, 1]);

        let uploader = Uploader::new(test_config(server.url(), &dir, false)).unwrap();
        uploader.process_cycle().await.unwrap();

        mock.assert_async().await;
        assert!(!file_a.exists());
        assert!(!file_b.exists());
        assert_eq!(uploader.counters.bits_uploaded.load(Ordering::Relaxed), 6);
        assert_eq!(uploader.counters.uploads.load(Ordering::Relaxed), 2);
        assert_eq!(uploader.counters.files_processed.load(Ordering::Relaxed), 2);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn rejected_upload_keeps_the_sources() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let dir = temp_dir("rejected");
        let file = seed_spool(&dir, "bits_20250101_000000_0000.json", &[1, 0]);

        let uploader = Uploader::new(test_config(server.url(), &dir, false)).unwrap();
        let result = uploader.process_cycle().await;

        assert!(result.is_err());
        mock.assert_async().await;
        assert!(file.exists());
        assert_eq!(uploader.counters.upload_errors.load(Ordering::Relaxed), 1);
        assert_eq!(uploader.counters.bits_uploaded.load(Ordering::Relaxed), 0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn packed_cycle_persists_the_remainder() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let dir = temp_dir("packed");
        let bits: Vec<u8> = (0..40).map(|i| (i % 2) as u8).collect();
        let source = seed_spool(&dir, "bits_20250101_000000_0000.json", &bits);

        let uploader = Uploader::new(test_config(server.url(), &dir, true)).unwrap();
        uploader.process_cycle().await.unwrap();

        mock.assert_async().await;
        assert!(!source.exists());
        assert_eq!(uploader.counters.bits_uploaded.load(Ordering::Relaxed), 32);

        // The 8 leftover bits came back as a fresh pending file
        let pending = spool::scan_pending(&dir).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(spool::read_bit_file(&pending[0]).unwrap().len(), 8);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn sub_word_spool_is_left_untouched() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(200)
            .expect(0)
            .create_async()
            .await;

        let dir = temp_dir("subword");
        let source = seed_spool(&dir, "bits_20250101_000000_0000.json", &[1, 0, 1]);

        let uploader = Uploader::new(test_config(server.url(), &dir, true)).unwrap();
        uploader.process_cycle().await.unwrap();

        mock.assert_async().await;
        assert!(source.exists());

        let _ = fs::remove_dir_all(&dir);
    }
}
