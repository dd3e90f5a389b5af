//! qbits proxy - REST frontend for the quantum bit cache
//!
//! Maps the cache API onto HTTP endpoints and feeds every served bit into
//! the write-behind sink for the upload pipeline:
//!
//! - `GET  /bit` - one quantum bit
//! - `GET  /bits?count=N` - up to `max_bits_per_request` bits
//! - `GET  /status` - buffer fill and prefetch state
//! - `GET  /stats` - operational counters
//! - `GET  /bit-stats` - bit distribution and bias significance
//! - `POST /reset-stats` - zero the counters
//!
//! The router translates cache errors into transport codes and never
//! retries on the cache's behalf.

mod sink;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use qbits_core::{BitCache, CacheConfig, Error, ProxyConfig};
use serde_json::json;
use sink::{flush_loop, BitSink};
use std::path::PathBuf;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "qbits-proxy")]
#[command(about = "Serves quantum random bits via REST API", long_about = None)]
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

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    cache: BitCache,
    sink: BitSink,
    max_bits_per_request: usize,
}

/// GET / - service descriptor
async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "name": "qbits proxy",
        "description": "Provides quantum random bits",
        "version": qbits_core::VERSION,
        "endpoints": {
            "/bit": "Get a single quantum bit",
            "/bits?count=N": "Get N quantum bits",
            "/status": "Get cache status",
            "/stats": "Get statistics",
            "/bit-stats": "Get bit distribution statistics",
            "/reset-stats": "Reset statistics (POST)",
        },
    }))
}

/// GET /bit - serve one bit
async fn serve_bit(State(state): State<AppState>) -> Response {
    match state.cache.get_bit() {
        Ok(bit) => {
            state.sink.record_many(&[bit]);
            Json(json!({ "bit": bit })).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(serde::Deserialize)]
struct BitsQuery {
    #[serde(default = "default_count")]
    count: usize,
}

fn default_count() -> usize {
    1
}

/// Router-level bound, separate from the cache's own per-call limit
fn count_in_bounds(count: usize, max: usize) -> bool {
    (1..=max).contains(&count)
}

/// GET /bits?count=N - serve a batch of bits
async fn serve_bits(State(state): State<AppState>, Query(params): Query<BitsQuery>) -> Response {
    if !count_in_bounds(params.count, state.max_bits_per_request) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!("Invalid count. Must be 1-{}", state.max_bits_per_request),
            })),
        )
            .into_response();
    }

    match state.cache.get_bits(params.count) {
        Ok(bits) => {
            state.sink.record_many(&bits);
            Json(json!({ "bits": bits, "count": bits.len() })).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// GET /status - cache status
async fn get_status(State(state): State<AppState>) -> Response {
    Json(state.cache.status()).into_response()
}

/// GET /stats - operational counters
async fn get_stats(State(state): State<AppState>) -> Response {
    Json(state.cache.stats()).into_response()
}

/// GET /bit-stats - bit distribution and bias significance
async fn get_bit_stats(State(state): State<AppState>) -> Response {
    Json(state.cache.bias_report()).into_response()
}

/// POST /reset-stats - zero counters and histogram
async fn reset_stats(State(state): State<AppState>) -> Response {
    state.cache.reset_stats();
    Json(json!({ "message": "Statistics reset successfully" })).into_response()
}

/// Fallback for unknown paths
async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Endpoint not found",
            "available_endpoints": [
                "/bit - Get a single quantum bit",
                "/bits?count=N - Get N quantum bits",
                "/status - Get cache status",
                "/stats - Get statistics",
                "/bit-stats - Get bit distribution statistics",
                "/reset-stats - Reset statistics (POST)",
            ],
        })),
    )
        .into_response()
}

/// Translate cache errors into transport codes; the router never retries
fn error_response(e: Error) -> Response {
    let (status, error) = match &e {
        Error::NoData | Error::Init(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "Quantum data unavailable")
        }
        Error::Validation(_) => (StatusCode::BAD_REQUEST, "Invalid request"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
    };

    (
        status,
        Json(json!({ "error": error, "message": e.to_string() })),
    )
        .into_response()
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for Ctrl+C");
    info!("Received shutdown signal");
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

    info!("qbits proxy v{}", qbits_core::VERSION);

    let (cache_config, proxy_config) = if args.env_mode {
        info!("Loading configuration from environment variables");
        (
            CacheConfig::from_env().context("Failed to load cache configuration")?,
            ProxyConfig::from_env().context("Failed to load proxy configuration")?,
        )
    } else {
        info!("Loading configuration from file: {:?}", args.config);
        (
            CacheConfig::from_file(&args.config).context("Failed to load cache configuration")?,
            ProxyConfig::from_file(&args.config).context("Failed to load proxy configuration")?,
        )
    };

    // Blocking initial load; a failure here is fatal
    let cache = BitCache::connect(cache_config)
        .await
        .context("Failed to initialize quantum bit cache")?;
    info!("Quantum bit cache initialized");

    let sink = BitSink::new(&proxy_config).context("Failed to initialize bit sink")?;
    let flush_handle = tokio::spawn(flush_loop(sink.clone(), proxy_config.flush_interval()));

    let state = AppState {
        cache: cache.clone(),
        sink: sink.clone(),
        max_bits_per_request: proxy_config.max_bits_per_request,
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/bit", get(serve_bit))
        .route("/bits", get(serve_bits))
        .route("/status", get(get_status))
        .route("/stats", get(get_stats))
        .route("/bit-stats", get(get_bit_stats))
        .route("/reset-stats", post(reset_stats))
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: std::net::SocketAddr = proxy_config
        .listen_address
        .parse()
        .context("Invalid listen address")?;

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain what the handlers buffered and stop background work
    info!("Flushing pending bits before exit");
    flush_handle.abort();
    sink.flush();
    cache.shutdown();

    info!("Proxy shut down gracefully");
    Ok(())
}
