//! Error types for the qbits system
//!
//! Provides a unified error taxonomy using `thiserror` for ergonomic error handling.

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for cache and collaborator operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credential rejected by the random source
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Network communication failed
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Request exceeded its deadline
    #[error("Request timed out")]
    Timeout,

    /// Source returned HTTP 429
    #[error("Rate limit exceeded")]
    RateLimit,

    /// Source returned an unusable response
    #[error("Source API error: {0}")]
    Api(String),

    /// Retry budget spent without a successful fetch
    #[error("All {attempts} fetch attempts failed")]
    Exhausted { attempts: u32 },

    /// Initial blocking load failed; the cache cannot be constructed
    #[error("Initial load failed: {0}")]
    Init(String),

    /// Both buffers empty with no replacement ready
    #[error("No random bits available")]
    NoData,

    /// Caller-supplied argument out of range
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Check if error is transient and absorbed by the fetch retry loop
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout | Error::RateLimit | Error::Api(_)
        )
    }

    /// Check if error is fatal to the operation that produced it
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::Config(_) | Error::Init(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
