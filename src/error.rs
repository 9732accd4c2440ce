//! Error types for the recognition relay.
//!
//! Only the variants defined here cross the library boundary. Transport
//! failures and per-key quota responses are absorbed by the rotating client
//! and surface at most as [`RelayError::AllKeysExhausted`].

use std::path::PathBuf;
use thiserror::Error;

/// Status reported to callers when every key in the pool was tried.
pub const EXHAUSTED_STATUS: u16 = 429;

/// Errors that can occur while relaying a recognition request.
#[derive(Error, Debug)]
pub enum RelayError {
    /// No API keys were configured.
    #[error("no API keys configured - set GEMINI_API_KEYS to a comma-separated list")]
    MissingApiKeys,

    /// No rotation index store was configured.
    #[error("no index store configured - provide a KV URL and token or an index file")]
    MissingIndexStore,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to read a configuration or input file.
    #[error("failed to read '{path}': {source}")]
    FileRead {
        /// Path to the file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the JSON configuration file.
    #[error("failed to parse configuration file '{path}': {source}")]
    ConfigParse {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to build the HTTP client.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// The caller's image payload is empty or not valid base64.
    #[error("invalid image payload: {message}")]
    InvalidPayload {
        /// Description of what was invalid.
        message: String,
    },

    /// The upstream rejected the request with a non-quota status.
    #[error("upstream returned error status {status}: {body}")]
    UpstreamRequest {
        /// HTTP status code returned.
        status: u16,
        /// Response body content, verbatim.
        body: String,
    },

    /// The upstream answered with a success status but an unreadable body.
    #[error("invalid upstream response: {message}")]
    InvalidResponse {
        /// Description of what was invalid.
        message: String,
    },

    /// Every key in the pool hit its quota or failed to connect.
    #[error("all {attempts} API keys are exhausted or unreachable, try again later")]
    AllKeysExhausted {
        /// Number of keys attempted.
        attempts: usize,
    },
}

impl RelayError {
    /// Whether this error comes from server-side configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingApiKeys
                | Self::MissingIndexStore
                | Self::InvalidConfig(_)
                | Self::ConfigParse { .. }
                | Self::HttpClient(_)
        )
    }

    /// HTTP-style status code to report to the caller.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidPayload { .. } => 400,
            Self::UpstreamRequest { status, .. } => *status,
            Self::InvalidResponse { .. } => 502,
            Self::AllKeysExhausted { .. } => EXHAUSTED_STATUS,
            _ => 500,
        }
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
