//! Configuration management for the recognition relay.
//!
//! Supports configuration via CLI arguments, environment variables,
//! and a JSON configuration file, with CLI/env values taking precedence.

use crate::error::{RelayError, Result};
use crate::keys::KeyPool;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default recognition prompt.
pub const DEFAULT_PROMPT: &str = "Extract all text from this document image. \
Preserve the original reading order and line breaks as closely as possible. \
Return only the extracted text, without commentary or formatting.";

/// CLI arguments for the relay.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ocr-relay",
    version,
    about = "Recognize document text through Gemini with API-key rotation",
    long_about = "ocr-relay sends a document image to the Gemini generateContent API and prints\n\
                  the recognized text. A pool of API keys is shared between invocations through\n\
                  a small index store, and a key whose daily quota is exhausted is skipped\n\
                  automatically.",
    after_help = "EXAMPLES:\n    \
        ocr-relay receipt.jpg\n    \
        ocr-relay --encoded payload.txt --json-logs\n    \
        cat payload.txt | ocr-relay --encoded -"
)]
pub struct Args {
    /// Image file to recognize, or `-` for stdin
    pub input: PathBuf,

    /// Treat the input as a base64 string or data URI instead of raw image bytes
    #[arg(long)]
    pub encoded: bool,

    /// Comma-separated Gemini API keys
    #[arg(long, env = "GEMINI_API_KEYS", hide_env_values = true)]
    pub api_keys: Option<String>,

    /// Path to a JSON file holding the shared rotation index
    #[arg(long, env = "OCR_RELAY_INDEX_FILE")]
    pub index_file: Option<PathBuf>,

    /// Base URL of the key-value REST service holding the rotation index
    #[arg(long, env = "KV_REST_API_URL")]
    pub kv_url: Option<String>,

    /// Bearer token for the key-value REST service
    #[arg(long, env = "KV_REST_API_TOKEN", hide_env_values = true)]
    pub kv_token: Option<String>,

    /// Gemini model identifier
    #[arg(short, long, env = "OCR_RELAY_MODEL")]
    pub model: Option<String>,

    /// Gemini API base URL
    #[arg(long, env = "OCR_RELAY_BASE_URL")]
    pub base_url: Option<String>,

    /// Sampling temperature
    #[arg(long, env = "OCR_RELAY_TEMPERATURE")]
    pub temperature: Option<f32>,

    /// Upstream request timeout in seconds
    #[arg(short, long, env = "OCR_RELAY_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Path to a JSON configuration file
    #[arg(short, long, env = "OCR_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, env = "OCR_RELAY_VERBOSE")]
    pub verbose: bool,

    /// Output logs and the result as JSON
    #[arg(long, env = "OCR_RELAY_JSON_LOGS")]
    pub json_logs: bool,

    /// Dry run - validate config without calling the API
    #[arg(long)]
    pub dry_run: bool,
}

impl Args {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Where the shared rotation index lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process memory; nothing is shared.
    Memory,
    /// A JSON file on a shared filesystem.
    File {
        /// Path to the index file.
        path: PathBuf,
    },
    /// A Redis-over-HTTP key-value service.
    Kv {
        /// Service base URL.
        url: String,
        /// Bearer token.
        token: String,
    },
}

/// Gemini API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,

    /// Instruction sent alongside the image.
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            timeout: default_timeout(),
            prompt: default_prompt(),
        }
    }
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_prompt() -> String {
    DEFAULT_PROMPT.to_string()
}

/// Full application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Raw comma-separated API key list.
    #[serde(default)]
    pub api_keys: Option<String>,

    /// Rotation index store.
    #[serde(default)]
    pub store: Option<StoreConfig>,

    /// Gemini API settings.
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RelayError::FileRead {
            path: path.clone(),
            source: e,
        })?;

        serde_json::from_str(&content).map_err(|e| RelayError::ConfigParse {
            path: path.clone(),
            source: e,
        })
    }

    /// Create configuration from CLI arguments, layered over the config file if any.
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(keys) = &args.api_keys {
            config.api_keys = Some(keys.clone());
        }
        if let Some(store) = store_from_args(args)? {
            config.store = Some(store);
        }
        if let Some(model) = &args.model {
            config.upstream.model = model.clone();
        }
        if let Some(base_url) = &args.base_url {
            config.upstream.base_url = base_url.clone();
        }
        if let Some(temperature) = args.temperature {
            config.upstream.temperature = temperature;
        }
        if let Some(timeout) = args.timeout {
            config.upstream.timeout = Duration::from_secs(timeout);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        KeyPool::parse(self.api_keys.as_deref())?;

        match &self.store {
            None => return Err(RelayError::MissingIndexStore),
            Some(StoreConfig::Kv { url, token }) if url.trim().is_empty() || token.trim().is_empty() => {
                return Err(RelayError::MissingIndexStore);
            }
            Some(StoreConfig::File { path }) if path.as_os_str().is_empty() => {
                return Err(RelayError::MissingIndexStore);
            }
            Some(_) => {}
        }

        if self.upstream.base_url.trim().is_empty() {
            return Err(RelayError::InvalidConfig(
                "base URL cannot be empty".to_string(),
            ));
        }
        if self.upstream.model.trim().is_empty() {
            return Err(RelayError::InvalidConfig(
                "model cannot be empty".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.upstream.temperature) {
            return Err(RelayError::InvalidConfig(
                "temperature must be between 0 and 2".to_string(),
            ));
        }
        if self.upstream.timeout.is_zero() {
            return Err(RelayError::InvalidConfig(
                "timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// The KV service wins over a local file when both are given.
fn store_from_args(args: &Args) -> Result<Option<StoreConfig>> {
    match (&args.kv_url, &args.kv_token) {
        (Some(url), Some(token)) => {
            return Ok(Some(StoreConfig::Kv {
                url: url.clone(),
                token: token.clone(),
            }));
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err(RelayError::InvalidConfig(
                "KV_REST_API_URL and KV_REST_API_TOKEN must be set together".to_string(),
            ));
        }
        (None, None) => {}
    }

    Ok(args
        .index_file
        .as_ref()
        .map(|path| StoreConfig::File { path: path.clone() }))
}

/// Custom serde module for humantime Duration parsing.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        // "ms" must be checked before "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
