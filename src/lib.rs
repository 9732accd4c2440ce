//! # OCR Relay
//!
//! Document recognition through the Gemini API, spread across a pool of
//! API keys.
//!
//! Each key carries a daily quota. The relay remembers which key was used
//! last in a small shared store, starts every call there, and moves on to the
//! next key when the upstream answers `429` or cannot be reached. Any other
//! upstream error is returned as-is, since another key would not fix it.
//!
//! ## Features
//!
//! - **Key rotation**: round-robin failover across a fixed key pool
//! - **Shared index**: rotation position kept in a JSON file or a Redis-over-HTTP KV service
//! - **Best-effort persistence**: an unreachable store never blocks recognition
//! - **Data URIs**: `data:image/png;base64,...` payloads are accepted and stripped
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ocr_relay::{Config, Recognizer, StoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config {
//!         api_keys: Some("key-one,key-two".to_string()),
//!         store: Some(StoreConfig::File {
//!             path: "rotation.json".into(),
//!         }),
//!         ..Default::default()
//!     };
//!
//!     let recognizer = Recognizer::new(config)?;
//!     let result = recognizer.recognize("data:image/png;base64,iVBORw0KGgo=").await?;
//!     println!("{}", result.text);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Keys come from `GEMINI_API_KEYS`; the index store from `KV_REST_API_URL`
//! and `KV_REST_API_TOKEN`, or `OCR_RELAY_INDEX_FILE`. See [`Config`] and
//! [`Args`] for everything else.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod gemini;
pub mod keys;
pub mod recognizer;
pub mod rotation;
pub mod store;

// Re-exports for convenience
pub use config::{Args, Config, StoreConfig, UpstreamConfig};
pub use error::{RelayError, Result};
pub use gemini::{GeminiClient, GenerateContentRequest, ImagePayload};
pub use keys::KeyPool;
pub use recognizer::{ErrorBody, Recognition, Recognizer};
pub use rotation::{AttemptRecord, Decision, RotatingClient, Rotation, RotationState, Upstream};
pub use store::{FileBackend, IndexBackend, IndexStore, KvBackend, MemoryBackend};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
