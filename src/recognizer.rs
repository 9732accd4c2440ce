//! Recognition orchestration.
//!
//! Wires the key pool, index store, and Gemini adapter into a rotating
//! client, and shapes results for callers.

use crate::config::{Config, StoreConfig};
use crate::error::{RelayError, Result};
use crate::gemini::{self, GeminiClient, GenerateContentRequest, ImagePayload};
use crate::keys::KeyPool;
use crate::rotation::{AttemptRecord, RotatingClient};
use crate::store::{FileBackend, IndexStore, KvBackend};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Recognizes document images through the Gemini API.
#[derive(Debug)]
pub struct Recognizer {
    config: Arc<Config>,
    client: RotatingClient<GeminiClient>,
}

impl Recognizer {
    /// Create a recognizer, building the index store from configuration.
    pub fn new(config: Config) -> Result<Self> {
        let store = build_store(&config)?;
        Self::with_store(config, store)
    }

    /// Create a recognizer over an existing index store.
    pub fn with_store(config: Config, store: IndexStore) -> Result<Self> {
        let pool = Arc::new(KeyPool::parse(config.api_keys.as_deref())?);
        let upstream = GeminiClient::new(&config.upstream)?;
        info!(
            keys = pool.size(),
            model = %config.upstream.model,
            "Recognizer ready"
        );

        Ok(Self {
            config: Arc::new(config),
            client: RotatingClient::new(pool, store, upstream),
        })
    }

    /// Recognize text in a base64 image, optionally prefixed with a data-URI header.
    pub async fn recognize(&self, image: &str) -> Result<Recognition> {
        let payload = ImagePayload::parse(image)?;
        self.recognize_payload(&payload).await
    }

    /// Recognize text in an already-parsed image.
    pub async fn recognize_payload(&self, payload: &ImagePayload) -> Result<Recognition> {
        debug!(
            mime_type = %payload.mime_type,
            bytes = payload.decoded_len(),
            "Recognizing image"
        );

        let request = GenerateContentRequest::recognition(
            &self.config.upstream.prompt,
            payload,
            self.config.upstream.temperature,
        );
        let success = self.client.call(&request).await?;
        let text = gemini::decode_text(&success.body)?;

        Ok(Recognition {
            text,
            key_index: success.key_index,
            attempts: success.attempts,
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The key pool.
    pub fn pool(&self) -> &KeyPool {
        self.client.pool()
    }
}

/// Build the configured index store.
pub fn build_store(config: &Config) -> Result<IndexStore> {
    match &config.store {
        None => Err(RelayError::MissingIndexStore),
        Some(StoreConfig::Memory) => Ok(IndexStore::memory()),
        Some(StoreConfig::File { path }) => Ok(IndexStore::new(FileBackend::new(path))),
        Some(StoreConfig::Kv { url, token }) => {
            let backend = KvBackend::new(url, token, config.upstream.timeout)?;
            Ok(IndexStore::new(backend))
        }
    }
}

/// Recognized text and how it was obtained.
#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    /// Recognized text.
    pub text: String,
    /// Pool position of the key that succeeded.
    pub key_index: usize,
    /// Attempts made, in order.
    pub attempts: Vec<AttemptRecord>,
}

/// Caller-facing error document.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// HTTP-style status code.
    pub status: u16,
    /// Upstream error body, when the upstream rejected the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&RelayError> for ErrorBody {
    fn from(error: &RelayError) -> Self {
        let details = match error {
            RelayError::UpstreamRequest { body, .. } => Some(body.clone()),
            _ => None,
        };
        let message = match error {
            RelayError::UpstreamRequest { status, .. } => {
                format!("upstream API rejected the request with status {status}")
            }
            other => other.to_string(),
        };

        Self {
            error: message,
            status: error.status_code(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_error_body_upstream_details() {
        let err = RelayError::UpstreamRequest {
            status: 400,
            body: r#"{"error":{"message":"Invalid image"}}"#.into(),
        };
        let body = ErrorBody::from(&err);
        assert_eq!(body.status, 400);
        assert!(body.details.unwrap().contains("Invalid image"));
    }

    #[test]
    fn test_error_body_exhausted() {
        let body = ErrorBody::from(&RelayError::AllKeysExhausted { attempts: 2 });
        assert_eq!(body.status, 429);
        assert!(body.error.contains("try again later"));
        assert!(body.details.is_none());

        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("details").is_none());
    }

    #[test]
    fn test_build_store_requires_config() {
        let config = Config::default();
        assert!(matches!(
            build_store(&config),
            Err(RelayError::MissingIndexStore)
        ));

        let config = Config {
            store: Some(StoreConfig::File {
                path: PathBuf::from("rotation.json"),
            }),
            ..Default::default()
        };
        assert!(build_store(&config).is_ok());
    }

    #[test]
    fn test_recognizer_requires_keys() {
        let err = Recognizer::with_store(Config::default(), IndexStore::memory()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_recognizer_setup_failure_reports_500() {
        let config = Config {
            api_keys: Some("key-a,key-b".into()),
            store: None,
            ..Default::default()
        };
        let err = Recognizer::new(config).unwrap_err();
        assert!(matches!(err, RelayError::MissingIndexStore));

        let body = ErrorBody::from(&err);
        assert_eq!(body.status, 500);
        assert!(!body.error.is_empty());
    }
}
