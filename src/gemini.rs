//! Gemini `generateContent` adapter.
//!
//! Builds the request envelope for a document image, sends it with a given
//! API key, and pulls the recognized text out of the response.

use crate::config::UpstreamConfig;
use crate::error::{RelayError, Result};
use crate::rotation::{TransportError, Upstream, UpstreamReply};
use async_trait::async_trait;
use base64::engine::general_purpose::{GeneralPurpose, PAD, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::{Engine, alphabet};
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::trace;

/// Text returned when the upstream succeeds but yields no text.
pub const NO_TEXT_FALLBACK: &str = "No text could be recognized in the image.";

/// Media type assumed when the payload carries no data-URI header.
pub const DEFAULT_MIME_TYPE: &str = "image/jpeg";

/// Header carrying the API key.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Standard alphabet, padding optional.
const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    PAD.with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// URL-safe alphabet, padding optional.
const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    PAD.with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A base64-encoded image and its media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    /// Media type, e.g. `image/png`.
    pub mime_type: String,
    /// Padded standard base64 without any data-URI header.
    pub data: String,
}

impl ImagePayload {
    /// Parse a caller payload, stripping an optional `data:<mime>;base64,` header.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (mime_type, data) = match raw.strip_prefix("data:") {
            Some(rest) => {
                let (header, data) = rest
                    .split_once(',')
                    .ok_or_else(|| invalid("data URI has no ',' separator"))?;
                let mime = header
                    .split(';')
                    .next()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .unwrap_or(DEFAULT_MIME_TYPE);
                if !header.split(';').any(|p| p.trim() == "base64") {
                    return Err(invalid("data URI is not base64-encoded"));
                }
                (mime.to_string(), data)
            }
            None => (DEFAULT_MIME_TYPE.to_string(), raw),
        };

        // Line-wrapped base64 is common in pasted payloads
        let data: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        if data.is_empty() {
            return Err(invalid("image data is empty"));
        }
        let bytes = LENIENT_STANDARD
            .decode(&data)
            .or_else(|_| LENIENT_URL_SAFE.decode(&data))
            .map_err(|e| invalid(&format!("image data is not valid base64: {e}")))?;

        // Forward padded standard base64 whatever form the caller sent
        Ok(Self {
            mime_type,
            data: STANDARD.encode(&bytes),
        })
    }

    /// Encode raw image bytes.
    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(invalid("image data is empty"));
        }
        Ok(Self {
            mime_type: mime_type.into(),
            data: STANDARD.encode(bytes),
        })
    }

    /// Approximate decoded size in bytes.
    pub fn decoded_len(&self) -> usize {
        let padding = self.data.bytes().rev().take_while(|b| *b == b'=').count();
        (self.data.len() / 4 * 3).saturating_sub(padding)
    }
}

fn invalid(message: &str) -> RelayError {
    RelayError::InvalidPayload {
        message: message.to_string(),
    }
}

/// Guess an image media type from a file extension.
pub fn mime_from_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "pdf" => "application/pdf",
        _ => DEFAULT_MIME_TYPE,
    }
}

/// Request body for `models/{model}:generateContent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    /// Conversation turns; a single user turn here.
    pub contents: Vec<Content>,
    /// Sampling settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

/// One conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    /// Speaker role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content parts.
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// A text or inline-data part.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Inline binary content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

/// Base64 bytes with their media type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    /// Media type.
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
}

/// Sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Sampling temperature.
    pub temperature: f32,
}

/// Successful `generateContent` response, reduced to what we read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateContentResponse {
    /// Generated candidates.
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

/// A generated candidate.
#[derive(Debug, Clone, Deserialize)]
pub struct Candidate {
    /// Candidate content, absent when generation was blocked.
    #[serde(default)]
    pub content: Option<Content>,
}

impl GenerateContentRequest {
    /// A single-turn request asking the model to transcribe `image`.
    pub fn recognition(prompt: &str, image: &ImagePayload, temperature: f32) -> Self {
        Self {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![
                    Part {
                        text: Some(prompt.to_string()),
                        ..Default::default()
                    },
                    Part {
                        inline_data: Some(InlineData {
                            mime_type: image.mime_type.clone(),
                            data: image.data.clone(),
                        }),
                        ..Default::default()
                    },
                ],
            }],
            generation_config: Some(GenerationConfig { temperature }),
        }
    }
}

/// Text of the first candidate, or [`NO_TEXT_FALLBACK`].
pub fn extract_text(response: &GenerateContentResponse) -> String {
    response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .and_then(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .find(|t| !t.trim().is_empty())
        })
        .map_or_else(|| NO_TEXT_FALLBACK.to_string(), str::to_string)
}

/// Decode a success body and extract its text.
pub fn decode_text(body: &str) -> Result<String> {
    let response: GenerateContentResponse =
        serde_json::from_str(body).map_err(|e| RelayError::InvalidResponse {
            message: format!("failed to parse generateContent response: {e}"),
        })?;
    Ok(extract_text(&response))
}

/// HTTP transport for the Gemini API.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    url: String,
}

impl GeminiClient {
    /// Create a client for the configured model.
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .default_headers(headers)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(RelayError::HttpClient)?;

        Ok(Self {
            client,
            url: format!(
                "{}/v1beta/models/{}:generateContent",
                config.base_url.trim_end_matches('/'),
                config.model
            ),
        })
    }

    /// The `generateContent` URL in use.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Upstream for GeminiClient {
    type Request = GenerateContentRequest;

    async fn send(
        &self,
        api_key: &str,
        request: &GenerateContentRequest,
    ) -> std::result::Result<UpstreamReply, TransportError> {
        trace!(url = %self.url, "Sending generateContent request");

        let response = self
            .client
            .post(&self.url)
            .header(API_KEY_HEADER, api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(UpstreamReply { status, body })
    }
}
