//! Shared rotation index storage.
//!
//! The store holds a single integer cell, `current_key_index`, that tells
//! every relay instance which key to try first. It is a hint, not a lock:
//! [`IndexStore::read`] falls back to `0` and [`IndexStore::write`] swallows
//! failures, because each call re-validates keys against the upstream anyway.
//!
//! Backends implement [`IndexBackend`]:
//!
//! - [`MemoryBackend`] keeps the cell in process memory.
//! - [`FileBackend`] keeps it in a JSON file, replaced atomically on write.
//! - [`KvBackend`] talks to a Redis-over-HTTP key-value service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the persisted cell.
pub const INDEX_CELL: &str = "current_key_index";

/// Failures inside a storage backend. Never surfaced to callers.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("index store unreachable: {0}")]
    Unreachable(String),

    /// The backend answered but rejected the operation.
    #[error("index store rejected request with status {status}: {body}")]
    Rejected {
        /// HTTP status code returned.
        status: u16,
        /// Response body content.
        body: String,
    },

    /// The stored value is not a non-negative integer.
    #[error("index store holds a corrupt value: {0}")]
    Corrupt(String),

    /// The cell could not be encoded for writing.
    #[error("failed to encode rotation index: {0}")]
    Encode(#[source] serde_json::Error),

    /// Local I/O failed.
    #[error("index store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A durable home for the rotation index.
#[async_trait]
pub trait IndexBackend: Send + Sync + fmt::Debug {
    /// Load the stored index, `None` if it was never written.
    async fn load(&self) -> Result<Option<usize>, StoreError>;

    /// Overwrite the stored index.
    async fn save(&self, index: usize) -> Result<(), StoreError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Best-effort front for an [`IndexBackend`].
#[derive(Debug, Clone)]
pub struct IndexStore {
    backend: Arc<dyn IndexBackend>,
}

impl IndexStore {
    /// Wrap a backend.
    pub fn new(backend: impl IndexBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// A store backed by process memory.
    pub fn memory() -> Self {
        Self::new(MemoryBackend::default())
    }

    /// Current rotation index, or `0` if unset or unreachable.
    pub async fn read(&self) -> usize {
        match self.backend.load().await {
            Ok(Some(index)) => index,
            Ok(None) => {
                debug!(backend = self.backend.name(), "Rotation index not set, starting at 0");
                0
            }
            Err(e) => {
                warn!(
                    backend = self.backend.name(),
                    error = %e,
                    "Failed to read rotation index, starting at 0"
                );
                0
            }
        }
    }

    /// Persist the rotation index. Failures are logged and dropped; callers
    /// must not rely on the write landing.
    pub async fn write(&self, index: usize) {
        match self.backend.save(index).await {
            Ok(()) => debug!(backend = self.backend.name(), index, "Persisted rotation index"),
            Err(e) => warn!(
                backend = self.backend.name(),
                index,
                error = %e,
                "Failed to persist rotation index"
            ),
        }
    }
}

/// In-process cell.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    cell: Mutex<Option<usize>>,
}

impl MemoryBackend {
    /// A cell that already holds `index`.
    pub fn with_index(index: usize) -> Self {
        Self {
            cell: Mutex::new(Some(index)),
        }
    }
}

#[async_trait]
impl IndexBackend for MemoryBackend {
    async fn load(&self) -> Result<Option<usize>, StoreError> {
        Ok(*self.cell.lock())
    }

    async fn save(&self, index: usize) -> Result<(), StoreError> {
        *self.cell.lock() = Some(index);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl<T: IndexBackend + ?Sized> IndexBackend for Arc<T> {
    async fn load(&self) -> Result<Option<usize>, StoreError> {
        (**self).load().await
    }

    async fn save(&self, index: usize) -> Result<(), StoreError> {
        (**self).save(index).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FileCell {
    current_key_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

/// JSON file holding the cell, shared by every process that can see it.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileBackend {
    /// Use the file at `path`. It is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl IndexBackend for FileBackend {
    async fn load(&self) -> Result<Option<usize>, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let cell: FileCell = serde_json::from_str(&contents)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.path.display())))?;
        Ok(Some(cell.current_key_index))
    }

    async fn save(&self, index: usize) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let cell = FileCell {
            current_key_index: index,
            updated_at: Some(Utc::now()),
        };
        let json = serde_json::to_string_pretty(&cell).map_err(StoreError::Encode)?;
        write_atomic(&self.path, json.as_bytes()).await
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Distinguishes temp files of concurrent writes within one process.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write to a sibling temp file, then rename over the target.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| INDEX_CELL.to_string());
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}.{seq}", std::process::id()));

    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct KvEnvelope {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Redis-over-HTTP key-value service (`GET /get/<key>`, `POST /set/<key>/<value>`).
pub struct KvBackend {
    client: Client,
    base_url: String,
    token: String,
}

impl fmt::Debug for KvBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvBackend")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl KvBackend {
    /// Connect to the service at `base_url` with a bearer `token`.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn call(&self, request: reqwest::RequestBuilder) -> Result<KvEnvelope, StoreError> {
        let response = request
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        if !status.is_success() {
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: KvEnvelope =
            serde_json::from_str(&body).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if let Some(error) = envelope.error {
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                body: error,
            });
        }
        Ok(envelope)
    }
}

#[async_trait]
impl IndexBackend for KvBackend {
    async fn load(&self) -> Result<Option<usize>, StoreError> {
        let url = format!("{}/get/{INDEX_CELL}", self.base_url);
        let envelope = self.call(self.client.get(url)).await?;
        parse_kv_index(envelope.result)
    }

    async fn save(&self, index: usize) -> Result<(), StoreError> {
        let url = format!("{}/set/{INDEX_CELL}/{index}", self.base_url);
        self.call(self.client.post(url)).await.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "kv"
    }
}

/// The service returns strings for stored values, but accept bare numbers too.
fn parse_kv_index(result: Option<serde_json::Value>) -> Result<Option<usize>, StoreError> {
    match result {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .and_then(|v| usize::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| StoreError::Corrupt(n.to_string())),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| StoreError::Corrupt(s)),
        Some(other) => Err(StoreError::Corrupt(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug)]
    struct DownBackend;

    #[async_trait]
    impl IndexBackend for DownBackend {
        async fn load(&self) -> Result<Option<usize>, StoreError> {
            Err(StoreError::Unreachable("connection refused".into()))
        }

        async fn save(&self, _index: usize) -> Result<(), StoreError> {
            Err(StoreError::Unreachable("connection refused".into()))
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn test_memory_defaults_to_zero() {
        let store = IndexStore::memory();
        assert_eq!(store.read().await, 0);
        store.write(2).await;
        assert_eq!(store.read().await, 2);
    }

    #[tokio::test]
    async fn test_unreachable_backend_degrades() {
        let store = IndexStore::new(DownBackend);
        assert_eq!(store.read().await, 0);
        store.write(3).await;
        assert_eq!(store.read().await, 0);
    }

    #[tokio::test]
    async fn test_file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rotation.json");

        let backend = FileBackend::new(&file);
        assert_eq!(backend.load().await.unwrap(), None);

        backend.save(4).await.unwrap();
        assert!(file.exists());

        // A second instance sees the same cell
        let other = FileBackend::new(&file);
        assert_eq!(other.load().await.unwrap(), Some(4));

        let contents = tokio::fs::read_to_string(&file).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["current_key_index"], 4);
        assert!(value["updated_at"].is_string());
    }

    #[tokio::test]
    async fn test_file_backend_corrupt_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rotation.json");
        tokio::fs::write(&file, r#"{"current_key_index": -1}"#)
            .await
            .unwrap();

        let backend = FileBackend::new(&file);
        assert!(matches!(backend.load().await, Err(StoreError::Corrupt(_))));
        assert_eq!(IndexStore::new(backend).read().await, 0);
    }

    #[tokio::test]
    async fn test_file_backends_sharing_a_path_write_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rotation.json");
        let first = FileBackend::new(&file);
        let second = FileBackend::new(&file);

        for round in 0..20 {
            let (a, b) = tokio::join!(first.save(round), second.save(round + 1));
            a.unwrap();
            b.unwrap();
        }

        let stored = first.load().await.unwrap().unwrap();
        assert!(stored == 19 || stored == 20);

        // No temp files left behind
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["rotation.json"]);
    }

    #[tokio::test]
    async fn test_file_backend_write_failure_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("missing").join("rotation.json"));

        assert!(matches!(backend.save(1).await, Err(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn test_kv_backend_reads_and_writes() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/get/current_key_index"))
            .and(header_eq("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": "2"})))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/set/current_key_index/3"))
            .and(header_eq("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": "OK"})))
            .expect(1)
            .mount(&server)
            .await;

        let backend = KvBackend::new(server.uri(), "secret", Duration::from_secs(5)).unwrap();
        assert_eq!(backend.load().await.unwrap(), Some(2));
        backend.save(3).await.unwrap();
    }

    #[tokio::test]
    async fn test_kv_backend_unset_and_rejected() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/get/current_key_index"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": null})))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(serde_json::json!({"error": "Unauthorized"})),
            )
            .mount(&server)
            .await;

        let backend = KvBackend::new(server.uri(), "wrong", Duration::from_secs(5)).unwrap();
        assert_eq!(backend.load().await.unwrap(), None);
        assert!(matches!(
            backend.save(1).await,
            Err(StoreError::Rejected { status: 401, .. })
        ));

        // The store front swallows the rejection
        IndexStore::new(backend).write(1).await;
    }

    #[test]
    fn test_parse_kv_index() {
        assert_eq!(parse_kv_index(None).unwrap(), None);
        assert_eq!(parse_kv_index(Some(serde_json::json!(5))).unwrap(), Some(5));
        assert_eq!(parse_kv_index(Some(serde_json::json!(" 7 "))).unwrap(), Some(7));
        assert!(parse_kv_index(Some(serde_json::json!("-1"))).is_err());
        assert!(parse_kv_index(Some(serde_json::json!(-1))).is_err());
        assert!(parse_kv_index(Some(serde_json::json!([1]))).is_err());
    }
}
