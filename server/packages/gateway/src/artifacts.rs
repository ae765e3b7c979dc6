//! Turns files found in a sandbox into [`Artifact`] records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use janus_agent_schema::{Artifact, ArtifactKind, ArtifactPayload};
use janus_error::GatewayError;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::MaterializerConfig;

#[derive(Debug, Clone, Error)]
pub enum ArtifactStoreError {
    #[error("artifact store request failed: {0}")]
    Transport(String),
    #[error("artifact store returned {status}: {message}")]
    Status { status: u16, message: String },
}

/// Backing storage for URL-referenced artifacts. Storage lifetime
/// enforcement belongs to the store.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `bytes` and returns the URL clients download them from.
    async fn put(
        &self,
        id: &str,
        mime_type: &str,
        bytes: Vec<u8>,
        ttl: Duration,
    ) -> Result<String, ArtifactStoreError>;
}

/// Uploads to an external object store with `PUT {base}/artifacts/{id}`.
pub struct HttpArtifactStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

impl HttpArtifactStore {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn put(
        &self,
        id: &str,
        mime_type: &str,
        bytes: Vec<u8>,
        ttl: Duration,
    ) -> Result<String, ArtifactStoreError> {
        let fallback = format!("{}/artifacts/{id}", self.base_url);
        let mut builder = self
            .client
            .put(&fallback)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .header("x-janus-ttl-seconds", ttl.as_secs().to_string())
            .body(bytes);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| ArtifactStoreError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ArtifactStoreError::Status {
                status: status.as_u16(),
                message,
            });
        }
        // Stores may answer with a signed URL; otherwise the object path is the URL.
        let body = response.bytes().await.unwrap_or_default();
        Ok(serde_json::from_slice::<UploadResponse>(&body)
            .map(|upload| upload.url)
            .unwrap_or(fallback))
    }
}

struct StoredArtifact {
    mime_type: String,
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// How often [`LocalArtifactStore::start_sweeper`] drops expired entries.
pub const LOCAL_SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Keeps URL-referenced artifacts in memory and serves them from
/// `GET /v1/artifacts/{id}` until they expire.
#[derive(Clone)]
pub struct LocalArtifactStore {
    public_base: String,
    entries: Arc<Mutex<Entries>>,
}

type Entries = HashMap<String, StoredArtifact>;

fn lock(entries: &Mutex<Entries>) -> MutexGuard<'_, Entries> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LocalArtifactStore {
    /// `public_base` is the externally reachable origin of this gateway.
    pub fn new(public_base: &str) -> Self {
        Self {
            public_base: public_base.trim_end_matches('/').to_string(),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the artifact's mime type and bytes if it has not expired.
    pub fn get(&self, id: &str) -> Option<(String, Vec<u8>)> {
        let mut entries = lock(&self.entries);
        purge_expired(&mut entries);
        entries
            .get(id)
            .map(|entry| (entry.mime_type.clone(), entry.bytes.clone()))
    }

    /// Live entries; expired ones are dropped first.
    pub fn len(&self) -> usize {
        let mut entries = lock(&self.entries);
        purge_expired(&mut entries);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired entries every `period`, so artifacts nobody downloads
    /// do not stay in memory.
    pub fn start_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = purge_expired(&mut lock(&entries));
                if removed > 0 {
                    debug!(removed, "expired artifacts dropped");
                }
            }
        })
    }
}

fn purge_expired(entries: &mut Entries) -> usize {
    let before = entries.len();
    let now = Instant::now();
    entries.retain(|_, entry| entry.expires_at > now);
    before - entries.len()
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(
        &self,
        id: &str,
        mime_type: &str,
        bytes: Vec<u8>,
        ttl: Duration,
    ) -> Result<String, ArtifactStoreError> {
        let mut entries = lock(&self.entries);
        purge_expired(&mut entries);
        entries.insert(
            id.to_string(),
            StoredArtifact {
                mime_type: mime_type.to_string(),
                bytes,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(format!("{}/v1/artifacts/{id}", self.public_base))
    }
}

/// A finalized file read out of the sandbox.
#[derive(Debug, Clone)]
pub struct RawFile {
    pub path: String,
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Clone)]
pub struct ArtifactMaterializer {
    config: MaterializerConfig,
    store: Arc<dyn ArtifactStore>,
}

impl ArtifactMaterializer {
    pub fn new(config: MaterializerConfig, store: Arc<dyn ArtifactStore>) -> Self {
        Self { config, store }
    }

    /// Chooses the payload form once: inline up to the threshold, URL above it.
    pub async fn materialize(&self, raw: RawFile) -> Result<Artifact, GatewayError> {
        let size_bytes = raw.bytes.len() as u64;
        let mime_type = raw
            .mime_type
            .unwrap_or_else(|| mime_for_path(&raw.path).to_string());
        let display_name = raw
            .display_name
            .unwrap_or_else(|| file_name(&raw.path).to_string());
        let id = format!("art_{}", uuid::Uuid::new_v4().simple());

        let (payload, ttl_seconds) = if size_bytes <= self.config.inline_threshold {
            (
                ArtifactPayload::InlineBase64 {
                    data: STANDARD.encode(&raw.bytes),
                },
                None,
            )
        } else {
            let url = self
                .store
                .put(&id, &mime_type, raw.bytes, self.config.url_ttl)
                .await
                .map_err(|err| GatewayError::ToolCallFailed {
                    tool: "artifact_store".to_string(),
                    message: err.to_string(),
                })?;
            debug!(artifact_id = %id, url = %url, "artifact stored");
            (
                ArtifactPayload::UrlReference { url },
                Some(self.config.url_ttl.as_secs()),
            )
        };

        let artifact = Artifact {
            kind: ArtifactKind::from_mime(&mime_type),
            id,
            mime_type,
            size_bytes,
            display_name,
            payload,
            ttl_seconds,
        };
        info!(
            artifact_id = %artifact.id,
            path = %raw.path,
            size_bytes,
            inline = artifact.is_inline(),
            "artifact materialized"
        );
        Ok(artifact)
    }
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn mime_for_path(path: &str) -> &'static str {
    let extension = file_name(path)
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        "json" => "application/json",
        "jsonl" | "ndjson" => "application/x-ndjson",
        "parquet" => "application/vnd.apache.parquet",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "pdf" => "application/pdf",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn materializer(threshold: u64) -> (ArtifactMaterializer, LocalArtifactStore) {
        let store = LocalArtifactStore::new("https://janus.test/");
        let materializer = ArtifactMaterializer::new(
            MaterializerConfig {
                inline_threshold: threshold,
                url_ttl: Duration::from_secs(60),
            },
            Arc::new(store.clone()),
        );
        (materializer, store)
    }

    fn raw(path: &str, size: usize) -> RawFile {
        RawFile {
            path: path.to_string(),
            bytes: vec![7; size],
            mime_type: None,
            display_name: None,
        }
    }

    #[tokio::test]
    async fn threshold_sized_files_are_inlined() {
        let (materializer, store) = materializer(16);
        let artifact = materializer
            .materialize(raw("/workspace/artifacts/cat.png", 16))
            .await
            .expect("artifact");
        assert!(artifact.is_inline());
        assert_eq!(artifact.kind, ArtifactKind::Image);
        assert_eq!(artifact.display_name, "cat.png");
        assert_eq!(artifact.size_bytes, 16);
        assert_eq!(artifact.ttl_seconds, None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn one_byte_over_is_referenced_by_url() {
        let (materializer, store) = materializer(16);
        let artifact = materializer
            .materialize(raw("/workspace/artifacts/data.csv", 17))
            .await
            .expect("artifact");
        assert_eq!(artifact.kind, ArtifactKind::Dataset);
        assert_eq!(artifact.ttl_seconds, Some(60));
        let ArtifactPayload::UrlReference { url } = &artifact.payload else {
            panic!("expected url payload, got {:?}", artifact.payload);
        };
        assert_eq!(url, &format!("https://janus.test/v1/artifacts/{}", artifact.id));
        let (mime, bytes) = store.get(&artifact.id).expect("stored");
        assert_eq!(mime, "text/csv");
        assert_eq!(bytes.len(), 17);
    }

    #[tokio::test(start_paused = true)]
    async fn local_store_forgets_expired_artifacts() {
        let store = LocalArtifactStore::new("http://localhost:8088");
        store
            .put("art_1", "text/plain", b"hi".to_vec(), Duration::from_secs(5))
            .await
            .expect("put");
        assert!(store.get("art_1").is_some());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("art_1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn local_store_does_not_grow_with_undownloaded_artifacts() {
        let store = LocalArtifactStore::new("http://localhost:8088");
        for i in 0..100 {
            store
                .put(&format!("art_{i}"), "text/plain", vec![0; 64], Duration::from_secs(1))
                .await
                .expect("put");
            tokio::time::advance(Duration::from_secs(5)).await;
        }
        assert!(lock(&store.entries).len() <= 1);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_drops_expired_artifacts_without_reads() {
        let store = LocalArtifactStore::new("http://localhost:8088");
        for i in 0..3 {
            store
                .put(&format!("art_{i}"), "text/plain", vec![1], Duration::from_secs(10))
                .await
                .expect("put");
        }
        let sweeper = store.start_sweeper(Duration::from_secs(30));
        tokio::task::yield_now().await;
        assert_eq!(lock(&store.entries).len(), 3);

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert_eq!(lock(&store.entries).len(), 0);
        sweeper.abort();
    }

    #[tokio::test]
    async fn default_threshold_boundary_is_one_megabyte() {
        let store = LocalArtifactStore::new("https://janus.test");
        let materializer =
            ArtifactMaterializer::new(MaterializerConfig::default(), Arc::new(store.clone()));

        let at_threshold = materializer
            .materialize(raw("/workspace/artifacts/exact.bin", 1_000_000))
            .await
            .expect("artifact");
        assert!(at_threshold.is_inline());
        assert_eq!(at_threshold.size_bytes, 1_000_000);
        assert_eq!(at_threshold.ttl_seconds, None);

        let over = materializer
            .materialize(raw("/workspace/artifacts/over.bin", 1_000_001))
            .await
            .expect("artifact");
        assert!(!over.is_inline());
        assert!(matches!(over.payload, ArtifactPayload::UrlReference { .. }));
        assert_eq!(over.ttl_seconds, Some(3600));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn http_store_uploads_with_ttl_header() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/artifacts/art_9"))
            .and(header("x-janus-ttl-seconds", "60"))
            .and(header("content-type", "image/png"))
            .and(header("authorization", "Bearer store-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"url": "https://cdn.test/art_9?sig=1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpArtifactStore::new(&server.uri(), Some("store-token".to_string()));
        let url = store
            .put("art_9", "image/png", vec![1, 2, 3], Duration::from_secs(60))
            .await
            .expect("upload");
        assert_eq!(url, "https://cdn.test/art_9?sig=1");
    }

    #[test]
    fn mime_table_falls_back_to_octet_stream() {
        assert_eq!(mime_for_path("/a/b/Chart.PNG"), "image/png");
        assert_eq!(mime_for_path("/a/b/notes"), "application/octet-stream");
        assert_eq!(mime_for_path("report.pdf"), "application/pdf");
    }
}
