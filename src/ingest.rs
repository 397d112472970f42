//! Ingestion engine.
//!
//! Turns an [`IngestRequest`] into stored chunks:
//!
//! ```text
//! request ─▶ validate ─▶ detect type ─▶ read bytes ─▶ processor
//!         ─▶ chunker ─▶ StorageManager::store_document (embeds + indexes)
//! ```
//!
//! A request names exactly one source: inline content, a file path, or a
//! URL. Batches run up to `ingestion.concurrency` documents at once; one
//! document failing never aborts the rest of the batch.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::join_all;
use lodestone_core::chunk::{AdaptiveChunker, BaseChunker, Chunker};
use lodestone_core::models::{Chunk, Document, Metadata};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::IngestionConfig;
use crate::error::RagError;
use crate::processor::{detect_content_type, ProcessorRegistry};
use crate::storage::StorageManager;

const URL_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// One document to ingest. Exactly one of `content`, `file_path`, `url`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestRequest {
    pub id: Option<String>,
    pub content: Option<String>,
    pub file_path: Option<PathBuf>,
    pub url: Option<String>,
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl IngestRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    fn validate(&self) -> Result<()> {
        let sources = [
            self.content.is_some(),
            self.file_path.is_some(),
            self.url.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();
        match sources {
            0 => Err(RagError::validation(
                "ingest request needs content, a file path, or a URL",
            )),
            1 => {
                if self.file_path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
                    return Err(RagError::validation("file path is empty"));
                }
                if self.url.as_ref().is_some_and(|u| u.trim().is_empty()) {
                    return Err(RagError::validation("URL is empty"));
                }
                if self.id.as_ref().is_some_and(|id| id.trim().is_empty()) {
                    return Err(RagError::validation("document id is empty"));
                }
                Ok(())
            }
            _ => Err(RagError::validation(
                "ingest request must name exactly one of content, file path, or URL",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub document_id: String,
    pub content_type: String,
    pub chunk_count: usize,
    pub size: usize,
    pub version: i64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// One slot per request, in request order.
    pub results: Vec<Option<IngestResponse>>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionStats {
    pub documents_processed: u64,
    pub chunks_created: u64,
    pub bytes_processed: u64,
    pub failures: u64,
    pub average_processing_ms: f64,
}

pub struct IngestionEngine {
    storage: Arc<StorageManager>,
    registry: ProcessorRegistry,
    chunker: Arc<dyn Chunker>,
    concurrency: usize,
    http: reqwest::Client,
    stats: Mutex<IngestionStats>,
}

impl IngestionEngine {
    pub fn new(storage: Arc<StorageManager>, config: &IngestionConfig) -> Self {
        let chunker_config = config.chunking.chunker_config();
        let chunker: Arc<dyn Chunker> = if config.chunking.adaptive {
            Arc::new(AdaptiveChunker::new(chunker_config))
        } else {
            Arc::new(BaseChunker::new(chunker_config))
        };
        Self {
            storage,
            registry: ProcessorRegistry::default(),
            chunker,
            concurrency: config.concurrency.max(1),
            http: reqwest::Client::new(),
            stats: Mutex::new(IngestionStats::default()),
        }
    }

    pub fn with_registry(mut self, registry: ProcessorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn stats(&self) -> IngestionStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn ingest_document(&self, request: IngestRequest) -> Result<IngestResponse> {
        let started = Instant::now();
        match self.ingest_inner(request, started).await {
            Ok(response) => {
                let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                let n = stats.documents_processed as f64;
                stats.average_processing_ms =
                    (stats.average_processing_ms * n + response.duration_ms as f64) / (n + 1.0);
                stats.documents_processed += 1;
                stats.chunks_created += response.chunk_count as u64;
                stats.bytes_processed += response.size as u64;
                Ok(response)
            }
            Err(e) => {
                self.stats.lock().unwrap_or_else(|e| e.into_inner()).failures += 1;
                Err(e)
            }
        }
    }

    async fn ingest_inner(&self, request: IngestRequest, started: Instant) -> Result<IngestResponse> {
        request.validate()?;

        let id = match (&request.id, &request.file_path) {
            (Some(id), _) => id.clone(),
            (None, Some(path)) => path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            (None, None) => uuid::Uuid::new_v4().to_string(),
        };

        let (bytes, fetched_type) = self.read_source(&request).await?;
        let content_type = request
            .content_type
            .clone()
            .or(fetched_type)
            .unwrap_or_else(|| {
                detect_content_type(request.file_path.as_deref(), request.url.as_deref())
                    .to_string()
            });

        let processor = self.registry.get(&content_type);
        let processor_name = processor.name().to_string();
        let processed = tokio::task::spawn_blocking(move || processor.process(&bytes))
            .await?
            .map_err(|e| RagError::service("processor", processor_name, e))?;

        let mut metadata = processed.metadata;
        metadata.extend(request.metadata.clone());

        let mut doc = Document::new(id.clone(), processed.text, content_type.clone());
        doc.file_path = request
            .file_path
            .as_ref()
            .map(|p| p.display().to_string());
        doc.source_url = request.url.clone();
        doc.metadata = metadata;

        let chunks: Vec<Chunk> = self
            .chunker
            .chunk(&doc.content, &content_type)
            .into_iter()
            .map(|tc| {
                let mut chunk = Chunk::new(id.clone(), tc.content, tc.position as i64);
                chunk.metadata = request.metadata.clone();
                chunk
            })
            .collect();
        debug!(doc_id = %id, chunker = self.chunker.name(), chunks = chunks.len(), "chunked document");

        let stored = self.storage.store_document(&doc, chunks).await?;
        let response = IngestResponse {
            document_id: stored.id,
            content_type,
            chunk_count: stored.chunk_count as usize,
            size: stored.size as usize,
            version: stored.version,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            doc_id = %response.document_id,
            chunks = response.chunk_count,
            version = response.version,
            "ingested document"
        );
        Ok(response)
    }

    /// Raw bytes of the request's source, plus the server-declared content
    /// type for URLs.
    async fn read_source(&self, request: &IngestRequest) -> Result<(Vec<u8>, Option<String>)> {
        if let Some(content) = &request.content {
            return Ok((content.clone().into_bytes(), None));
        }
        if let Some(path) = &request.file_path {
            return Ok((read_file(path).await?, None));
        }
        let url = request.url.as_deref().unwrap_or_default();
        self.fetch_url(url).await
    }

    async fn fetch_url(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let response = self
            .http
            .get(url)
            .timeout(URL_FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| RagError::Transient(format!("fetch {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("fetch {} returned {}", url, status);
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(RagError::Transient(message).into());
            }
            return Err(RagError::service("ingestion", "fetch url", message));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RagError::Transient(format!("read {}: {}", url, e)))?;
        Ok((bytes.to_vec(), content_type))
    }

    /// Ingest many documents with bounded concurrency.
    pub async fn ingest_batch(&self, requests: Vec<IngestRequest>) -> BatchResponse {
        let total = requests.len();
        let semaphore = Semaphore::new(self.concurrency);

        let outcomes = join_all(requests.into_iter().map(|request| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await;
                self.ingest_document(request).await
            }
        }))
        .await;

        let mut response = BatchResponse {
            total,
            results: Vec::with_capacity(total),
            ..Default::default()
        };
        for (i, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(r) => {
                    response.successful += 1;
                    response.results.push(Some(r));
                }
                Err(e) => {
                    warn!(index = i, error = %e, "batch item failed");
                    response.failed += 1;
                    response.results.push(None);
                    response.errors.push(format!("request {}: {:#}", i, e));
                }
            }
        }
        info!(
            total = response.total,
            successful = response.successful,
            failed = response.failed,
            "batch ingestion finished"
        );
        response
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(RagError::not_found(format!("file {}", path.display())))
        }
        Err(e) => Err(RagError::service(
            "ingestion",
            "read file",
            format!("{}: {}", path.display(), e),
        )),
    }
}
