//! Storage manager: one vector, one keyword, and one document backend
//! kept in step, plus the embedder that fills in missing vectors.
//!
//! # Write path
//!
//! ```text
//! store_document(doc, chunks)
//!   ├─ document backend: store row          (must succeed first)
//!   ├─ embedder: embed chunks lacking vectors
//!   └─ concurrently
//!        ├─ vector backend:  store_vectors
//!        └─ keyword backend: index_chunks
//!      on any failure: delete doc from all three, return the error
//! ```
//!
//! Deletes, `optimize`, and `reset` fan out to all three backends at once.
//! They fail outright only when every branch fails; otherwise the caller
//! gets a [`RagError::PartialFailure`] naming the failed branches. A
//! partially failed delete retries the failed branches once before
//! returning. If a branch still fails, the document id is tombstoned and
//! [`StorageManager::drop_deleted`] hides its leftover chunks from search
//! until a later delete or store of that id succeeds.
//!
//! The lock only guards the set of backend handles. Operations clone the
//! handles under a read lock and run without holding it, so ingestions of
//! different documents proceed in parallel. `close` takes the write lock
//! and drops the handles; every later call fails with `RagError::Closed`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::future::BoxFuture;
use lodestone_core::embedding::Embedder;
use lodestone_core::models::{Chunk, Document, KeywordChunk, SearchResults};
use lodestone_core::store::{
    BackendStats, DocumentBackend, DocumentFilter, DocumentStats, KeywordBackend, VectorBackend,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backends::{create_document_backend, create_keyword_backend, create_vector_backend};
use crate::config::StorageConfig;
use crate::error::RagError;

const COMPONENT: &str = "storage";
const DEFAULT_EMBED_BATCH: usize = 32;

/// Aggregated counters across the three backends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_documents: u64,
    pub total_chunks: u64,
    pub total_vectors: u64,
    pub total_size: u64,
    pub average_size: f64,
    pub content_types: HashMap<String, u64>,
    pub vector: BackendStats,
    pub keyword: BackendStats,
    pub document: DocumentStats,
}

#[derive(Clone)]
struct Backends {
    vector: Arc<dyn VectorBackend>,
    keyword: Arc<dyn KeywordBackend>,
    document: Arc<dyn DocumentBackend>,
}

pub struct StorageManager {
    // Write-locked only by `close`; the backends synchronise their own writes.
    backends: RwLock<Option<Backends>>,
    embedder: Arc<dyn Embedder>,
    embed_batch_size: usize,
    tombstones: Mutex<HashSet<String>>,
}

type Branch<'a> = (&'static str, BoxFuture<'a, Result<()>>);

impl StorageManager {
    pub fn new(
        vector: Arc<dyn VectorBackend>,
        keyword: Arc<dyn KeywordBackend>,
        document: Arc<dyn DocumentBackend>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            backends: RwLock::new(Some(Backends {
                vector,
                keyword,
                document,
            })),
            embedder,
            embed_batch_size: DEFAULT_EMBED_BATCH,
            tombstones: Mutex::new(HashSet::new()),
        }
    }

    /// Build all three backends from configuration.
    pub fn from_config(config: &StorageConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        Ok(Self::new(
            create_vector_backend(&config.vector)?,
            create_keyword_backend(&config.keyword)?,
            create_document_backend(&config.document)?,
            embedder,
        ))
    }

    /// Maximum chunks per embedder call.
    pub fn with_embed_batch_size(mut self, size: usize) -> Self {
        self.embed_batch_size = size.max(1);
        self
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    async fn handles(&self) -> Result<Backends> {
        self.backends
            .read()
            .await
            .clone()
            .ok_or_else(|| RagError::closed("storage manager"))
    }

    pub async fn vector_backend(&self) -> Result<Arc<dyn VectorBackend>> {
        Ok(self.handles().await?.vector)
    }

    pub async fn keyword_backend(&self) -> Result<Arc<dyn KeywordBackend>> {
        Ok(self.handles().await?.keyword)
    }

    pub async fn document_backend(&self) -> Result<Arc<dyn DocumentBackend>> {
        Ok(self.handles().await?.document)
    }

    /// Persist a document and its chunks across all three backends.
    ///
    /// Chunks without an embedding are embedded here. Returns the stored
    /// document row (with `chunk_count` and, on re-ingest, a bumped
    /// `version`).
    pub async fn store_document(&self, doc: &Document, chunks: Vec<Chunk>) -> Result<Document> {
        let b = self.handles().await?;

        let mut doc = doc.clone();
        doc.chunk_count = chunks.len() as i64;
        let stored = b
            .document
            .store(&doc)
            .await
            .map_err(|e| RagError::service(COMPONENT, "store document", format!("{:#}", e)))?;

        let result = self.index_chunks(&b, &stored, chunks).await;
        if let Err(e) = result {
            self.cleanup(&b, &stored.id).await;
            return Err(e);
        }
        self.untombstone(&stored.id);
        debug!(doc_id = %stored.id, chunks = stored.chunk_count, "stored document");
        Ok(stored)
    }

    async fn index_chunks(&self, b: &Backends, doc: &Document, mut chunks: Vec<Chunk>) -> Result<()> {
        for c in chunks.iter_mut() {
            c.document_id = doc.id.clone();
        }
        self.embed_missing(&mut chunks).await?;

        let keyword_chunks: Vec<KeywordChunk> = chunks
            .iter()
            .map(|c| KeywordChunk::from_chunk(c, doc.title()))
            .collect();

        let (vector_result, keyword_result) = tokio::join!(
            b.vector.store_vectors(&doc.id, &chunks),
            b.keyword.index_chunks(&doc.id, &keyword_chunks),
        );
        vector_result
            .map_err(|e| RagError::service(COMPONENT, "store vectors", format!("{:#}", e)))?;
        keyword_result
            .map_err(|e| RagError::service(COMPONENT, "index chunks", format!("{:#}", e)))?;
        Ok(())
    }

    async fn embed_missing(&self, chunks: &mut [Chunk]) -> Result<()> {
        let pending: Vec<usize> = chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.embedding.is_none())
            .map(|(i, _)| i)
            .collect();

        for batch in pending.chunks(self.embed_batch_size) {
            let texts: Vec<String> = batch.iter().map(|&i| chunks[i].content.clone()).collect();
            let vectors = self
                .embedder
                .embed_batch(&texts)
                .await
                .map_err(|e| RagError::service("embedder", "embed chunks", format!("{:#}", e)))?;
            if vectors.len() != texts.len() {
                return Err(RagError::service(
                    "embedder",
                    "embed chunks",
                    format!("expected {} vectors, got {}", texts.len(), vectors.len()),
                ));
            }
            for (&i, v) in batch.iter().zip(vectors) {
                chunks[i].embedding = Some(v);
            }
        }
        Ok(())
    }

    /// Best-effort removal of a half-stored document.
    async fn cleanup(&self, b: &Backends, id: &str) {
        let (v, k, d) = tokio::join!(
            b.vector.delete_document(id),
            b.keyword.delete_document(id),
            b.document.delete(id),
        );
        for (branch, r) in [("vector", v), ("keyword", k), ("document", d)] {
            if let Err(e) = r {
                warn!(doc_id = %id, backend = branch, error = %e, "cleanup failed");
            }
        }
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        self.handles()
            .await?
            .document
            .get(id)
            .await
            .map_err(|e| RagError::service(COMPONENT, "get document", format!("{:#}", e)))
    }

    pub async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>> {
        self.handles()
            .await?
            .document
            .list(filter)
            .await
            .map_err(|e| RagError::service(COMPONENT, "list documents", format!("{:#}", e)))
    }

    /// Remove a document from every backend. Idempotent.
    pub async fn delete_document(&self, id: &str) -> Result<()> {
        let b = self.handles().await?;
        let failed = run_branches(delete_branches(&b, id, &["vector", "keyword", "document"])).await;
        if failed.is_empty() {
            self.untombstone(id);
            debug!(doc_id = %id, "deleted document");
            return Ok(());
        }
        if failed.len() == 3 {
            return Err(combine("delete", 3, failed));
        }

        // Compensating retry for the branches that failed.
        let names: Vec<&'static str> = failed.iter().map(|(name, _)| *name).collect();
        let retry = run_branches(delete_branches(&b, id, &names)).await;
        if retry.is_empty() {
            self.untombstone(id);
        } else {
            for (branch, e) in &retry {
                warn!(doc_id = %id, backend = *branch, error = %e, "delete retry failed");
            }
            self.lock_tombstones().insert(id.to_string());
        }
        Err(combine("delete", 3, failed))
    }

    /// Remove hits belonging to documents whose delete left chunks behind
    /// in some backend.
    pub fn drop_deleted(&self, results: SearchResults) -> SearchResults {
        let tombstones = self.lock_tombstones();
        if tombstones.is_empty()
            || !results.hits.iter().any(|h| tombstones.contains(&h.document_id))
        {
            return results;
        }
        let before = results.hits.len();
        let hits: Vec<_> = results
            .hits
            .into_iter()
            .filter(|h| !tombstones.contains(&h.document_id))
            .collect();
        let total = results.total.saturating_sub(before - hits.len());
        SearchResults::from_ranked(hits, total)
    }

    /// Ids whose last delete did not reach every backend.
    pub fn tombstoned(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_tombstones().iter().cloned().collect();
        ids.sort();
        ids
    }

    fn untombstone(&self, id: &str) {
        self.lock_tombstones().remove(id);
    }

    fn lock_tombstones(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.tombstones.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn optimize(&self) -> Result<()> {
        let b = self.handles().await?;
        let failed = run_branches(vec![
            ("vector", b.vector.optimize()),
            ("keyword", b.keyword.optimize()),
            ("document", b.document.optimize()),
        ])
        .await;
        combine_result("optimize", failed)
    }

    /// Drop every document from every backend.
    pub async fn reset(&self) -> Result<()> {
        let b = self.handles().await?;
        let failed = run_branches(vec![
            ("vector", b.vector.reset()),
            ("keyword", b.keyword.reset()),
            ("document", b.document.reset()),
        ])
        .await;
        if failed.is_empty() {
            self.lock_tombstones().clear();
        }
        combine_result("reset", failed)
    }

    pub async fn health(&self) -> Result<()> {
        let b = self.handles().await?;
        let failed = run_branches(vec![
            ("vector", b.vector.health()),
            ("keyword", b.keyword.health()),
            ("document", b.document.health()),
        ])
        .await;
        combine_result("health", failed)
    }

    pub async fn get_stats(&self) -> Result<StorageStats> {
        let b = self.handles().await?;
        let (vector, keyword, document) =
            tokio::try_join!(b.vector.stats(), b.keyword.stats(), b.document.stats())
                .map_err(|e| RagError::service(COMPONENT, "stats", format!("{:#}", e)))?;
        Ok(StorageStats {
            total_documents: document.total_documents,
            total_chunks: keyword.entries,
            total_vectors: vector.entries,
            total_size: document.total_size,
            average_size: document.average_size,
            content_types: document.content_types.clone(),
            vector,
            keyword,
            document,
        })
    }

    /// Close every backend. Later calls fail with `RagError::Closed`.
    pub async fn close(&self) -> Result<()> {
        let Some(b) = self.backends.write().await.take() else {
            return Ok(());
        };
        let failed = run_branches(vec![
            ("vector", b.vector.close()),
            ("keyword", b.keyword.close()),
            ("document", b.document.close()),
        ])
        .await;
        combine_result("close", failed)
    }

    pub async fn is_closed(&self) -> bool {
        self.backends.read().await.is_none()
    }
}

fn delete_branches<'a>(b: &'a Backends, id: &'a str, names: &[&'static str]) -> Vec<Branch<'a>> {
    names
        .iter()
        .map(|&name| -> Branch<'a> {
            match name {
                "vector" => (name, b.vector.delete_document(id)),
                "keyword" => (name, b.keyword.delete_document(id)),
                _ => (name, b.document.delete(id)),
            }
        })
        .collect()
}

/// Run branches concurrently and return the failures.
async fn run_branches(branches: Vec<Branch<'_>>) -> Vec<(&'static str, anyhow::Error)> {
    let (names, futures): (Vec<_>, Vec<_>) = branches.into_iter().unzip();
    let results = futures::future::join_all(futures).await;
    names
        .into_iter()
        .zip(results)
        .filter_map(|(name, r)| r.err().map(|e| (name, e)))
        .collect()
}

fn combine(op: &str, total: usize, failed: Vec<(&'static str, anyhow::Error)>) -> anyhow::Error {
    let failures: Vec<(String, String)> = failed
        .into_iter()
        .map(|(b, e)| (b.to_string(), format!("{:#}", e)))
        .collect();
    if failures.len() == total {
        let message = failures
            .iter()
            .map(|(b, e)| format!("{}: {}", b, e))
            .collect::<Vec<_>>()
            .join("; ");
        return RagError::service(COMPONENT, op, message);
    }
    RagError::PartialFailure { failures }.into()
}

fn combine_result(op: &str, failed: Vec<(&'static str, anyhow::Error)>) -> Result<()> {
    if failed.is_empty() {
        return Ok(());
    }
    for (branch, e) in &failed {
        warn!(backend = *branch, error = %e, "{} failed", op);
    }
    Err(combine(op, 3, failed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;
    use lodestone_core::embedding::HashEmbedder;
    use lodestone_core::store::memory::{
        MemoryDocumentBackend, MemoryKeywordBackend, MemoryVectorBackend,
    };
    use lodestone_core::store::KeywordSearchOptions;
    use async_trait::async_trait;
    use lodestone_core::models::SearchResults;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn manager() -> StorageManager {
        StorageManager::new(
            Arc::new(MemoryVectorBackend::default()),
            Arc::new(MemoryKeywordBackend::new()),
            Arc::new(MemoryDocumentBackend::new()),
            Arc::new(HashEmbedder::new(32)),
        )
    }

    fn chunks(doc: &str, texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk::new(doc, *t, i as i64))
            .collect()
    }

    /// Keyword backend whose writes always fail.
    struct BrokenKeyword(MemoryKeywordBackend, AtomicBool);

    #[async_trait]
    impl KeywordBackend for BrokenKeyword {
        fn name(&self) -> &str {
            "broken"
        }
        async fn index_chunks(&self, _: &str, _: &[KeywordChunk]) -> Result<()> {
            self.1.store(true, Ordering::SeqCst);
            anyhow::bail!("disk full")
        }
        async fn search(&self, q: &str, o: &KeywordSearchOptions) -> Result<SearchResults> {
            self.0.search(q, o).await
        }
        async fn delete_document(&self, id: &str) -> Result<()> {
            self.0.delete_document(id).await
        }
        async fn get_document_content(&self, id: &str) -> Result<Vec<KeywordChunk>> {
            self.0.get_document_content(id).await
        }
        async fn stats(&self) -> Result<BackendStats> {
            self.0.stats().await
        }
        async fn optimize(&self) -> Result<()> {
            anyhow::bail!("not supported")
        }
        async fn reset(&self) -> Result<()> {
            self.0.reset().await
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_store_embeds_and_indexes() {
        let m = manager();
        let doc = Document::new("d", "alpha beta. gamma delta.", "text/plain");
        let stored = m
            .store_document(&doc, chunks("d", &["alpha beta.", "gamma delta."]))
            .await
            .unwrap();
        assert_eq!(stored.chunk_count, 2);
        assert_eq!(m.get_document("d").await.unwrap().unwrap().chunk_count, 2);

        let vectors = m.vector_backend().await.unwrap().get_document_vectors("d").await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|c| c.embedding.as_ref().map(Vec::len) == Some(32)));
        let content = m.keyword_backend().await.unwrap().get_document_content("d").await.unwrap();
        assert_eq!(content.len(), 2);

        let stats = m.get_stats().await.unwrap();
        assert_eq!(stats.total_documents, 1);
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.total_vectors, 2);
    }

    #[tokio::test]
    async fn test_failed_index_cleans_up() {
        let broken = Arc::new(BrokenKeyword(MemoryKeywordBackend::new(), AtomicBool::new(false)));
        let m = StorageManager::new(
            Arc::new(MemoryVectorBackend::default()),
            broken.clone(),
            Arc::new(MemoryDocumentBackend::new()),
            Arc::new(HashEmbedder::new(8)),
        );
        let doc = Document::new("d", "text", "text/plain");
        let err = m.store_document(&doc, chunks("d", &["text"])).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert!(broken.1.load(Ordering::SeqCst));

        assert!(m.get_document("d").await.unwrap().is_none());
        let vectors = m.vector_backend().await.unwrap().get_document_vectors("d").await.unwrap();
        assert!(vectors.is_empty());

        let err = m.optimize().await.unwrap_err();
        assert_eq!(kind_of(&err).unwrap().failed_branches(), vec!["keyword"]);
    }

    #[tokio::test]
    async fn test_delete_idempotent_and_reset() {
        let m = manager();
        let doc = Document::new("d", "x", "text/plain");
        m.store_document(&doc, chunks("d", &["x"])).await.unwrap();
        m.delete_document("d").await.unwrap();
        m.delete_document("d").await.unwrap();
        assert!(m.get_document("d").await.unwrap().is_none());

        m.store_document(&doc, chunks("d", &["x"])).await.unwrap();
        m.reset().await.unwrap();
        assert_eq!(m.get_stats().await.unwrap().total_documents, 0);
    }

    #[tokio::test]
    async fn test_closed_manager_rejects_calls() {
        let m = manager();
        m.close().await.unwrap();
        assert!(m.is_closed().await);
        let err = m.get_document("d").await.unwrap_err();
        assert!(matches!(kind_of(&err), Some(RagError::Closed(_))));
        m.close().await.unwrap();
    }
}
