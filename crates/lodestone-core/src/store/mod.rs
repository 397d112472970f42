//! Backend contracts for Lodestone's three aligned indexes.
//!
//! | Trait | Holds | Queried by |
//! |-------|-------|-----------|
//! | [`VectorBackend`] | chunks with embeddings | similarity to a query vector |
//! | [`KeywordBackend`] | chunks as full-text documents | text query |
//! | [`DocumentBackend`] | document metadata rows | id and filtered listing |
//!
//! All three are keyed by document id so the storage manager can fan a
//! delete out to every backend. Implementations must be `Send + Sync`
//! and deleting a document that does not exist is not an error.
//!
//! In-memory implementations live in [`memory`]; persistent ones live in
//! the `lodestone` app crate.

pub mod memory;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{metadata_matches, Chunk, Document, KeywordChunk, Metadata, SearchResults};

/// Options for [`VectorBackend::search_vectors`].
#[derive(Debug, Clone, Default)]
pub struct VectorSearchOptions {
    pub limit: usize,
    pub offset: usize,
    /// Hits scoring below this are dropped.
    pub threshold: Option<f64>,
    /// Conjunctive metadata equality filter.
    pub filter: Metadata,
    /// Return the stored vector on each hit.
    pub include_vector: bool,
}

/// Options for [`KeywordBackend::search`].
#[derive(Debug, Clone, Default)]
pub struct KeywordSearchOptions {
    pub limit: usize,
    pub offset: usize,
    pub fuzzy: bool,
    pub highlight: bool,
    pub filter: Metadata,
    /// Per-field score multipliers, keyed `content` or `title`.
    pub boosts: HashMap<String, f64>,
}

impl KeywordSearchOptions {
    pub fn boost(&self, field: &str) -> f64 {
        self.boosts.get(field).copied().unwrap_or(1.0)
    }
}

/// Conjunctive predicates for [`DocumentBackend::list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentFilter {
    /// Match any of these content types; empty matches all.
    #[serde(default)]
    pub content_types: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl DocumentFilter {
    /// Whether `doc` satisfies every predicate (pagination excluded).
    pub fn matches(&self, doc: &Document) -> bool {
        if !self.content_types.is_empty() && !self.content_types.contains(&doc.content_type) {
            return false;
        }
        if self.created_after.is_some_and(|t| doc.created_at < t)
            || self.created_before.is_some_and(|t| doc.created_at > t)
            || self.updated_after.is_some_and(|t| doc.updated_at < t)
            || self.updated_before.is_some_and(|t| doc.updated_at > t)
            || self.min_size.is_some_and(|s| doc.size < s)
            || self.max_size.is_some_and(|s| doc.size > s)
        {
            return false;
        }
        metadata_matches(&doc.metadata, &self.metadata)
    }

    /// Apply `offset` and `limit` to an already-filtered list.
    pub fn paginate<T>(&self, items: Vec<T>) -> Vec<T> {
        let it = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => it.take(limit).collect(),
            None => it.collect(),
        }
    }
}

/// Per-backend counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub backend: String,
    /// Distinct documents with entries in this backend.
    pub documents: u64,
    /// Chunk entries (vectors or indexed chunks).
    pub entries: u64,
    pub size_bytes: u64,
}

/// Aggregates over the document backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentStats {
    pub total_documents: u64,
    pub total_size: u64,
    pub average_size: f64,
    pub content_types: HashMap<String, u64>,
}

impl DocumentStats {
    pub fn from_documents<'a>(docs: impl IntoIterator<Item = &'a Document>) -> Self {
        let mut stats = DocumentStats::default();
        for doc in docs {
            stats.total_documents += 1;
            stats.total_size += doc.size.max(0) as u64;
            *stats
                .content_types
                .entry(doc.content_type.clone())
                .or_insert(0) += 1;
        }
        if stats.total_documents > 0 {
            stats.average_size = stats.total_size as f64 / stats.total_documents as f64;
        }
        stats
    }
}

/// Similarity index over chunk embeddings.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Replace every stored chunk of `document_id` with `chunks`.
    async fn store_vectors(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Hits sorted by descending score; `max_score` is the first hit's.
    async fn search_vectors(&self, query: &[f32], opts: &VectorSearchOptions) -> Result<SearchResults>;

    async fn delete_document(&self, document_id: &str) -> Result<()>;

    /// Stored chunks of a document ordered by position.
    async fn get_document_vectors(&self, document_id: &str) -> Result<Vec<Chunk>>;

    async fn stats(&self) -> Result<BackendStats>;

    async fn optimize(&self) -> Result<()>;

    async fn reset(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

/// Full-text index over chunks.
#[async_trait]
pub trait KeywordBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Replace every indexed chunk of `document_id` with `chunks`.
    async fn index_chunks(&self, document_id: &str, chunks: &[KeywordChunk]) -> Result<()>;

    async fn search(&self, query: &str, opts: &KeywordSearchOptions) -> Result<SearchResults>;

    async fn delete_document(&self, document_id: &str) -> Result<()>;

    /// Indexed chunks of a document ordered by position.
    async fn get_document_content(&self, document_id: &str) -> Result<Vec<KeywordChunk>>;

    async fn stats(&self) -> Result<BackendStats>;

    async fn optimize(&self) -> Result<()>;

    async fn reset(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

/// CRUD over document metadata.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Insert `doc`, or update it when the id already exists.
    ///
    /// Returns the stored row. An update keeps `created_at`, bumps
    /// `version` by one, and stamps `updated_at`.
    async fn store(&self, doc: &Document) -> Result<Document>;

    async fn get(&self, id: &str) -> Result<Option<Document>>;

    /// Update an existing document. Fails when the id is unknown.
    async fn update(&self, doc: &Document) -> Result<Document>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn list(&self, filter: &DocumentFilter) -> Result<Vec<Document>>;

    async fn stats(&self) -> Result<DocumentStats>;

    async fn optimize(&self) -> Result<()>;

    async fn reset(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

/// Apply an update on top of an existing row.
pub fn apply_update(existing: &Document, incoming: &Document) -> Document {
    let mut updated = incoming.clone();
    updated.id = existing.id.clone();
    updated.created_at = existing.created_at;
    updated.updated_at = Utc::now().max(existing.updated_at);
    updated.version = existing.version + 1;
    updated
}

// Poisoned locks only mean another thread panicked mid-operation; the
// maps themselves stay consistent, so the guard is recovered.

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}
