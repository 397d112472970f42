//! In-memory backends for tests, ephemeral indexes, and the default
//! configuration.
//!
//! Collections live behind `std::sync::RwLock`. Vector search is
//! brute-force over every stored embedding; keyword search scores chunks
//! with a BM25-style term weighting over whitespace tokens.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::embedding::SimilarityMetric;
use crate::highlight::{excerpts, query_terms, EXCERPT_CHARS};
use crate::models::{
    metadata_matches, Chunk, Document, HitSource, KeywordChunk, SearchHit, SearchResults,
};

use super::{
    apply_update, read, write, BackendStats, DocumentBackend, DocumentFilter, DocumentStats,
    KeywordBackend, KeywordSearchOptions, VectorBackend, VectorSearchOptions,
};

const BM25_K1: f64 = 1.2;

/// Brute-force vector index.
pub struct MemoryVectorBackend {
    /// Expected vector length; 0 accepts any.
    dimensions: usize,
    metric: SimilarityMetric,
    chunks: RwLock<Vec<Chunk>>,
}

impl MemoryVectorBackend {
    pub fn new(dimensions: usize, metric: SimilarityMetric) -> Self {
        Self {
            dimensions,
            metric,
            chunks: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryVectorBackend {
    fn default() -> Self {
        Self::new(0, SimilarityMetric::Cosine)
    }
}

/// Reject embeddings whose length differs from `dimensions` (0 = any).
pub fn check_dimensions(dimensions: usize, chunks: &[Chunk]) -> Result<()> {
    if dimensions == 0 {
        return Ok(());
    }
    for c in chunks {
        if let Some(v) = &c.embedding {
            if v.len() != dimensions {
                bail!(
                    "chunk {} has {} dimensions, expected {}",
                    c.id,
                    v.len(),
                    dimensions
                );
            }
        }
    }
    Ok(())
}

#[async_trait]
impl VectorBackend for MemoryVectorBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn store_vectors(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        check_dimensions(self.dimensions, chunks)?;
        let mut stored = write(&self.chunks);
        stored.retain(|c| c.document_id != document_id);
        for c in chunks {
            let mut c = c.clone();
            c.document_id = document_id.to_string();
            stored.push(c);
        }
        Ok(())
    }

    async fn search_vectors(
        &self,
        query: &[f32],
        opts: &VectorSearchOptions,
    ) -> Result<SearchResults> {
        let stored = read(&self.chunks);
        let mut scored: Vec<(f64, &Chunk)> = stored
            .iter()
            .filter(|c| metadata_matches(&c.metadata, &opts.filter))
            .filter_map(|c| {
                let v = c.embedding.as_ref()?;
                Some((self.metric.score(query, v) as f64, c))
            })
            .filter(|(s, _)| opts.threshold.map(|t| *s >= t).unwrap_or(true))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        let total = scored.len();
        let hits = scored
            .into_iter()
            .skip(opts.offset)
            .take(opts.limit)
            .map(|(score, c)| SearchHit {
                chunk_id: c.id.clone(),
                document_id: c.document_id.clone(),
                content: c.content.clone(),
                score,
                highlights: Vec::new(),
                source: HitSource::Vector,
                rank: 0,
                metadata: c.metadata.clone(),
                vector: if opts.include_vector {
                    c.embedding.clone()
                } else {
                    None
                },
            })
            .collect();
        Ok(SearchResults::from_ranked(hits, total))
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        write(&self.chunks).retain(|c| c.document_id != document_id);
        Ok(())
    }

    async fn get_document_vectors(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let mut chunks: Vec<Chunk> = read(&self.chunks)
            .iter()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.position);
        Ok(chunks)
    }

    async fn stats(&self) -> Result<BackendStats> {
        let stored = read(&self.chunks);
        let docs: HashSet<&str> = stored.iter().map(|c| c.document_id.as_str()).collect();
        let size_bytes = stored
            .iter()
            .map(|c| c.content.len() + c.embedding.as_ref().map(|v| v.len() * 4).unwrap_or(0))
            .sum::<usize>();
        Ok(BackendStats {
            backend: self.name().to_string(),
            documents: docs.len() as u64,
            entries: stored.len() as u64,
            size_bytes: size_bytes as u64,
        })
    }

    async fn optimize(&self) -> Result<()> {
        write(&self.chunks).shrink_to_fit();
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        write(&self.chunks).clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Token-scored keyword index.
#[derive(Default)]
pub struct MemoryKeywordBackend {
    chunks: RwLock<Vec<KeywordChunk>>,
}

impl MemoryKeywordBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Levenshtein distance over chars.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut cur = vec![0; b_chars.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = if ca == *cb { 0 } else { 1 };
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b_chars.len()]
}

/// Edit distance tolerated for a fuzzy match of `term`.
pub fn fuzzy_distance(term: &str) -> usize {
    match term.chars().count() {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

fn term_matches(token: &str, term: &str, fuzzy: bool) -> bool {
    token == term || (fuzzy && edit_distance(token, term) <= fuzzy_distance(term))
}

#[async_trait]
impl KeywordBackend for MemoryKeywordBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn index_chunks(&self, document_id: &str, chunks: &[KeywordChunk]) -> Result<()> {
        let mut stored = write(&self.chunks);
        stored.retain(|c| c.document_id != document_id);
        for c in chunks {
            let mut c = c.clone();
            c.document_id = document_id.to_string();
            stored.push(c);
        }
        Ok(())
    }

    async fn search(&self, query: &str, opts: &KeywordSearchOptions) -> Result<SearchResults> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(SearchResults::empty());
        }
        let stored = read(&self.chunks);
        let candidates: Vec<(&KeywordChunk, Vec<String>, Vec<String>)> = stored
            .iter()
            .filter(|c| metadata_matches(&c.metadata, &opts.filter))
            .map(|c| {
                let title = c.title.as_deref().map(tokenize).unwrap_or_default();
                (c, tokenize(&c.content), title)
            })
            .collect();

        let n = candidates.len() as f64;
        let idf: HashMap<&str, f64> = terms
            .iter()
            .map(|t| {
                let df = candidates
                    .iter()
                    .filter(|(_, body, title)| {
                        body.iter().chain(title.iter()).any(|tok| term_matches(tok, t, opts.fuzzy))
                    })
                    .count() as f64;
                (t.as_str(), (1.0 + (n - df + 0.5) / (df + 0.5)).ln())
            })
            .collect();

        let (content_boost, title_boost) = (opts.boost("content"), opts.boost("title"));
        let mut scored: Vec<(f64, &KeywordChunk)> = candidates
            .iter()
            .filter_map(|(c, body, title)| {
                let mut score = 0.0;
                for t in &terms {
                    let tf_body = body.iter().filter(|tok| term_matches(tok, t, opts.fuzzy)).count() as f64;
                    let tf_title = title.iter().filter(|tok| term_matches(tok, t, opts.fuzzy)).count() as f64;
                    let w = idf.get(t.as_str()).copied().unwrap_or(0.0);
                    score += w * content_boost * tf_body / (tf_body + BM25_K1);
                    score += w * title_boost * tf_title / (tf_title + BM25_K1);
                }
                (score > 0.0).then_some((score, *c))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        let total = scored.len();
        let hits = scored
            .into_iter()
            .skip(opts.offset)
            .take(opts.limit)
            .map(|(score, c)| SearchHit {
                chunk_id: c.id.clone(),
                document_id: c.document_id.clone(),
                content: c.content.clone(),
                score,
                highlights: if opts.highlight {
                    excerpts(&c.content, &terms, EXCERPT_CHARS)
                } else {
                    Vec::new()
                },
                source: HitSource::Keyword,
                rank: 0,
                metadata: c.metadata.clone(),
                vector: None,
            })
            .collect();
        Ok(SearchResults::from_ranked(hits, total))
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        write(&self.chunks).retain(|c| c.document_id != document_id);
        Ok(())
    }

    async fn get_document_content(&self, document_id: &str) -> Result<Vec<KeywordChunk>> {
        let mut chunks: Vec<KeywordChunk> = read(&self.chunks)
            .iter()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.position);
        Ok(chunks)
    }

    async fn stats(&self) -> Result<BackendStats> {
        let stored = read(&self.chunks);
        let docs: HashSet<&str> = stored.iter().map(|c| c.document_id.as_str()).collect();
        Ok(BackendStats {
            backend: self.name().to_string(),
            documents: docs.len() as u64,
            entries: stored.len() as u64,
            size_bytes: stored.iter().map(|c| c.content.len() as u64).sum(),
        })
    }

    async fn optimize(&self) -> Result<()> {
        write(&self.chunks).shrink_to_fit();
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        write(&self.chunks).clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Document metadata map.
#[derive(Default)]
pub struct MemoryDocumentBackend {
    docs: RwLock<HashMap<String, Document>>,
}

impl MemoryDocumentBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentBackend for MemoryDocumentBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn store(&self, doc: &Document) -> Result<Document> {
        let mut docs = write(&self.docs);
        let stored = match docs.get(&doc.id) {
            Some(existing) => apply_update(existing, doc),
            None => doc.clone(),
        };
        docs.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        Ok(read(&self.docs).get(id).cloned())
    }

    async fn update(&self, doc: &Document) -> Result<Document> {
        let mut docs = write(&self.docs);
        let Some(existing) = docs.get(&doc.id) else {
            bail!("document '{}' not found", doc.id);
        };
        let updated = apply_update(existing, doc);
        docs.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        write(&self.docs).remove(id);
        Ok(())
    }

    async fn list(&self, filter: &DocumentFilter) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = read(&self.docs)
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(filter.paginate(docs))
    }

    async fn stats(&self) -> Result<DocumentStats> {
        Ok(DocumentStats::from_documents(read(&self.docs).values()))
    }

    async fn optimize(&self) -> Result<()> {
        write(&self.docs).shrink_to_fit();
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        write(&self.docs).clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
