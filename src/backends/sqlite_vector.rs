//! SQLite-backed vector backend.
//!
//! Embeddings are stored as little-endian `f32` BLOBs in a single
//! `vector_entries` table and scored exhaustively in Rust with the
//! configured [`SimilarityMetric`]. Each row carries an `entry_type`
//! column (mirrored as `_type` in its metadata); similarity search only
//! ever considers `chunk` rows.
//!
//! The database is opened lazily on first use. Until then, reads against
//! a file that does not exist yet return empty results.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use lodestone_core::embedding::{blob_to_vec, vec_to_blob, SimilarityMetric};
use lodestone_core::models::{
    content_hash, decode_metadata, encode_metadata, matches_filter, Chunk, HitSource, SearchHit,
    SearchResults, StoredMetadata, HASH_KEY, TYPE_CHUNK, TYPE_KEY,
};
use lodestone_core::store::memory::check_dimensions;
use lodestone_core::store::{BackendStats, VectorBackend, VectorSearchOptions};
use sqlx::Row;

use crate::db::{from_millis, to_millis, LazyPool};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS vector_entries (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        entry_type TEXT NOT NULL DEFAULT 'chunk',
        content TEXT NOT NULL,
        embedding BLOB,
        dims INTEGER NOT NULL DEFAULT 0,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        position INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_vector_entries_document ON vector_entries(document_id)",
];

pub struct SqliteVectorBackend {
    db: LazyPool,
    dimensions: usize,
    metric: SimilarityMetric,
}

impl SqliteVectorBackend {
    pub fn new(path: impl Into<PathBuf>, dimensions: usize, metric: SimilarityMetric) -> Self {
        Self {
            db: LazyPool::new(path, SCHEMA),
            dimensions,
            metric,
        }
    }
}

fn stored_metadata(json: &str) -> StoredMetadata {
    serde_json::from_str(json).unwrap_or_default()
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<Chunk> {
    let content: String = row.try_get("content")?;
    let blob: Option<Vec<u8>> = row.try_get("embedding")?;
    let metadata_json: String = row.try_get("metadata_json")?;
    let stored = stored_metadata(&metadata_json);
    let hash = stored
        .get(HASH_KEY)
        .cloned()
        .unwrap_or_else(|| content_hash(&content));
    Ok(Chunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        embedding: blob.map(|b| blob_to_vec(&b)),
        metadata: decode_metadata(&stored),
        position: row.try_get("position")?,
        hash,
        created_at: from_millis(row.try_get("created_at")?),
        content,
    })
}

#[async_trait]
impl VectorBackend for SqliteVectorBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn store_vectors(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        check_dimensions(self.dimensions, chunks)?;
        let pool = self.db.get().await?;
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM vector_entries WHERE document_id = ? AND entry_type = ?")
            .bind(document_id)
            .bind(TYPE_CHUNK)
            .execute(&mut *tx)
            .await?;

        for c in chunks {
            let mut stored = encode_metadata(&c.metadata);
            stored.insert(TYPE_KEY.to_string(), TYPE_CHUNK.to_string());
            stored.insert(HASH_KEY.to_string(), c.hash.clone());
            let blob = c.embedding.as_deref().map(vec_to_blob);
            let dims = c.embedding.as_ref().map(|v| v.len() as i64).unwrap_or(0);

            sqlx::query(
                r#"
                INSERT INTO vector_entries
                    (id, document_id, entry_type, content, embedding, dims, metadata_json, position, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    document_id = excluded.document_id,
                    content = excluded.content,
                    embedding = excluded.embedding,
                    dims = excluded.dims,
                    metadata_json = excluded.metadata_json,
                    position = excluded.position
                "#,
            )
            .bind(&c.id)
            .bind(document_id)
            .bind(TYPE_CHUNK)
            .bind(&c.content)
            .bind(blob)
            .bind(dims)
            .bind(serde_json::to_string(&stored)?)
            .bind(c.position)
            .bind(to_millis(c.created_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn search_vectors(
        &self,
        query: &[f32],
        opts: &VectorSearchOptions,
    ) -> Result<SearchResults> {
        if self.db.is_pristine() {
            return Ok(SearchResults::empty());
        }
        let pool = self.db.get().await?;

        // Fetch all chunk vectors and score them in Rust
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, content, embedding, metadata_json
            FROM vector_entries
            WHERE entry_type = ? AND embedding IS NOT NULL
            "#,
        )
        .bind(TYPE_CHUNK)
        .fetch_all(pool)
        .await?;

        let mut scored = Vec::new();
        for row in &rows {
            let stored = stored_metadata(&row.try_get::<String, _>("metadata_json")?);
            if !matches_filter(&stored, &opts.filter) {
                continue;
            }
            let blob: Vec<u8> = row.try_get("embedding")?;
            let vector = blob_to_vec(&blob);
            let score = self.metric.score(query, &vector) as f64;
            if opts.threshold.is_some_and(|t| score < t) {
                continue;
            }
            scored.push(SearchHit {
                chunk_id: row.try_get("id")?,
                document_id: row.try_get("document_id")?,
                content: row.try_get("content")?,
                score,
                highlights: Vec::new(),
                source: HitSource::Vector,
                rank: 0,
                metadata: decode_metadata(&stored),
                vector: opts.include_vector.then_some(vector),
            });
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        let total = scored.len();
        let hits = scored
            .into_iter()
            .skip(opts.offset)
            .take(opts.limit)
            .collect();
        Ok(SearchResults::from_ranked(hits, total))
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        if self.db.is_pristine() {
            return Ok(());
        }
        sqlx::query("DELETE FROM vector_entries WHERE document_id = ?")
            .bind(document_id)
            .execute(self.db.get().await?)
            .await?;
        Ok(())
    }

    async fn get_document_vectors(&self, document_id: &str) -> Result<Vec<Chunk>> {
        if self.db.is_pristine() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, content, embedding, metadata_json, position, created_at
            FROM vector_entries
            WHERE document_id = ? AND entry_type = ?
            ORDER BY position
            "#,
        )
        .bind(document_id)
        .bind(TYPE_CHUNK)
        .fetch_all(self.db.get().await?)
        .await?;

        rows.iter().map(row_to_chunk).collect()
    }

    async fn stats(&self) -> Result<BackendStats> {
        let mut stats = BackendStats {
            backend: self.name().to_string(),
            ..Default::default()
        };
        if self.db.is_pristine() {
            return Ok(stats);
        }
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS entries,
                   COUNT(DISTINCT document_id) AS documents,
                   COALESCE(SUM(LENGTH(content) + COALESCE(LENGTH(embedding), 0)), 0) AS size_bytes
            FROM vector_entries
            WHERE entry_type = ?
            "#,
        )
        .bind(TYPE_CHUNK)
        .fetch_one(self.db.get().await?)
        .await?;

        stats.entries = row.try_get::<i64, _>("entries")? as u64;
        stats.documents = row.try_get::<i64, _>("documents")? as u64;
        stats.size_bytes = row.try_get::<i64, _>("size_bytes")? as u64;
        Ok(stats)
    }

    async fn optimize(&self) -> Result<()> {
        if self.db.is_pristine() {
            return Ok(());
        }
        let pool = self.db.get().await?;
        sqlx::query("PRAGMA optimize").execute(pool).await?;
        sqlx::query("VACUUM").execute(pool).await?;
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        if self.db.is_pristine() {
            return Ok(());
        }
        sqlx::query("DELETE FROM vector_entries")
            .execute(self.db.get().await?)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.db.close().await;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        if self.db.is_pristine() {
            return Ok(());
        }
        sqlx::query("SELECT 1").execute(self.db.get().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn chunk(doc: &str, id: &str, content: &str, pos: i64, v: Vec<f32>) -> Chunk {
        let mut c = Chunk::new(doc, content, pos);
        c.id = id.to_string();
        c.embedding = Some(v);
        c
    }

    #[tokio::test]
    async fn test_lazy_open_returns_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/vectors.sqlite");
        let backend = SqliteVectorBackend::new(&path, 2, SimilarityMetric::Cosine);

        let results = backend
            .search_vectors(&[1.0, 0.0], &VectorSearchOptions { limit: 5, ..Default::default() })
            .await
            .unwrap();
        assert!(results.hits.is_empty());
        backend.optimize().await.unwrap();
        backend.reset().await.unwrap();
        assert!(!path.exists());
        assert_eq!(backend.stats().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_store_search_delete() {
        let tmp = TempDir::new().unwrap();
        let backend =
            SqliteVectorBackend::new(tmp.path().join("v.sqlite"), 2, SimilarityMetric::Cosine);

        let mut b = chunk("doc", "b", "second", 1, vec![0.0, 1.0]);
        b.metadata.insert("lang".into(), json!("en"));
        backend
            .store_vectors("doc", &[chunk("doc", "a", "first", 0, vec![1.0, 0.0]), b])
            .await
            .unwrap();

        let opts = VectorSearchOptions {
            limit: 10,
            threshold: Some(0.5),
            ..Default::default()
        };
        let results = backend.search_vectors(&[1.0, 0.1], &opts).await.unwrap();
        assert_eq!(results.hits.len(), 1);
        assert_eq!(results.hits[0].chunk_id, "a");
        assert!(results.hits.iter().all(|h| h.score >= 0.5));

        let mut filtered = VectorSearchOptions {
            limit: 10,
            include_vector: true,
            ..Default::default()
        };
        filtered.filter.insert("lang".into(), json!("en"));
        let results = backend.search_vectors(&[1.0, 0.0], &filtered).await.unwrap();
        assert_eq!(results.hits.len(), 1);
        assert_eq!(results.hits[0].chunk_id, "b");
        assert_eq!(results.hits[0].vector.as_deref(), Some(&[0.0, 1.0][..]));

        let stored = backend.get_document_vectors("doc").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].position, 0);
        assert_eq!(stored[1].hash, content_hash("second"));

        backend.delete_document("doc").await.unwrap();
        backend.delete_document("doc").await.unwrap();
        assert!(backend.get_document_vectors("doc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_replaces_and_rejects_bad_dims() {
        let tmp = TempDir::new().unwrap();
        let backend =
            SqliteVectorBackend::new(tmp.path().join("v.sqlite"), 2, SimilarityMetric::Cosine);
        backend
            .store_vectors("doc", &[chunk("doc", "a", "x", 0, vec![1.0, 0.0])])
            .await
            .unwrap();
        backend
            .store_vectors("doc", &[chunk("doc", "c", "y", 0, vec![0.0, 1.0])])
            .await
            .unwrap();
        let ids: Vec<String> = backend
            .get_document_vectors("doc")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["c"]);
        assert_eq!(backend.stats().await.unwrap().documents, 1);

        let err = backend
            .store_vectors("doc", &[chunk("doc", "d", "z", 0, vec![1.0])])
            .await;
        assert!(err.is_err());

        backend.reset().await.unwrap();
        assert_eq!(backend.stats().await.unwrap().entries, 0);
    }
}
