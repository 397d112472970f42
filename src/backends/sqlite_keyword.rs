//! SQLite FTS5 keyword backend.
//!
//! Chunks live in `keyword_chunks`; an FTS5 table `keyword_fts` indexes
//! their title and content. Scores are the negated `bm25()` rank with the
//! title/content boosts applied as column weights. Fuzzy matching is
//! approximated with prefix queries (`term*`).

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use lodestone_core::highlight::{excerpts, query_terms, EXCERPT_CHARS};
use lodestone_core::models::{
    decode_metadata, encode_metadata, matches_filter, HitSource, KeywordChunk, SearchHit,
    SearchResults, StoredMetadata,
};
use lodestone_core::store::{BackendStats, KeywordBackend, KeywordSearchOptions};
use sqlx::Row;

use crate::db::{from_millis, to_millis, LazyPool};

const CHUNKS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS keyword_chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        content TEXT NOT NULL,
        title TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        position INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
"#;
const CHUNKS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_keyword_chunks_document ON keyword_chunks(document_id)";

const SCHEMA: &[&str] = &[
    CHUNKS_TABLE,
    CHUNKS_INDEX,
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS keyword_fts USING fts5(
        chunk_id UNINDEXED,
        document_id UNINDEXED,
        title,
        content,
        tokenize = 'unicode61'
    )
    "#,
];

const STEMMED_SCHEMA: &[&str] = &[
    CHUNKS_TABLE,
    CHUNKS_INDEX,
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS keyword_fts USING fts5(
        chunk_id UNINDEXED,
        document_id UNINDEXED,
        title,
        content,
        tokenize = 'porter unicode61'
    )
    "#,
];

pub struct SqliteKeywordBackend {
    db: LazyPool,
}

impl SqliteKeywordBackend {
    /// `stemming` selects the Porter tokenizer; it only takes effect when
    /// the index is first created.
    pub fn new(path: impl Into<PathBuf>, stemming: bool) -> Self {
        let schema = if stemming { STEMMED_SCHEMA } else { SCHEMA };
        Self {
            db: LazyPool::new(path, schema),
        }
    }
}

/// Build an FTS5 MATCH expression that matches any of the terms.
fn fts_query(terms: &[String], fuzzy: bool) -> String {
    terms
        .iter()
        .map(|t| {
            if fuzzy {
                format!("\"{}\"*", t)
            } else {
                format!("\"{}\"", t)
            }
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[async_trait]
impl KeywordBackend for SqliteKeywordBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn index_chunks(&self, document_id: &str, chunks: &[KeywordChunk]) -> Result<()> {
        let pool = self.db.get().await?;
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM keyword_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM keyword_chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for c in chunks {
            let metadata = serde_json::to_string(&encode_metadata(&c.metadata))?;
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO keyword_chunks
                    (id, document_id, content, title, metadata_json, position, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&c.id)
            .bind(document_id)
            .bind(&c.content)
            .bind(&c.title)
            .bind(metadata)
            .bind(c.position)
            .bind(to_millis(c.created_at))
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO keyword_fts (chunk_id, document_id, title, content) VALUES (?, ?, ?, ?)",
            )
            .bind(&c.id)
            .bind(document_id)
            .bind(c.title.as_deref().unwrap_or(""))
            .bind(&c.content)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn search(&self, query: &str, opts: &KeywordSearchOptions) -> Result<SearchResults> {
        let terms = query_terms(query);
        if terms.is_empty() || self.db.is_pristine() {
            return Ok(SearchResults::empty());
        }
        let pool = self.db.get().await?;

        let rows = sqlx::query(
            r#"
            SELECT k.id, k.document_id, k.content, k.metadata_json,
                   bm25(keyword_fts, 0.0, 0.0, ?, ?) AS rank
            FROM keyword_fts
            JOIN keyword_chunks k ON k.id = keyword_fts.chunk_id
            WHERE keyword_fts MATCH ?
            ORDER BY rank, k.id
            "#,
        )
        .bind(opts.boost("title"))
        .bind(opts.boost("content"))
        .bind(fts_query(&terms, opts.fuzzy))
        .fetch_all(pool)
        .await?;

        let mut hits = Vec::new();
        for row in &rows {
            let stored: StoredMetadata =
                serde_json::from_str(&row.try_get::<String, _>("metadata_json")?)
                    .unwrap_or_default();
            if !matches_filter(&stored, &opts.filter) {
                continue;
            }
            let content: String = row.try_get("content")?;
            let rank: f64 = row.try_get("rank")?;
            hits.push(SearchHit {
                chunk_id: row.try_get("id")?,
                document_id: row.try_get("document_id")?,
                highlights: if opts.highlight {
                    excerpts(&content, &terms, EXCERPT_CHARS)
                } else {
                    Vec::new()
                },
                content,
                score: -rank, // negate so higher = better
                source: HitSource::Keyword,
                rank: 0,
                metadata: decode_metadata(&stored),
                vector: None,
            });
        }

        let total = hits.len();
        let hits = hits
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
        let pool = self.db.get().await?;
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM keyword_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM keyword_chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_document_content(&self, document_id: &str) -> Result<Vec<KeywordChunk>> {
        if self.db.is_pristine() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, content, title, metadata_json, position, created_at
            FROM keyword_chunks
            WHERE document_id = ?
            ORDER BY position
            "#,
        )
        .bind(document_id)
        .fetch_all(self.db.get().await?)
        .await?;

        rows.iter()
            .map(|row| {
                let stored: StoredMetadata =
                    serde_json::from_str(&row.try_get::<String, _>("metadata_json")?)
                        .unwrap_or_default();
                Ok(KeywordChunk {
                    id: row.try_get("id")?,
                    document_id: row.try_get("document_id")?,
                    content: row.try_get("content")?,
                    title: row.try_get("title")?,
                    metadata: decode_metadata(&stored),
                    position: row.try_get("position")?,
                    created_at: from_millis(row.try_get("created_at")?),
                })
            })
            .collect()
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
                   COALESCE(SUM(LENGTH(content)), 0) AS size_bytes
            FROM keyword_chunks
            "#,
        )
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
        sqlx::query("INSERT INTO keyword_fts(keyword_fts) VALUES('optimize')")
            .execute(self.db.get().await?)
            .await?;
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        if self.db.is_pristine() {
            return Ok(());
        }
        let pool = self.db.get().await?;
        sqlx::query("DELETE FROM keyword_fts").execute(pool).await?;
        sqlx::query("DELETE FROM keyword_chunks").execute(pool).await?;
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
