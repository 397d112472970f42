//! SQLite document backend.
//!
//! Document rows live in their own `documents` table. Timestamps are
//! RFC 3339 strings with nanosecond precision, so they compare
//! lexically and round-trip exactly. Metadata is kept as a JSON object
//! and matched in Rust after the SQL predicates have run.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use lodestone_core::models::{metadata_matches, Document, Metadata};
use lodestone_core::store::{apply_update, DocumentBackend, DocumentFilter, DocumentStats};
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::db::LazyPool;
use crate::error::RagError;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        content TEXT NOT NULL,
        content_type TEXT NOT NULL DEFAULT 'text/plain',
        file_path TEXT,
        source_url TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        size INTEGER NOT NULL DEFAULT 0,
        chunk_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_created ON documents(created_at)",
];

const COLUMNS: &str = "id, content, content_type, file_path, source_url, metadata_json, size, \
                       chunk_count, created_at, updated_at, version";

pub struct SqliteDocumentBackend {
    db: LazyPool,
}

impl SqliteDocumentBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            db: LazyPool::new(path, SCHEMA),
        }
    }
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let metadata_json: String = row.try_get("metadata_json")?;
    let metadata: Metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
    Ok(Document {
        id: row.try_get("id")?,
        content: row.try_get("content")?,
        content_type: row.try_get("content_type")?,
        file_path: row.try_get("file_path")?,
        source_url: row.try_get("source_url")?,
        metadata,
        size: row.try_get("size")?,
        chunk_count: row.try_get("chunk_count")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
        version: row.try_get("version")?,
    })
}

async fn upsert<'c, E>(executor: E, doc: &Document) -> Result<()>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO documents
            (id, content, content_type, file_path, source_url, metadata_json, size,
             chunk_count, created_at, updated_at, version)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            content = excluded.content,
            content_type = excluded.content_type,
            file_path = excluded.file_path,
            source_url = excluded.source_url,
            metadata_json = excluded.metadata_json,
            size = excluded.size,
            chunk_count = excluded.chunk_count,
            updated_at = excluded.updated_at,
            version = excluded.version
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.content)
    .bind(&doc.content_type)
    .bind(&doc.file_path)
    .bind(&doc.source_url)
    .bind(serde_json::to_string(&doc.metadata)?)
    .bind(doc.size)
    .bind(doc.chunk_count)
    .bind(ts(doc.created_at))
    .bind(ts(doc.updated_at))
    .bind(doc.version)
    .execute(executor)
    .await?;
    Ok(())
}

impl SqliteDocumentBackend {
    async fn fetch(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!("SELECT {} FROM documents WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(self.db.get().await?)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    /// Insert or update inside one transaction. `must_exist` turns an
    /// insert into a not-found error.
    async fn write(&self, doc: &Document, must_exist: bool) -> Result<Document> {
        let pool = self.db.get().await?;
        let mut tx = pool.begin().await?;

        let existing = sqlx::query(&format!("SELECT {} FROM documents WHERE id = ?", COLUMNS))
            .bind(&doc.id)
            .fetch_optional(&mut *tx)
            .await?;
        let stored = match existing.as_ref().map(row_to_document).transpose()? {
            Some(existing) => apply_update(&existing, doc),
            None if must_exist => {
                return Err(RagError::not_found(format!("document '{}'", doc.id)));
            }
            None => doc.clone(),
        };

        upsert(&mut *tx, &stored).await?;
        tx.commit().await?;
        Ok(stored)
    }
}

#[async_trait]
impl DocumentBackend for SqliteDocumentBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn store(&self, doc: &Document) -> Result<Document> {
        self.write(doc, false).await
    }

    async fn get(&self, id: &str) -> Result<Option<Document>> {
        if self.db.is_pristine() {
            return Ok(None);
        }
        self.fetch(id).await
    }

    async fn update(&self, doc: &Document) -> Result<Document> {
        self.write(doc, true).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if self.db.is_pristine() {
            return Ok(());
        }
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(self.db.get().await?)
            .await?;
        Ok(())
    }

    async fn list(&self, filter: &DocumentFilter) -> Result<Vec<Document>> {
        if self.db.is_pristine() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM documents WHERE 1 = 1", COLUMNS));
        if !filter.content_types.is_empty() {
            qb.push(" AND content_type IN (");
            let mut sep = qb.separated(", ");
            for ct in &filter.content_types {
                sep.push_bind(ct.clone());
            }
            sep.push_unseparated(")");
        }
        if let Some(t) = filter.created_after {
            qb.push(" AND created_at >= ").push_bind(ts(t));
        }
        if let Some(t) = filter.created_before {
            qb.push(" AND created_at <= ").push_bind(ts(t));
        }
        if let Some(t) = filter.updated_after {
            qb.push(" AND updated_at >= ").push_bind(ts(t));
        }
        if let Some(t) = filter.updated_before {
            qb.push(" AND updated_at <= ").push_bind(ts(t));
        }
        if let Some(s) = filter.min_size {
            qb.push(" AND size >= ").push_bind(s);
        }
        if let Some(s) = filter.max_size {
            qb.push(" AND size <= ").push_bind(s);
        }
        qb.push(" ORDER BY created_at DESC, id ASC");

        let rows = qb.build().fetch_all(self.db.get().await?).await?;
        let mut docs = Vec::with_capacity(rows.len());
        for row in &rows {
            let doc = row_to_document(row)?;
            if metadata_matches(&doc.metadata, &filter.metadata) {
                docs.push(doc);
            }
        }
        Ok(filter.paginate(docs))
    }

    async fn stats(&self) -> Result<DocumentStats> {
        let mut stats = DocumentStats::default();
        if self.db.is_pristine() {
            return Ok(stats);
        }
        let pool = self.db.get().await?;
        let rows = sqlx::query(
            "SELECT content_type, COUNT(*) AS n, COALESCE(SUM(size), 0) AS total FROM documents GROUP BY content_type",
        )
        .fetch_all(pool)
        .await?;
        for row in &rows {
            let n = row.try_get::<i64, _>("n")? as u64;
            stats.total_documents += n;
            stats.total_size += row.try_get::<i64, _>("total")?.max(0) as u64;
            stats
                .content_types
                .insert(row.try_get("content_type")?, n);
        }
        if stats.total_documents > 0 {
            stats.average_size = stats.total_size as f64 / stats.total_documents as f64;
        }
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
        sqlx::query("DELETE FROM documents")
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
    use crate::error::kind_of;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    fn backend(tmp: &TempDir) -> SqliteDocumentBackend {
        SqliteDocumentBackend::new(tmp.path().join("docs.sqlite"))
    }

    #[tokio::test]
    async fn test_maintenance_on_unopened_store_creates_no_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("docs.sqlite");
        let backend = SqliteDocumentBackend::new(&path);
        backend.optimize().await.unwrap();
        backend.reset().await.unwrap();
        backend.delete("missing").await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_store_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let backend = backend(&tmp);
        assert!(backend.get("missing").await.unwrap().is_none());

        let mut doc = Document::new("doc-1", "hello world", "text/plain");
        doc.file_path = Some("/tmp/hello.txt".into());
        doc.metadata.insert("tags".into(), json!(["a", "b"]));
        doc.metadata.insert("year".into(), json!(2024));
        doc.chunk_count = 3;

        let stored = backend.store(&doc).await.unwrap();
        assert_eq!(stored, doc);
        assert_eq!(backend.get("doc-1").await.unwrap(), Some(doc));
    }

    #[tokio::test]
    async fn test_update_bumps_version() {
        let tmp = TempDir::new().unwrap();
        let backend = backend(&tmp);
        let doc = Document::new("d", "v1", "text/plain");
        backend.store(&doc).await.unwrap();

        let updated = backend
            .update(&Document::new("d", "v2 content", "text/plain"))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.created_at, doc.created_at);

        let again = backend.store(&updated).await.unwrap();
        assert_eq!(again.version, 3);

        let err = backend
            .update(&Document::new("nope", "x", "text/plain"))
            .await
            .unwrap_err();
        assert!(matches!(kind_of(&err), Some(RagError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_filters_and_stats() {
        let tmp = TempDir::new().unwrap();
        let backend = backend(&tmp);

        let mut a = Document::new("a", "1234", "text/plain");
        a.created_at -= Duration::hours(2);
        a.metadata.insert("lang".into(), json!("en"));
        let b = Document::new("b", "12345678", "text/markdown");
        let mut c = Document::new("c", "12", "text/plain");
        c.metadata.insert("lang".into(), json!("de"));
        for d in [&a, &b, &c] {
            backend.store(d).await.unwrap();
        }

        let all = backend.list(&DocumentFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all.last().unwrap().id, "a");

        let plain = DocumentFilter {
            content_types: vec!["text/plain".into()],
            ..Default::default()
        };
        assert_eq!(backend.list(&plain).await.unwrap().len(), 2);

        let mut english = plain.clone();
        english.metadata.insert("lang".into(), json!("en"));
        let ids: Vec<String> = backend
            .list(&english)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["a"]);

        let recent = DocumentFilter {
            created_after: Some(Utc::now() - Duration::hours(1)),
            min_size: Some(3),
            ..Default::default()
        };
        let ids: Vec<String> = backend
            .list(&recent)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["b"]);

        let page = DocumentFilter {
            limit: Some(1),
            offset: 1,
            ..Default::default()
        };
        assert_eq!(backend.list(&page).await.unwrap().len(), 1);

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.total_documents, 3);
        assert_eq!(stats.total_size, 14);
        assert_eq!(stats.content_types["text/plain"], 2);

        backend.delete("a").await.unwrap();
        backend.delete("a").await.unwrap();
        backend.reset().await.unwrap();
        assert_eq!(backend.stats().await.unwrap().total_documents, 0);
    }
}
