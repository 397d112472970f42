//! SQLite connection setup shared by the persistent backends.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::OnceCell;
use tracing::debug;

/// Open (creating if needed) the database at `path` in WAL mode.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Milliseconds since the epoch, as stored in timestamp columns.
pub fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// A SQLite pool opened on first use.
///
/// The schema statements run once, right after the connection is made.
pub struct LazyPool {
    path: PathBuf,
    schema: &'static [&'static str],
    cell: OnceCell<SqlitePool>,
}

impl LazyPool {
    pub fn new(path: impl Into<PathBuf>, schema: &'static [&'static str]) -> Self {
        Self {
            path: path.into(),
            schema,
            cell: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The pool, opening it and applying the schema if needed.
    pub async fn get(&self) -> Result<&SqlitePool> {
        self.cell
            .get_or_try_init(|| async {
                let pool = connect(&self.path).await?;
                for stmt in self.schema {
                    sqlx::query(stmt).execute(&pool).await?;
                }
                debug!(path = %self.path.display(), "opened sqlite store");
                Ok::<_, anyhow::Error>(pool)
            })
            .await
    }

    /// True while nothing has been opened and no file exists yet, in
    /// which case reads can short-circuit to empty results.
    pub fn is_pristine(&self) -> bool {
        self.cell.get().is_none() && !self.path.exists()
    }

    pub async fn close(&self) {
        if let Some(pool) = self.cell.get() {
            pool.close().await;
        }
    }
}
