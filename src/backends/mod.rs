//! Persistent backends and the factories that pick one per sub-store.
//!
//! | Sub-store | `backend` names |
//! |-----------|-----------------|
//! | vector | `memory`, `sqlite` |
//! | keyword | `memory`, `sqlite` (FTS5), `tantivy` |
//! | document | `memory`, `sqlite` |
//!
//! Persistent backends need a `path`. Unknown names and missing paths are
//! configuration errors.

pub mod sqlite_document;
pub mod sqlite_keyword;
pub mod sqlite_vector;
pub mod tantivy_keyword;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use lodestone_core::store::memory::{
    MemoryDocumentBackend, MemoryKeywordBackend, MemoryVectorBackend,
};
use lodestone_core::store::{DocumentBackend, KeywordBackend, VectorBackend};

use crate::config::{DocumentStoreConfig, KeywordStoreConfig, VectorStoreConfig};
use crate::error::RagError;

pub use sqlite_document::SqliteDocumentBackend;
pub use sqlite_keyword::SqliteKeywordBackend;
pub use sqlite_vector::SqliteVectorBackend;
pub use tantivy_keyword::TantivyKeywordBackend;

fn require_path(section: &str, backend: &str, path: &Option<PathBuf>) -> Result<PathBuf> {
    path.clone().ok_or_else(|| {
        RagError::configuration(format!(
            "{}.path is required for the {} backend",
            section, backend
        ))
    })
}

pub fn create_vector_backend(config: &VectorStoreConfig) -> Result<Arc<dyn VectorBackend>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryVectorBackend::new(
            config.dimensions,
            config.metric,
        ))),
        "sqlite" => {
            let path = require_path("storage.vector", "sqlite", &config.path)?;
            Ok(Arc::new(SqliteVectorBackend::new(
                path,
                config.dimensions,
                config.metric,
            )))
        }
        "" => Err(RagError::configuration("storage.vector.backend is empty")),
        other => Err(RagError::configuration(format!(
            "unknown vector backend '{}'",
            other
        ))),
    }
}

pub fn create_keyword_backend(config: &KeywordStoreConfig) -> Result<Arc<dyn KeywordBackend>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryKeywordBackend::new())),
        "sqlite" => {
            let path = require_path("storage.keyword", "sqlite", &config.path)?;
            Ok(Arc::new(SqliteKeywordBackend::new(path, config.stemmed())))
        }
        "tantivy" => {
            let path = require_path("storage.keyword", "tantivy", &config.path)?;
            let backend = TantivyKeywordBackend::open(&path, config.stemmed())
                .map_err(|e| RagError::configuration(format!("tantivy index: {:#}", e)))?;
            Ok(Arc::new(backend))
        }
        "" => Err(RagError::configuration("storage.keyword.backend is empty")),
        other => Err(RagError::configuration(format!(
            "unknown keyword backend '{}'",
            other
        ))),
    }
}

pub fn create_document_backend(config: &DocumentStoreConfig) -> Result<Arc<dyn DocumentBackend>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryDocumentBackend::new())),
        "sqlite" => {
            let path = require_path("storage.document", "sqlite", &config.path)?;
            Ok(Arc::new(SqliteDocumentBackend::new(path)))
        }
        "" => Err(RagError::configuration("storage.document.backend is empty")),
        other => Err(RagError::configuration(format!(
            "unknown document backend '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;

    fn is_config_error<T>(r: Result<T>) -> bool {
        match r {
            Err(e) => matches!(kind_of(&e), Some(RagError::Configuration(_))),
            Ok(_) => false,
        }
    }

    #[test]
    fn test_factories_by_name() {
        let tmp = tempfile::TempDir::new().unwrap();

        let v = create_vector_backend(&VectorStoreConfig::default()).unwrap();
        assert_eq!(v.name(), "memory");
        let v = create_vector_backend(&VectorStoreConfig {
            backend: "sqlite".into(),
            path: Some(tmp.path().join("v.sqlite")),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(v.name(), "sqlite");

        let k = create_keyword_backend(&KeywordStoreConfig {
            backend: "tantivy".into(),
            path: Some(tmp.path().join("kw")),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(k.name(), "tantivy");

        let d = create_document_backend(&DocumentStoreConfig {
            backend: "sqlite".into(),
            path: Some(tmp.path().join("d.sqlite")),
        })
        .unwrap();
        assert_eq!(d.name(), "sqlite");
    }

    #[tokio::test]
    async fn test_english_analyzer_stems_keyword_index() {
        use lodestone_core::models::{Chunk, KeywordChunk};
        use lodestone_core::store::KeywordSearchOptions;

        let tmp = tempfile::TempDir::new().unwrap();
        let k = create_keyword_backend(&KeywordStoreConfig {
            backend: "sqlite".into(),
            path: Some(tmp.path().join("k.sqlite")),
            analyzer: "english".into(),
            ..Default::default()
        })
        .unwrap();
        let chunk = Chunk::new("d", "walking boots", 0);
        k.index_chunks("d", &[KeywordChunk::from_chunk(&chunk, None)])
            .await
            .unwrap();
        let opts = KeywordSearchOptions {
            limit: 5,
            ..Default::default()
        };
        assert_eq!(k.search("walk", &opts).await.unwrap().hits.len(), 1);
    }

    #[test]
    fn test_factory_errors() {
        assert!(is_config_error(create_vector_backend(&VectorStoreConfig {
            backend: "qdrant".into(),
            ..Default::default()
        })));
        assert!(is_config_error(create_keyword_backend(&KeywordStoreConfig {
            backend: "sqlite".into(),
            ..Default::default()
        })));
        assert!(is_config_error(create_document_backend(&DocumentStoreConfig {
            backend: String::new(),
            path: None,
        })));
    }
}
