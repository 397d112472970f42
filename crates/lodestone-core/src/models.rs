//! Core data models shared by every Lodestone component.
//!
//! These types describe the documents, chunks, and search hits that flow
//! through the ingestion and retrieval pipeline, plus the metadata codec
//! used at every backend boundary.
//!
//! # Metadata at the backend boundary
//!
//! User metadata is a string-keyed map of arbitrary JSON values. Backends
//! only store homogeneous `String → String` maps, so values are encoded on
//! write with [`encode_metadata`]: strings are kept verbatim, other
//! scalars use their JSON text, and arrays/objects are JSON-encoded.
//! [`decode_metadata`] leaves every value as a string on read.
//!
//! Keys beginning with `_` are reserved for internal markers such as
//! `_type` and `_hash`. User keys with a leading underscore are dropped
//! on encode and internal keys are stripped on decode.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// User metadata attached to documents and chunks.
pub type Metadata = HashMap<String, Value>;

/// Metadata as stored by backends: every value is a string.
pub type StoredMetadata = HashMap<String, String>;

/// Internal metadata key marking the kind of an index entry.
pub const TYPE_KEY: &str = "_type";
/// Internal metadata key holding a chunk's SHA-256 content hash.
pub const HASH_KEY: &str = "_hash";
/// `_type` value for chunk entries.
pub const TYPE_CHUNK: &str = "chunk";
/// `_type` value for document-metadata entries.
pub const TYPE_DOCUMENT: &str = "document";

/// A persistently identified piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Immutable identifier, caller-supplied or derived at ingest time.
    pub id: String,
    /// Original (extracted) content.
    pub content: String,
    /// MIME-style content type, e.g. `text/plain`.
    pub content_type: String,
    pub file_path: Option<String>,
    pub source_url: Option<String>,
    pub metadata: Metadata,
    /// Content size in bytes.
    pub size: i64,
    pub chunk_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Starts at 1 and increases by one per successful update.
    pub version: i64,
}

impl Document {
    /// Create a version-1 document stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let now = Utc::now();
        Self {
            id: id.into(),
            size: content.len() as i64,
            content,
            content_type: content_type.into(),
            file_path: None,
            source_url: None,
            metadata: Metadata::new(),
            chunk_count: 0,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// The `title` metadata value, if present and a string.
    pub fn title(&self) -> Option<&str> {
        self.metadata.get("title").and_then(Value::as_str)
    }
}

/// A chunk in vector form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique across all documents.
    pub id: String,
    pub document_id: String,
    pub content: String,
    /// Absent while embedding is deferred to the storage manager.
    pub embedding: Option<Vec<f32>>,
    pub metadata: Metadata,
    /// Zero-based ordinal within the owning document.
    pub position: i64,
    /// SHA-256 of `content`, hex encoded.
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    /// Create a chunk with a fresh UUID and a content hash.
    pub fn new(document_id: impl Into<String>, content: impl Into<String>, position: i64) -> Self {
        let content = content.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.into(),
            hash: content_hash(&content),
            content,
            embedding: None,
            metadata: Metadata::new(),
            position,
            created_at: Utc::now(),
        }
    }
}

/// A chunk in keyword form: vector-less, with an optional title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordChunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub title: Option<String>,
    pub metadata: Metadata,
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

impl KeywordChunk {
    pub fn from_chunk(chunk: &Chunk, title: Option<&str>) -> Self {
        Self {
            id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            content: chunk.content.clone(),
            title: title.map(str::to_string),
            metadata: chunk.metadata.clone(),
            position: chunk.position,
            created_at: chunk.created_at,
        }
    }
}

/// Which retrieval modality produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitSource {
    Vector,
    Keyword,
    Hybrid,
}

impl HitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            HitSource::Vector => "vector",
            HitSource::Keyword => "keyword",
            HitSource::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for HitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HitSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vector" => Ok(HitSource::Vector),
            "keyword" => Ok(HitSource::Keyword),
            "hybrid" => Ok(HitSource::Hybrid),
            other => anyhow::bail!("unknown hit source '{}'", other),
        }
    }
}

/// A single retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub highlights: Vec<String>,
    pub source: HitSource,
    /// One-based rank within the result list.
    pub rank: usize,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

/// A ranked page of hits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    /// Matches before pagination.
    pub total: usize,
    /// Score of the first hit, or 0 when empty.
    pub max_score: f64,
}

impl SearchResults {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build results from already-sorted hits, assigning one-based ranks.
    pub fn from_ranked(mut hits: Vec<SearchHit>, total: usize) -> Self {
        for (i, hit) in hits.iter_mut().enumerate() {
            hit.rank = i + 1;
        }
        let max_score = hits.first().map(|h| h.score).unwrap_or(0.0);
        Self {
            hits,
            total,
            max_score,
        }
    }
}

/// SHA-256 of `text`, hex encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Encode a single metadata value in its stored string form.
pub fn encode_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Encode user metadata for storage, dropping reserved `_` keys.
pub fn encode_metadata(metadata: &Metadata) -> StoredMetadata {
    metadata
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), encode_value(v)))
        .collect()
}

/// Decode stored metadata, stripping internal keys. Values stay strings.
pub fn decode_metadata(stored: &StoredMetadata) -> Metadata {
    stored
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

/// Conjunctive equality match of `filter` against stored metadata.
///
/// Filter values are compared in their encoded form, so `{"year": 2024}`
/// matches a stored `"2024"`.
pub fn matches_filter(stored: &StoredMetadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(k, v)| stored.get(k).map(|s| *s == encode_value(v)).unwrap_or(false))
}

/// [`matches_filter`] against unencoded metadata.
pub fn metadata_matches(metadata: &Metadata, filter: &Metadata) -> bool {
    filter.iter().all(|(k, v)| {
        metadata
            .get(k)
            .map(|m| encode_value(m) == encode_value(v))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_scalars_and_nested() {
        let mut md = Metadata::new();
        md.insert("author".into(), json!("Ada"));
        md.insert("year".into(), json!(1843));
        md.insert("tags".into(), json!(["math", "engines"]));
        md.insert("_type".into(), json!("sneaky"));

        let stored = encode_metadata(&md);
        assert_eq!(stored["author"], "Ada");
        assert_eq!(stored["year"], "1843");
        assert_eq!(stored["tags"], r#"["math","engines"]"#);
        assert!(!stored.contains_key("_type"));
    }

    #[test]
    fn test_decode_strips_internal_keys() {
        let mut stored = StoredMetadata::new();
        stored.insert(TYPE_KEY.into(), TYPE_CHUNK.into());
        stored.insert(HASH_KEY.into(), "abc".into());
        stored.insert("year".into(), "1843".into());

        let md = decode_metadata(&stored);
        assert_eq!(md.len(), 1);
        assert_eq!(md["year"], json!("1843"));
    }

    #[test]
    fn test_filter_matches_encoded_form() {
        let mut stored = StoredMetadata::new();
        stored.insert("year".into(), "2024".into());
        stored.insert("lang".into(), "en".into());

        let mut filter = Metadata::new();
        filter.insert("year".into(), json!(2024));
        assert!(matches_filter(&stored, &filter));

        filter.insert("lang".into(), json!("fr"));
        assert!(!matches_filter(&stored, &filter));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(matches_filter(&StoredMetadata::new(), &Metadata::new()));
    }

    #[test]
    fn test_chunk_hash_is_sha256() {
        let c = Chunk::new("doc", "hello", 0);
        assert_eq!(
            c.hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_results_rank_and_max_score() {
        let hit = |id: &str, score: f64| SearchHit {
            chunk_id: id.into(),
            document_id: "d".into(),
            content: String::new(),
            score,
            highlights: vec![],
            source: HitSource::Vector,
            rank: 0,
            metadata: Metadata::new(),
            vector: None,
        };
        let results = SearchResults::from_ranked(vec![hit("a", 0.9), hit("b", 0.4)], 2);
        assert_eq!(results.max_score, 0.9);
        assert_eq!(results.hits[1].rank, 2);
        assert_eq!(SearchResults::empty().max_score, 0.0);
    }
}
