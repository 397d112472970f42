//! Configuration loading and validation.
//!
//! Lodestone is configured with a single TOML file. Every field has a
//! default, so an empty file yields a working in-memory setup:
//!
//! ```toml
//! [storage.vector]
//! backend = "sqlite"
//! path = "./data/lodestone.sqlite"
//! dimensions = 384
//! metric = "cosine"
//!
//! [storage.keyword]
//! backend = "tantivy"
//! path = "./data/keyword_index"
//! stemming = true
//!
//! [storage.document]
//! backend = "sqlite"
//! path = "./data/lodestone.sqlite"
//!
//! [ingestion.chunking]
//! strategy = "sentence"
//! chunk_size = 1000
//! overlap = 100
//!
//! [search.hybrid]
//! method = "rrf"
//! rrf_k = 60.0
//!
//! [pool]
//! enabled = true
//! strategy = "least_load"
//!
//! [[pool.providers]]
//! name = "local"
//! base_url = "http://localhost:11434/v1"
//! model = "llama3"
//! embedding_model = "nomic-embed-text"
//! capability = 3
//! ```
//!
//! [`load_config`] reads, parses, and validates a file; violations are
//! raised as [`RagError::Configuration`].

use anyhow::{Context, Result};
use lodestone_core::chunk::{ChunkStrategy, ChunkerConfig};
use lodestone_core::embedding::SimilarityMetric;
use lodestone_core::fusion::{FusionMethod, DEFAULT_RRF_K};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::RagError;
use crate::provider::pool::Strategy;

/// Known vector backend names.
pub const VECTOR_BACKENDS: &[&str] = &["memory", "sqlite"];
/// Known keyword backend names.
pub const KEYWORD_BACKENDS: &[&str] = &["memory", "sqlite", "tantivy"];
/// Known document backend names.
pub const DOCUMENT_BACKENDS: &[&str] = &["memory", "sqlite"];
/// Known embedder sources.
pub const EMBEDDING_PROVIDERS: &[&str] = &["hash", "openai", "pool"];
pub const KEYWORD_ANALYZERS: &[&str] = &["standard", "english"];

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

// ─── storage ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub vector: VectorStoreConfig,
    #[serde(default)]
    pub keyword: KeywordStoreConfig,
    #[serde(default)]
    pub document: DocumentStoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Database file for persistent backends.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default)]
    pub metric: SimilarityMetric,
    /// Only `flat` (exhaustive scan) is implemented.
    #[serde(default = "default_index_type")]
    pub index_type: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
            dimensions: default_dimensions(),
            metric: SimilarityMetric::default(),
            index_type: default_index_type(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeywordStoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Database file (`sqlite`) or index directory (`tantivy`).
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// `standard` tokenizes and lowercases; `english` also stems.
    #[serde(default = "default_analyzer")]
    pub analyzer: String,
    /// Only `en` is supported by the bundled stemmers.
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default)]
    pub stemming: bool,
}

impl KeywordStoreConfig {
    /// Whether the index should stem terms (Porter for FTS5, `en_stem`
    /// for Tantivy).
    pub fn stemmed(&self) -> bool {
        self.stemming || self.analyzer == "english"
    }
}

impl Default for KeywordStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
            analyzer: default_analyzer(),
            languages: default_languages(),
            stemming: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentStoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}
fn default_dimensions() -> usize {
    384
}
fn default_index_type() -> String {
    "flat".to_string()
}
fn default_analyzer() -> String {
    "standard".to_string()
}
fn default_languages() -> Vec<String> {
    vec!["en".to_string()]
}

// ─── ingestion ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    /// Chunks per embedder call.
    #[serde(default = "default_ingest_batch_size")]
    pub batch_size: usize,
    /// Concurrent workers for batch ingestion.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            batch_size: default_ingest_batch_size(),
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default)]
    pub strategy: ChunkStrategy,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    /// Pick a structure-aware splitter per document.
    #[serde(default = "default_true")]
    pub adaptive: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::default(),
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            min_size: default_min_size(),
            adaptive: true,
        }
    }
}

impl ChunkingConfig {
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            strategy: self.strategy,
            chunk_size: self.chunk_size,
            overlap: self.overlap,
            min_size: self.min_size,
        }
    }
}

fn default_ingest_batch_size() -> usize {
    32
}
fn default_concurrency() -> usize {
    5
}
fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    100
}
fn default_min_size() -> usize {
    50
}
fn default_true() -> bool {
    true
}

// ─── search ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default)]
    pub vector: ModeLimits,
    #[serde(default)]
    pub keyword: ModeLimits,
    #[serde(default)]
    pub hybrid: HybridConfig,
    /// Vector similarity floor applied when a request sets none.
    #[serde(default)]
    pub default_threshold: f64,
    /// Per-backend-call timeout.
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub highlight: bool,
    #[serde(default)]
    pub expansion: ExpansionConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            vector: ModeLimits::default(),
            keyword: ModeLimits::default(),
            hybrid: HybridConfig::default(),
            default_threshold: 0.0,
            timeout_secs: default_search_timeout(),
            highlight: true,
            expansion: ExpansionConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModeLimits {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

impl Default for ModeLimits {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
        }
    }
}

impl ModeLimits {
    /// Requested limit, defaulted and capped.
    pub fn resolve(&self, requested: Option<usize>) -> usize {
        requested
            .filter(|&l| l > 0)
            .unwrap_or(self.default_limit)
            .min(self.max_limit)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HybridConfig {
    #[serde(default)]
    pub limits: ModeLimits,
    #[serde(default)]
    pub method: FusionMethod,
    #[serde(default = "default_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            limits: ModeLimits::default(),
            method: FusionMethod::default(),
            vector_weight: default_weight(),
            keyword_weight: default_weight(),
            rrf_k: default_rrf_k(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExpansionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `none`, `synonym`, or `llm`.
    #[serde(default = "default_expansion_method")]
    pub method: String,
    #[serde(default = "default_max_terms")]
    pub max_terms: usize,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            method: default_expansion_method(),
            max_terms: default_max_terms(),
        }
    }
}

fn default_limit() -> usize {
    10
}
fn default_max_limit() -> usize {
    100
}
fn default_search_timeout() -> u64 {
    30
}
fn default_weight() -> f64 {
    0.5
}
fn default_rrf_k() -> f64 {
    DEFAULT_RRF_K
}
fn default_expansion_method() -> String {
    "synonym".to_string()
}
fn default_max_terms() -> usize {
    5
}

// ─── provider pool ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Seconds between background health checks; 0 disables the loop.
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: default_strategy(),
            health_check_interval_secs: default_health_interval(),
            providers: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Environment variable consulted when `api_key` is empty.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub embedding_model: Option<String>,
    /// In-flight request cap; 0 or less means uncapped.
    #[serde(default)]
    pub max_concurrency: i64,
    /// Quality tier 1–5.
    #[serde(default = "default_capability")]
    pub capability: u8,
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

impl ProviderConfig {
    pub fn resolve_api_key(&self) -> String {
        if !self.api_key.is_empty() {
            return self.api_key.clone();
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .unwrap_or_default()
    }
}

fn default_strategy() -> String {
    "round_robin".to_string()
}
fn default_health_interval() -> u64 {
    60
}
fn default_capability() -> u8 {
    3
}
fn default_request_timeout() -> u64 {
    60
}

// ─── embedding ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hash` (offline), `openai` (single endpoint), or `pool`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    /// Maximum inputs per embeddings HTTP request.
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dimensions: default_dimensions(),
            batch_size: default_embedding_batch_size(),
            base_url: default_openai_base_url(),
            api_key_env: default_openai_key_env(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_embedding_batch_size() -> usize {
    64
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

// ─── service, scheduler, logging, prompts ────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Seconds between background optimize runs; 0 disables.
    #[serde(default)]
    pub optimize_interval_secs: u64,
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            optimize_interval_secs: 0,
            max_sources: default_max_sources(),
            min_score: default_min_score(),
        }
    }
}

fn default_max_sources() -> usize {
    5
}
fn default_min_score() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Reserved; jobs are kept in memory.
    #[serde(default)]
    pub persistence_path: Option<PathBuf>,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_queue_capacity: usize,
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
    /// Age after which completed jobs are garbage-collected.
    #[serde(default = "default_retention")]
    pub completed_retention_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            persistence_path: None,
            job_timeout_secs: default_job_timeout(),
            event_queue_capacity: default_event_capacity(),
            gc_interval_secs: default_gc_interval(),
            completed_retention_secs: default_retention(),
        }
    }
}

fn default_job_timeout() -> u64 {
    30 * 60
}
fn default_event_capacity() -> usize {
    100
}
fn default_gc_interval() -> u64 {
    60 * 60
}
fn default_retention() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PromptsConfig {
    /// Directory of `namespace.key.md` template overrides.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

// ─── loading ─────────────────────────────────────────────────────────────

impl Config {
    /// Parse inline TOML and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| RagError::configuration(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        check_backend("storage.vector", &self.storage.vector.backend, VECTOR_BACKENDS)?;
        check_backend("storage.keyword", &self.storage.keyword.backend, KEYWORD_BACKENDS)?;
        check_backend(
            "storage.document",
            &self.storage.document.backend,
            DOCUMENT_BACKENDS,
        )?;

        let keyword = &self.storage.keyword;
        if !KEYWORD_ANALYZERS.contains(&keyword.analyzer.as_str()) {
            return Err(RagError::configuration(format!(
                "unknown storage.keyword.analyzer '{}' (expected one of {})",
                keyword.analyzer,
                KEYWORD_ANALYZERS.join(", ")
            )));
        }
        if let Some(lang) = keyword.languages.iter().find(|l| l.as_str() != "en") {
            return Err(RagError::configuration(format!(
                "storage.keyword.languages: '{}' is not supported (only en)",
                lang
            )));
        }

        if self.storage.vector.dimensions == 0 {
            return Err(RagError::configuration("storage.vector.dimensions must be > 0"));
        }
        if self.storage.vector.index_type != "flat" {
            return Err(RagError::configuration(format!(
                "storage.vector.index_type '{}' is not supported (expected flat)",
                self.storage.vector.index_type
            )));
        }

        let chunking = &self.ingestion.chunking;
        if chunking.chunk_size == 0 {
            return Err(RagError::configuration("ingestion.chunking.chunk_size must be > 0"));
        }
        if chunking.overlap >= chunking.chunk_size {
            return Err(RagError::configuration(
                "ingestion.chunking.overlap must be smaller than chunk_size",
            ));
        }
        if self.ingestion.concurrency == 0 || self.ingestion.batch_size == 0 {
            return Err(RagError::configuration(
                "ingestion.concurrency and ingestion.batch_size must be > 0",
            ));
        }

        let hybrid = &self.search.hybrid;
        if hybrid.vector_weight < 0.0 || hybrid.keyword_weight < 0.0 {
            return Err(RagError::configuration("search.hybrid weights must be >= 0"));
        }
        if hybrid.rrf_k <= 0.0 {
            return Err(RagError::configuration("search.hybrid.rrf_k must be > 0"));
        }
        for (name, limits) in [
            ("vector", &self.search.vector),
            ("keyword", &self.search.keyword),
            ("hybrid", &hybrid.limits),
        ] {
            if limits.default_limit == 0 || limits.max_limit < limits.default_limit {
                return Err(RagError::configuration(format!(
                    "search.{} limits must satisfy 0 < default_limit <= max_limit",
                    name
                )));
            }
        }
        match self.search.expansion.method.as_str() {
            "none" | "synonym" | "llm" => {}
            other => {
                return Err(RagError::configuration(format!(
                    "unknown search.expansion.method '{}' (expected none, synonym, or llm)",
                    other
                )))
            }
        }

        Strategy::from_str(&self.pool.strategy)
            .map_err(|e| RagError::configuration(e.to_string()))?;
        for p in &self.pool.providers {
            if p.name.trim().is_empty() || p.base_url.trim().is_empty() {
                return Err(RagError::configuration(
                    "pool.providers entries need a name and base_url",
                ));
            }
            if !(1..=5).contains(&p.capability) {
                return Err(RagError::configuration(format!(
                    "provider '{}' capability must be 1-5, got {}",
                    p.name, p.capability
                )));
            }
        }

        if !EMBEDDING_PROVIDERS.contains(&self.embedding.provider.as_str()) {
            return Err(RagError::configuration(format!(
                "unknown embedding.provider '{}' (expected one of {})",
                self.embedding.provider,
                EMBEDDING_PROVIDERS.join(", ")
            )));
        }
        if self.embedding.provider == "pool" && self.pool.providers.is_empty() {
            return Err(RagError::configuration(
                "embedding.provider = \"pool\" requires at least one [[pool.providers]] entry",
            ));
        }
        if self.embedding.provider == "openai" && self.embedding.model.is_none() {
            return Err(RagError::configuration(
                "embedding.model must be set when embedding.provider = \"openai\"",
            ));
        }
        if self.embedding.batch_size == 0 {
            return Err(RagError::configuration("embedding.batch_size must be > 0"));
        }
        if self.scheduler.event_queue_capacity == 0 {
            return Err(RagError::configuration(
                "scheduler.event_queue_capacity must be > 0",
            ));
        }

        Ok(())
    }
}

fn check_backend(section: &str, name: &str, known: &[&str]) -> Result<()> {
    if name.trim().is_empty() {
        return Err(RagError::configuration(format!(
            "{}.backend must not be empty",
            section
        )));
    }
    if !known.contains(&name) {
        return Err(RagError::configuration(format!(
            "unknown {}.backend '{}' (expected one of {})",
            section,
            name,
            known.join(", ")
        )));
    }
    Ok(())
}

/// Read, parse, and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Config::from_toml_str(&content)
}
