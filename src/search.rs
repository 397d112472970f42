//! Search engine: vector, keyword, hybrid and expanded search.
//!
//! Every mode applies the configured limit defaults and caps before
//! delegating to the backends, and every backend call is bounded by
//! `search.timeout_secs`.
//!
//! # Hybrid search
//!
//! ```text
//! query ─┬─▶ embedder ─▶ vector backend ──┐
//!        └──────────────▶ keyword backend ┴─▶ fuser (rrf | weighted | linear) ─▶ top-K
//! ```
//!
//! Both searches run concurrently with the same limit, offset and filter.
//! If either fails the hybrid search fails. Fusion is a pure function of
//! the two ranked lists, so identical backend output yields identical
//! results.
//!
//! # Expanded search
//!
//! The configured [`QueryExpander`] adds related terms; the expanded text
//! is embedded and searched in hybrid mode, and the original query plus
//! the added terms come back as `suggestions`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use lodestone_core::expansion::{NoopExpander, QueryExpander};
use lodestone_core::fusion::{fuser_for, FusionMethod};
use lodestone_core::models::{Metadata, SearchResults};
use lodestone_core::store::{KeywordSearchOptions, VectorSearchOptions};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SearchConfig;
use crate::error::RagError;
use crate::storage::StorageManager;

/// Parameters shared by all search modes. Unset options take the
/// engine's configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// Precomputed query embedding; skips the embedder call.
    pub vector: Option<Vec<f32>>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    pub threshold: Option<f64>,
    #[serde(default)]
    pub filter: Metadata,
    #[serde(default)]
    pub fuzzy: bool,
    pub highlight: Option<bool>,
    pub method: Option<FusionMethod>,
    pub vector_weight: Option<f64>,
    pub keyword_weight: Option<f64>,
    #[serde(default)]
    pub include_vector: bool,
    #[serde(default)]
    pub boosts: HashMap<String, f64>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.filter.insert(key.into(), value);
        self
    }

    pub fn with_method(mut self, method: FusionMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_weights(mut self, vector_weight: f64, keyword_weight: f64) -> Self {
        self.vector_weight = Some(vector_weight);
        self.keyword_weight = Some(keyword_weight);
        self
    }

    pub fn fuzzy(mut self, fuzzy: bool) -> Self {
        self.fuzzy = fuzzy;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: SearchResults,
    /// Fusion method, for hybrid and expanded searches.
    pub method: Option<FusionMethod>,
    /// Original query followed by expansion terms; empty unless expanded.
    pub suggestions: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Vector,
    Keyword,
    Hybrid,
    Expanded,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchStats {
    pub total_queries: u64,
    pub vector_queries: u64,
    pub keyword_queries: u64,
    pub hybrid_queries: u64,
    pub expanded_queries: u64,
    /// Exponential moving average, coefficient 0.5.
    pub average_latency_ms: f64,
    pub average_results: f64,
    pub zero_result_rate: f64,
    pub error_rate: f64,
    /// Hybrid and expanded queries per fusion method name.
    pub method_counts: HashMap<String, u64>,
    #[serde(skip)]
    successes: u64,
    #[serde(skip)]
    zero_results: u64,
    #[serde(skip)]
    errors: u64,
}

const LATENCY_EMA: f64 = 0.5;

impl SearchStats {
    fn record(&mut self, mode: Mode, method: Option<FusionMethod>, latency_ms: f64, hits: Option<usize>) {
        self.total_queries += 1;
        match mode {
            Mode::Vector => self.vector_queries += 1,
            Mode::Keyword => self.keyword_queries += 1,
            Mode::Hybrid => self.hybrid_queries += 1,
            Mode::Expanded => self.expanded_queries += 1,
        }
        if let Some(m) = method {
            *self.method_counts.entry(m.as_str().to_string()).or_insert(0) += 1;
        }

        self.average_latency_ms = if self.total_queries == 1 {
            latency_ms
        } else {
            LATENCY_EMA * latency_ms + (1.0 - LATENCY_EMA) * self.average_latency_ms
        };

        match hits {
            Some(n) => {
                let prev = self.successes as f64;
                self.successes += 1;
                self.average_results = (self.average_results * prev + n as f64) / (prev + 1.0);
                if n == 0 {
                    self.zero_results += 1;
                }
            }
            None => self.errors += 1,
        }
        let total = self.total_queries as f64;
        self.zero_result_rate = self.zero_results as f64 / total;
        self.error_rate = self.errors as f64 / total;
    }
}

pub struct SearchEngine {
    storage: Arc<StorageManager>,
    config: SearchConfig,
    expander: Arc<dyn QueryExpander>,
    stats: Mutex<SearchStats>,
    closed: AtomicBool,
}

impl SearchEngine {
    /// An engine with the no-op expander.
    pub fn new(storage: Arc<StorageManager>, config: SearchConfig) -> Self {
        Self {
            storage,
            config,
            expander: Arc::new(NoopExpander),
            stats: Mutex::new(SearchStats::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_expander(mut self, expander: Arc<dyn QueryExpander>) -> Self {
        self.expander = expander;
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn stats(&self) -> SearchStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every later search fails with a closed error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub async fn vector_search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.observe(Mode::Vector, None, &request.query, async {
            let results = self.run_vector(request, self.config.vector.resolve(request.limit)).await?;
            Ok((results, Vec::new()))
        })
        .await
    }

    pub async fn keyword_search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.observe(Mode::Keyword, None, &request.query, async {
            let results = self
                .run_keyword(&request.query, request, self.config.keyword.resolve(request.limit))
                .await?;
            Ok((results, Vec::new()))
        })
        .await
    }

    pub async fn hybrid_search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let method = request.method.unwrap_or(self.config.hybrid.method);
        self.observe(Mode::Hybrid, Some(method), &request.query, async {
            let results = self.run_hybrid(&request.query, request, method).await?;
            Ok((results, Vec::new()))
        })
        .await
    }

    /// Hybrid search over the expanded query.
    pub async fn expanded_search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let method = request.method.unwrap_or(self.config.hybrid.method);
        self.observe(Mode::Expanded, Some(method), &request.query, async {
            if request.query.trim().is_empty() {
                return Err(RagError::validation("search query is empty"));
            }
            let expanded = self
                .expander
                .expand(&request.query, self.config.expansion.max_terms)
                .await
                .map_err(|e| RagError::service(self.expander.name(), "expand", format!("{:#}", e)))?;
            debug!(
                expander = self.expander.name(),
                added = expanded.added_terms.len(),
                "expanded query"
            );

            // The expanded text is re-embedded, so a caller-supplied vector
            // for the original query is not reused.
            let mut inner = request.clone();
            inner.vector = None;
            let results = self.run_hybrid(&expanded.expanded, &inner, method).await?;

            let mut suggestions = vec![expanded.original];
            suggestions.extend(expanded.added_terms);
            Ok((results, suggestions))
        })
        .await
    }

    async fn observe<F>(
        &self,
        mode: Mode,
        method: Option<FusionMethod>,
        query: &str,
        fut: F,
    ) -> Result<SearchResponse>
    where
        F: Future<Output = Result<(SearchResults, Vec<String>)>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RagError::closed("search engine"));
        }
        let started = Instant::now();
        let outcome = fut.await;
        let elapsed = started.elapsed();

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        let latency = elapsed.as_secs_f64() * 1000.0;
        match outcome {
            Ok((results, suggestions)) => {
                stats.record(mode, method, latency, Some(results.hits.len()));
                Ok(SearchResponse {
                    query: query.to_string(),
                    results,
                    method,
                    suggestions,
                    duration_ms: elapsed.as_millis() as u64,
                })
            }
            Err(e) => {
                stats.record(mode, method, latency, None);
                Err(e)
            }
        }
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let limit = Duration::from_secs(self.config.timeout_secs.max(1));
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(RagError::service(
                "search",
                operation,
                format!("timed out after {}s", limit.as_secs()),
            )),
        }
    }

    async fn query_vector(&self, query: &str, request: &SearchRequest) -> Result<Vec<f32>> {
        if let Some(v) = &request.vector {
            return Ok(v.clone());
        }
        if query.trim().is_empty() {
            return Err(RagError::validation("search needs a query or a query vector"));
        }
        let embedder = self.storage.embedder();
        self.bounded("embed query", embedder.embed(query))
            .await
            .map_err(|e| RagError::service("embedder", "embed query", format!("{:#}", e)))
    }

    async fn run_vector(&self, request: &SearchRequest, limit: usize) -> Result<SearchResults> {
        let vector = self.query_vector(&request.query, request).await?;
        let backend = self.storage.vector_backend().await?;
        let opts = VectorSearchOptions {
            limit,
            offset: request.offset,
            threshold: Some(request.threshold.unwrap_or(self.config.default_threshold)),
            filter: request.filter.clone(),
            include_vector: request.include_vector,
        };
        let results = self
            .bounded("vector search", backend.search_vectors(&vector, &opts))
            .await?;
        Ok(self.storage.drop_deleted(results))
    }

    async fn run_keyword(&self, query: &str, request: &SearchRequest, limit: usize) -> Result<SearchResults> {
        if query.trim().is_empty() {
            return Err(RagError::validation("search query is empty"));
        }
        let backend = self.storage.keyword_backend().await?;
        let opts = KeywordSearchOptions {
            limit,
            offset: request.offset,
            fuzzy: request.fuzzy,
            highlight: request.highlight.unwrap_or(self.config.highlight),
            filter: request.filter.clone(),
            boosts: request.boosts.clone(),
        };
        let results = self
            .bounded("keyword search", backend.search(query, &opts))
            .await?;
        Ok(self.storage.drop_deleted(results))
    }

    async fn run_hybrid(&self, query: &str, request: &SearchRequest, method: FusionMethod) -> Result<SearchResults> {
        let limit = self.config.hybrid.limits.resolve(request.limit);
        let vector_request = SearchRequest {
            query: query.to_string(),
            vector: match &request.vector {
                Some(v) => Some(v.clone()),
                None => Some(self.query_vector(query, request).await?),
            },
            ..request.clone()
        };

        let (vector, keyword) = tokio::join!(
            self.run_vector(&vector_request, limit),
            self.run_keyword(query, request, limit),
        );
        let (vector, keyword) = match (vector, keyword) {
            (Ok(v), Ok(k)) => (v, k),
            (v, k) => {
                let mut failures = Vec::new();
                if let Err(e) = v {
                    failures.push(("vector".to_string(), format!("{:#}", e)));
                }
                if let Err(e) = k {
                    failures.push(("keyword".to_string(), format!("{:#}", e)));
                }
                return Err(RagError::PartialFailure { failures }.into());
            }
        };

        let hybrid = &self.config.hybrid;
        let fuser = fuser_for(
            method,
            hybrid.rrf_k,
            request.vector_weight.unwrap_or(hybrid.vector_weight),
            request.keyword_weight.unwrap_or(hybrid.keyword_weight),
        );
        let mut fused = fuser.fuse(&vector.hits, &keyword.hits);
        let total = fused.len();
        fused.truncate(limit);
        debug!(
            method = %method,
            vector_hits = vector.hits.len(),
            keyword_hits = keyword.hits.len(),
            fused = total,
            "hybrid search"
        );
        Ok(SearchResults::from_ranked(fused, total))
    }
}
