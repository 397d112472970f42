//! The RAG service: one entry point over storage, ingestion, search,
//! generation and scheduling.
//!
//! ```text
//! RagService
//!   ├─ IngestionEngine ─┐
//!   ├─ SearchEngine ────┼─> StorageManager ─> vector / keyword / document backends
//!   ├─ LanguageModel    │       (embedder injected)
//!   ├─ PromptManager    │
//!   ├─ Scheduler        │   (optional; receives document.* events)
//!   └─ optimize loop ───┘   (optional; every service.optimize_interval_secs)
//! ```
//!
//! [`RagService::answer`] retrieves sources, composes a numbered-source
//! prompt and asks the language model; [`RagService::stream_answer`] does
//! the same while streaming the reply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use lodestone_core::embedding::{Embedder, HashEmbedder};
use lodestone_core::models::{Document, SearchHit};
use lodestone_core::store::DocumentFilter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{kind_of, RagError};
use crate::expansion::create_expander;
use crate::ingest::{BatchResponse, IngestRequest, IngestResponse, IngestionEngine, IngestionStats};
use crate::prompts::{PromptManager, RAG_ANSWER, RAG_SYSTEM};
use crate::provider::{
    ChatMessage, GenerateOptions, LanguageModel, OpenAiClient, PoolStats, ProviderPool,
    StreamCallback, StreamChunk, Usage,
};
use crate::scheduler::{Event, Scheduler};
use crate::search::{SearchEngine, SearchRequest, SearchResponse, SearchStats};
use crate::storage::{StorageManager, StorageStats};

/// Reply when no retrieved source clears the score floor.
pub const NO_CONTEXT_ANSWER: &str =
    "There is not enough relevant information in the knowledge base to answer this question.";

const OPTIMIZE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub const EVENT_DOCUMENT_INGESTED: &str = "document.ingested";
pub const EVENT_DOCUMENT_DELETED: &str = "document.deleted";

#[derive(Debug, Clone, Default)]
pub struct AnswerOptions {
    /// Sources to retrieve; `service.max_sources` when unset.
    pub max_sources: Option<usize>,
    /// Score floor for a source to be used; `service.min_score` when unset.
    pub min_score: Option<f64>,
    pub generate: GenerateOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub question: String,
    pub answer: String,
    pub sources: Vec<SearchHit>,
    /// 0 to 1.
    pub confidence: f64,
    pub average_score: f64,
    pub highest_score: f64,
    pub usage: Usage,
    pub model: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub ingestion: IngestionStats,
    pub search: SearchStats,
    pub storage: StorageStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStats>,
}

struct OptimizeLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct RagService {
    config: Config,
    storage: Arc<StorageManager>,
    ingestion: IngestionEngine,
    search: SearchEngine,
    llm: Option<Arc<dyn LanguageModel>>,
    pool: Option<Arc<ProviderPool>>,
    prompts: Arc<PromptManager>,
    scheduler: Option<Scheduler>,
    optimizer: Mutex<Option<OptimizeLoop>>,
    closed: AtomicBool,
}

impl RagService {
    /// Wire storage from `config` around an injected embedder and
    /// (optional) language model. Must run inside a Tokio runtime when the
    /// optimize loop or scheduler is enabled.
    pub fn new(
        config: Config,
        embedder: Arc<dyn Embedder>,
        llm: Option<Arc<dyn LanguageModel>>,
    ) -> Result<Self> {
        config.validate()?;
        let prompts = Arc::new(PromptManager::new(config.prompts.dir.as_deref())?);
        let storage = Arc::new(
            StorageManager::from_config(&config.storage, embedder)?
                .with_embed_batch_size(config.embedding.batch_size),
        );
        Self::from_parts(config, storage, llm, prompts)
    }

    /// Build the embedder and language model from `config` too.
    ///
    /// `[pool]` providers become the language model when the pool is
    /// enabled; `embedding.provider` picks `hash`, `openai`, or `pool`.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let prompts = Arc::new(PromptManager::new(config.prompts.dir.as_deref())?);

        let needs_pool = config.pool.enabled || config.embedding.provider == "pool";
        let pool = if needs_pool && !config.pool.providers.is_empty() {
            let pool = Arc::new(
                ProviderPool::from_config(&config.pool, &config.embedding)?
                    .with_prompts(Arc::clone(&prompts)),
            );
            pool.start_health_checks(Duration::from_secs(config.pool.health_check_interval_secs));
            Some(pool)
        } else {
            None
        };

        let embedder: Arc<dyn Embedder> = match config.embedding.provider.as_str() {
            "openai" => Arc::new(OpenAiClient::from_embedding_config(&config.embedding)?),
            "pool" => match &pool {
                Some(p) => Arc::clone(p) as Arc<dyn Embedder>,
                None => {
                    return Err(RagError::configuration(
                        "embedding.provider = \"pool\" requires [[pool.providers]]",
                    ))
                }
            },
            _ => Arc::new(HashEmbedder::new(config.storage.vector.dimensions)),
        };
        let llm: Option<Arc<dyn LanguageModel>> = match &pool {
            Some(p) if config.pool.enabled => Some(Arc::clone(p) as Arc<dyn LanguageModel>),
            _ => None,
        };

        let storage = Arc::new(
            StorageManager::from_config(&config.storage, embedder)?
                .with_embed_batch_size(config.embedding.batch_size),
        );
        let mut service = Self::from_parts(config, storage, llm, prompts)?;
        service.pool = pool;
        Ok(service)
    }

    /// Assemble a service over an existing storage manager.
    pub fn from_parts(
        config: Config,
        storage: Arc<StorageManager>,
        llm: Option<Arc<dyn LanguageModel>>,
        prompts: Arc<PromptManager>,
    ) -> Result<Self> {
        let expander = create_expander(&config.search.expansion, llm.clone(), Arc::clone(&prompts))?;
        let ingestion = IngestionEngine::new(Arc::clone(&storage), &config.ingestion);
        let search = SearchEngine::new(Arc::clone(&storage), config.search.clone()).with_expander(expander);

        let scheduler = if config.scheduler.enabled {
            let scheduler = Scheduler::new(config.scheduler.clone());
            scheduler.start()?;
            Some(scheduler)
        } else {
            None
        };

        let service = Self {
            storage,
            ingestion,
            search,
            llm,
            pool: None,
            prompts,
            scheduler,
            optimizer: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        };
        if service.config.service.optimize_interval_secs > 0 {
            service.start_optimizer(Duration::from_secs(service.config.service.optimize_interval_secs));
        }
        info!(
            vector = %service.config.storage.vector.backend,
            keyword = %service.config.storage.keyword.backend,
            document = %service.config.storage.document.backend,
            "RAG service ready"
        );
        Ok(service)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn prompts(&self) -> &Arc<PromptManager> {
        &self.prompts
    }

    /// The scheduler, when `[scheduler] enabled = true`.
    pub fn scheduler(&self) -> Option<&Scheduler> {
        self.scheduler.as_ref()
    }

    pub fn pool(&self) -> Option<&Arc<ProviderPool>> {
        self.pool.as_ref()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RagError::closed("service"));
        }
        Ok(())
    }

    fn emit(&self, name: &str, document_id: &str) {
        if let Some(s) = &self.scheduler {
            s.publish(Event::new(name, json!({ "document_id": document_id })));
        }
    }

    // ─── documents ───────────────────────────────────────────────────────

    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestResponse> {
        self.ensure_open()?;
        let response = self.ingestion.ingest_document(request).await?;
        self.emit(EVENT_DOCUMENT_INGESTED, &response.document_id);
        Ok(response)
    }

    pub async fn ingest_batch(&self, requests: Vec<IngestRequest>) -> Result<BatchResponse> {
        self.ensure_open()?;
        let response = self.ingestion.ingest_batch(requests).await;
        for r in response.results.iter().flatten() {
            self.emit(EVENT_DOCUMENT_INGESTED, &r.document_id);
        }
        Ok(response)
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        self.ensure_open()?;
        self.storage.get_document(id).await
    }

    /// Idempotent; deleting an unknown id succeeds.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        let result = self.storage.delete_document(id).await;
        let removed = match &result {
            Ok(()) => true,
            Err(e) => matches!(kind_of(e), Some(RagError::PartialFailure { .. })),
        };
        if removed {
            self.emit(EVENT_DOCUMENT_DELETED, id);
        }
        result
    }

    pub async fn list(&self, filter: &DocumentFilter) -> Result<Vec<Document>> {
        self.ensure_open()?;
        self.storage.list_documents(filter).await
    }

    // ─── search ──────────────────────────────────────────────────────────

    /// Keyword search for a text query. A request with an empty query and
    /// a vector runs vector search instead.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.ensure_open()?;
        if request.query.trim().is_empty() && request.vector.is_some() {
            return self.search.vector_search(request).await;
        }
        self.search.keyword_search(request).await
    }

    pub async fn vector_search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.ensure_open()?;
        self.search.vector_search(request).await
    }

    pub async fn hybrid_search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.ensure_open()?;
        self.search.hybrid_search(request).await
    }

    pub async fn expanded_search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.ensure_open()?;
        self.search.expanded_search(request).await
    }

    // ─── answering ───────────────────────────────────────────────────────

    fn language_model(&self) -> Result<&Arc<dyn LanguageModel>> {
        self.llm
            .as_ref()
            .ok_or_else(|| RagError::configuration("answering needs a language model"))
    }

    /// Sources above the score floor, best first.
    async fn retrieve(&self, question: &str, opts: &AnswerOptions) -> Result<Vec<SearchHit>> {
        if question.trim().is_empty() {
            return Err(RagError::validation("question is empty"));
        }
        let max_sources = opts.max_sources.unwrap_or(self.config.service.max_sources).max(1);
        let min_score = opts.min_score.unwrap_or(self.config.service.min_score);
        let request = SearchRequest::new(question).with_limit(max_sources);
        let response = self.search(&request).await?;
        let total = response.results.hits.len();
        let sources: Vec<SearchHit> = response
            .results
            .hits
            .into_iter()
            .filter(|h| h.score >= min_score)
            .collect();
        debug!(retrieved = total, used = sources.len(), min_score, "answer sources");
        Ok(sources)
    }

    fn messages(&self, question: &str, sources: &[SearchHit]) -> Result<Vec<ChatMessage>> {
        let context = sources
            .iter()
            .enumerate()
            .map(|(i, h)| format!("Source {}: {}", i + 1, h.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let system = self
            .prompts
            .get(RAG_SYSTEM)
            .ok_or_else(|| RagError::not_found(format!("prompt {}", RAG_SYSTEM)))?;
        let user = self
            .prompts
            .render(RAG_ANSWER, &[("context", &context), ("question", question)])?;
        Ok(vec![ChatMessage::system(system), ChatMessage::user(user)])
    }

    fn no_context(question: &str, started: Instant) -> Answer {
        Answer {
            question: question.to_string(),
            answer: NO_CONTEXT_ANSWER.to_string(),
            sources: Vec::new(),
            confidence: 0.0,
            average_score: 0.0,
            highest_score: 0.0,
            usage: Usage::default(),
            model: String::new(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn finish(
        question: &str,
        answer: String,
        sources: Vec<SearchHit>,
        usage: Usage,
        model: String,
        started: Instant,
    ) -> Answer {
        let scores: Vec<f64> = sources.iter().map(|h| h.score).collect();
        let average_score = scores.iter().sum::<f64>() / scores.len().max(1) as f64;
        let highest_score = scores.iter().copied().fold(0.0, f64::max);
        Answer {
            question: question.to_string(),
            answer,
            confidence: confidence(&scores),
            average_score,
            highest_score,
            sources,
            usage,
            model,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Answer `question` from retrieved sources. Generation failures are
    /// returned as errors.
    pub async fn answer(&self, question: &str, opts: &AnswerOptions) -> Result<Answer> {
        self.ensure_open()?;
        let started = Instant::now();
        let sources = self.retrieve(question, opts).await?;
        if sources.is_empty() {
            return Ok(Self::no_context(question, started));
        }
        let llm = self.language_model()?;
        let messages = self.messages(question, &sources)?;
        let generation = llm.generate(&messages, &opts.generate).await?;
        info!(
            sources = sources.len(),
            tokens = generation.usage.total_tokens,
            "answered question"
        );
        Ok(Self::finish(
            question,
            generation.content,
            sources,
            generation.usage,
            generation.model,
            started,
        ))
    }

    /// Like [`answer`](Self::answer), streaming the reply through
    /// `on_chunk`. The last chunk has `done` set and carries usage and the
    /// total duration.
    pub async fn stream_answer(
        &self,
        question: &str,
        opts: &AnswerOptions,
        on_chunk: StreamCallback<'_>,
    ) -> Result<Answer> {
        self.ensure_open()?;
        let started = Instant::now();
        let sources = self.retrieve(question, opts).await?;
        if sources.is_empty() {
            let answer = Self::no_context(question, started);
            on_chunk(StreamChunk {
                content: answer.answer.clone(),
                ..Default::default()
            });
            on_chunk(StreamChunk {
                done: true,
                usage: Some(Usage::default()),
                duration_ms: Some(started.elapsed().as_millis() as u64),
                ..Default::default()
            });
            return Ok(answer);
        }

        let llm = self.language_model()?;
        let messages = self.messages(question, &sources)?;
        let generation = {
            let mut forward = |chunk: StreamChunk| {
                if !chunk.done {
                    on_chunk(chunk);
                }
            };
            llm.stream(&messages, &opts.generate, &mut forward).await?
        };
        on_chunk(StreamChunk {
            done: true,
            tool_calls: generation.tool_calls.clone(),
            usage: Some(generation.usage),
            duration_ms: Some(started.elapsed().as_millis() as u64),
            ..Default::default()
        });
        Ok(Self::finish(
            question,
            generation.content,
            sources,
            generation.usage,
            generation.model,
            started,
        ))
    }

    // ─── maintenance ─────────────────────────────────────────────────────

    pub async fn optimize(&self) -> Result<()> {
        self.ensure_open()?;
        self.storage.optimize().await
    }

    /// Remove every document from every backend.
    pub async fn reset(&self) -> Result<()> {
        self.ensure_open()?;
        self.storage.reset().await
    }

    pub async fn health(&self) -> Result<()> {
        self.ensure_open()?;
        self.storage.health().await
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        self.ensure_open()?;
        Ok(ServiceStats {
            ingestion: self.ingestion.stats(),
            search: self.search.stats(),
            storage: self.storage.get_stats().await?,
            pool: self.pool.as_ref().map(|p| p.stats()),
        })
    }

    fn start_optimizer(&self, interval: Duration) {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let storage = Arc::clone(&self.storage);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        match tokio::time::timeout(OPTIMIZE_TIMEOUT, storage.optimize()).await {
                            Ok(Ok(())) => debug!("background optimize finished"),
                            Ok(Err(e)) => warn!(error = %format!("{:#}", e), "background optimize failed"),
                            Err(_) => warn!(timeout_secs = OPTIMIZE_TIMEOUT.as_secs(), "background optimize timed out"),
                        }
                    }
                }
            }
        });
        *self.optimizer.lock().unwrap_or_else(|e| e.into_inner()) = Some(OptimizeLoop { shutdown, handle });
    }

    /// Stop background work and close every component. Every later call
    /// fails with `RagError::Closed`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let optimizer = self.optimizer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(running) = optimizer {
            let _ = running.shutdown.send(true);
            let _ = running.handle.await;
        }
        if let Some(s) = &self.scheduler {
            s.stop().await;
        }
        self.search.close();
        if let Some(p) = &self.pool {
            p.close().await;
        }
        let result = self.storage.close().await;
        info!("RAG service closed");
        result
    }
}

/// Mean source score, boosted by 1.2 for three or more strong sources and
/// damped by 0.7 when weak, kept within 0..=1.
pub fn confidence(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let avg = scores.iter().sum::<f64>() / scores.len() as f64;
    let adjusted = if scores.len() >= 3 && avg >= 0.5 {
        avg * 1.2
    } else if avg < 0.3 {
        avg * 0.7
    } else {
        avg
    };
    adjusted.clamp(0.0, 1.0)
}
