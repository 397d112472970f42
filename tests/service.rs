use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use lodestone::config::Config;
use lodestone::error::{kind_of, RagError};
use lodestone::ingest::IngestRequest;
use lodestone::prompts::PromptManager;
use lodestone::provider::{
    ChatMessage, GenerateOptions, Generation, LanguageModel, StreamCallback, StreamChunk,
    ToolDefinition, Usage,
};
use lodestone::scheduler::{handler_fn, JobSpec, Schedule};
use lodestone::search::SearchRequest;
use lodestone::service::{AnswerOptions, RagService, NO_CONTEXT_ANSWER};
use lodestone::storage::StorageManager;
use lodestone_core::embedding::HashEmbedder;
use lodestone_core::models::{KeywordChunk, SearchResults};
use lodestone_core::store::memory::{
    MemoryDocumentBackend, MemoryKeywordBackend, MemoryVectorBackend,
};
use lodestone_core::store::{BackendStats, DocumentFilter, KeywordBackend, KeywordSearchOptions};
use serde_json::Value;

const DIMS: usize = 384;

/// Replies with a fixed answer and records the prompts it was given.
#[derive(Default)]
struct FakeLlm {
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl FakeLlm {
    fn reply() -> Generation {
        Generation {
            content: "Paris.".into(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 2,
                total_tokens: 12,
            },
            model: "fake-1".into(),
            finish_reason: Some("stop".into()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl LanguageModel for FakeLlm {
    fn name(&self) -> &str {
        "fake"
    }

    async fn generate(&self, messages: &[ChatMessage], _opts: &GenerateOptions) -> Result<Generation> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        Ok(Self::reply())
    }

    async fn generate_with_tools(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        opts: &GenerateOptions,
    ) -> Result<Generation> {
        self.generate(messages, opts).await
    }

    async fn generate_structured(
        &self,
        _messages: &[ChatMessage],
        _schema_name: &str,
        _schema: &Value,
        _opts: &GenerateOptions,
    ) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        _opts: &GenerateOptions,
        on_chunk: StreamCallback<'_>,
    ) -> Result<Generation> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        for piece in ["Par", "is."] {
            on_chunk(StreamChunk {
                content: piece.into(),
                ..Default::default()
            });
        }
        let reply = Self::reply();
        on_chunk(StreamChunk {
            done: true,
            usage: Some(reply.usage),
            duration_ms: Some(1),
            ..Default::default()
        });
        Ok(reply)
    }

    async fn stream_with_tools(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        opts: &GenerateOptions,
        on_chunk: StreamCallback<'_>,
    ) -> Result<Generation> {
        self.stream(messages, opts, on_chunk).await
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

fn config() -> Config {
    Config::from_toml_str("").unwrap()
}

fn service_with(config: Config) -> (RagService, Arc<FakeLlm>) {
    let llm = Arc::new(FakeLlm::default());
    let service = RagService::new(
        config,
        Arc::new(HashEmbedder::new(DIMS)),
        Some(llm.clone() as Arc<dyn LanguageModel>),
    )
    .unwrap();
    (service, llm)
}

fn service() -> (RagService, Arc<FakeLlm>) {
    service_with(config())
}

#[tokio::test]
async fn test_ingest_then_search_round_trip() {
    let (service, _) = service();
    service
        .ingest(
            IngestRequest::text("Paris is the capital of France.")
                .with_content_type("text/plain"),
        )
        .await
        .unwrap();

    let response = service
        .search(&SearchRequest::new("capital of France").with_limit(1))
        .await
        .unwrap();
    assert_eq!(response.results.hits.len(), 1);
    let hit = &response.results.hits[0];
    assert!(hit.content.contains("capital of France"));
    assert!(hit.score > 0.0);
}

#[tokio::test]
async fn test_ingested_text_is_searchable() {
    let (service, _) = service();
    let text = "Lighthouses guide ships along rocky coastlines at night.";
    service.ingest(IngestRequest::text(text)).await.unwrap();
    let response = service.search(&SearchRequest::new(text)).await.unwrap();
    assert!(response.results.hits.iter().any(|h| h.content.contains(text)));
}

#[tokio::test]
async fn test_backends_agree_on_chunk_counts() {
    let mut config = config();
    config.ingestion.chunking.chunk_size = 120;
    config.ingestion.chunking.overlap = 10;
    let (service, _) = service_with(config);

    let paragraph = "Rivers carve valleys over thousands of years. ";
    let text = paragraph.repeat(12);
    service
        .ingest(IngestRequest::text(text).with_id("rivers"))
        .await
        .unwrap();
    service
        .ingest(IngestRequest::text("A short note about tides.").with_id("tides"))
        .await
        .unwrap();

    let vector = service.storage().vector_backend().await.unwrap();
    let keyword = service.storage().keyword_backend().await.unwrap();
    let docs = service.list(&DocumentFilter::default()).await.unwrap();
    assert_eq!(docs.len(), 2);
    for doc in &docs {
        let vectors = vector.get_document_vectors(&doc.id).await.unwrap();
        let indexed = keyword.get_document_content(&doc.id).await.unwrap();
        assert_eq!(vectors.len() as i64, doc.chunk_count, "{}", doc.id);
        assert_eq!(indexed.len() as i64, doc.chunk_count, "{}", doc.id);
    }
    let rivers = docs.iter().find(|d| d.id == "rivers").unwrap();
    assert!(rivers.chunk_count > 1);

    service.delete("rivers").await.unwrap();
    assert!(vector.get_document_vectors("rivers").await.unwrap().is_empty());
    assert!(keyword.get_document_content("rivers").await.unwrap().is_empty());
    // idempotent
    service.delete("rivers").await.unwrap();
    assert!(service.get_document("rivers").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reset_empties_everything() {
    let (service, _) = service();
    for (id, text) in [("a", "alpha particles and decay"), ("b", "beta testing software")] {
        service.ingest(IngestRequest::text(text).with_id(id)).await.unwrap();
    }
    service.reset().await.unwrap();

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.storage.total_documents, 0);
    for query in ["alpha", "beta testing"] {
        let response = service.search(&SearchRequest::new(query)).await.unwrap();
        assert!(response.results.hits.is_empty());
    }

    service.ingest(IngestRequest::text("alpha again")).await.unwrap();
    let response = service.search(&SearchRequest::new("alpha")).await.unwrap();
    assert_eq!(response.results.hits.len(), 1);
}

/// Memory keyword backend whose deletes fail a set number of times.
struct FlakyDeletes {
    inner: MemoryKeywordBackend,
    failures_left: AtomicU32,
}

#[async_trait]
impl KeywordBackend for FlakyDeletes {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn index_chunks(&self, document_id: &str, chunks: &[KeywordChunk]) -> Result<()> {
        self.inner.index_chunks(document_id, chunks).await
    }

    async fn search(&self, query: &str, opts: &KeywordSearchOptions) -> Result<SearchResults> {
        self.inner.search(query, opts).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("index is locked");
        }
        self.inner.delete_document(document_id).await
    }

    async fn get_document_content(&self, document_id: &str) -> Result<Vec<KeywordChunk>> {
        self.inner.get_document_content(document_id).await
    }

    async fn stats(&self) -> Result<BackendStats> {
        self.inner.stats().await
    }

    async fn optimize(&self) -> Result<()> {
        self.inner.optimize().await
    }

    async fn reset(&self) -> Result<()> {
        self.inner.reset().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

fn flaky_service(failures: u32) -> (RagService, Arc<StorageManager>) {
    flaky_service_with(config(), failures)
}

fn flaky_service_with(config: Config, failures: u32) -> (RagService, Arc<StorageManager>) {
    let storage = Arc::new(StorageManager::new(
        Arc::new(MemoryVectorBackend::new(DIMS, Default::default())),
        Arc::new(FlakyDeletes {
            inner: MemoryKeywordBackend::new(),
            failures_left: AtomicU32::new(failures),
        }),
        Arc::new(MemoryDocumentBackend::new()),
        Arc::new(HashEmbedder::new(DIMS)),
    ));
    let service = RagService::from_parts(
        config,
        Arc::clone(&storage),
        None,
        Arc::new(PromptManager::default()),
    )
    .unwrap();
    (service, storage)
}

const GLACIERS: &str = "Glaciers store most of the fresh water on Earth.";

fn assert_keyword_branch_failed(err: &anyhow::Error) {
    match kind_of(err) {
        Some(e @ RagError::PartialFailure { .. }) => assert_eq!(e.failed_branches(), vec!["keyword"]),
        other => panic!("expected partial failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_partial_delete_failure_still_removes_document() {
    let (service, storage) = flaky_service(1);
    service
        .ingest(IngestRequest::text(GLACIERS).with_id("ice"))
        .await
        .unwrap();

    let err = service.delete("ice").await.unwrap_err();
    assert_keyword_branch_failed(&err);

    let docs = service.list(&DocumentFilter::default()).await.unwrap();
    assert!(docs.is_empty());
    let response = service.search(&SearchRequest::new("glaciers")).await.unwrap();
    assert!(response.results.hits.is_empty());
    // the retry reached the keyword index
    assert!(storage.tombstoned().is_empty());
}

#[tokio::test]
async fn test_stuck_keyword_delete_hides_leftover_chunks() {
    let (service, storage) = flaky_service(u32::MAX);
    service
        .ingest(IngestRequest::text(GLACIERS).with_id("ice"))
        .await
        .unwrap();
    service
        .ingest(IngestRequest::text("Deserts receive very little rain.").with_id("sand"))
        .await
        .unwrap();

    let err = service.delete("ice").await.unwrap_err();
    assert_keyword_branch_failed(&err);
    assert_eq!(storage.tombstoned(), vec!["ice".to_string()]);

    // the chunks are still in the keyword index
    let leftover = storage
        .keyword_backend()
        .await
        .unwrap()
        .get_document_content("ice")
        .await
        .unwrap();
    assert!(!leftover.is_empty());

    let docs = service.list(&DocumentFilter::default()).await.unwrap();
    assert_eq!(docs.len(), 1);
    let keyword = service.search(&SearchRequest::new("glaciers")).await.unwrap();
    assert!(keyword.results.hits.is_empty());
    let hybrid = service
        .hybrid_search(&SearchRequest::new("glaciers fresh water"))
        .await
        .unwrap();
    assert!(hybrid.results.hits.iter().all(|h| h.document_id != "ice"));
    let deserts = service.search(&SearchRequest::new("deserts")).await.unwrap();
    assert_eq!(deserts.results.hits[0].document_id, "sand");

    // storing the id again lifts the tombstone
    service
        .ingest(IngestRequest::text(GLACIERS).with_id("ice"))
        .await
        .unwrap();
    assert!(storage.tombstoned().is_empty());
    let again = service.search(&SearchRequest::new("glaciers")).await.unwrap();
    assert_eq!(again.results.hits[0].document_id, "ice");
}

#[tokio::test]
async fn test_answer_without_relevant_sources() {
    let (service, llm) = service();
    service
        .ingest(IngestRequest::text("Sourdough bread needs a lively starter."))
        .await
        .unwrap();

    let answer = service
        .answer(
            "quantum gravity",
            &AnswerOptions {
                min_score: Some(0.9),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(answer.sources.is_empty());
    assert_eq!(answer.confidence, 0.0);
    assert_eq!(answer.answer, NO_CONTEXT_ANSWER);
    assert!(answer.answer.contains("not enough relevant information"));
    assert!(llm.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_answer_composes_numbered_sources() {
    let (service, llm) = service();
    service
        .ingest(IngestRequest::text("Paris is the capital of France.").with_id("paris"))
        .await
        .unwrap();
    service
        .ingest(IngestRequest::text("Berlin is the capital of Germany.").with_id("berlin"))
        .await
        .unwrap();

    let answer = service
        .answer(
            "capital of France",
            &AnswerOptions {
                min_score: Some(0.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(answer.answer, "Paris.");
    assert_eq!(answer.model, "fake-1");
    assert_eq!(answer.usage.total_tokens, 12);
    assert!(!answer.sources.is_empty());
    assert_eq!(answer.sources[0].document_id, "paris");
    assert!(answer.highest_score >= answer.average_score);
    assert!((0.0..=1.0).contains(&answer.confidence));

    let prompts = llm.prompts.lock().unwrap();
    let messages = &prompts[0];
    assert_eq!(messages.len(), 2);
    assert!(messages[0].content.contains("Do not show your reasoning"));
    let user = &messages[1].content;
    assert!(user.starts_with("Source 1: Paris is the capital of France."));
    assert!(user.ends_with("Question: capital of France\n\nAnswer based on the provided context:"));
}

#[tokio::test]
async fn test_stream_answer_forwards_chunks_then_finishes() {
    let (service, _) = service();
    service
        .ingest(IngestRequest::text("Paris is the capital of France."))
        .await
        .unwrap();

    let mut chunks: Vec<StreamChunk> = Vec::new();
    let mut collect = |c: StreamChunk| chunks.push(c);
    let answer = service
        .stream_answer(
            "capital of France",
            &AnswerOptions {
                min_score: Some(0.0),
                ..Default::default()
            },
            &mut collect,
        )
        .await
        .unwrap();
    assert_eq!(answer.answer, "Paris.");

    let text: String = chunks.iter().filter(|c| !c.done).map(|c| c.content.as_str()).collect();
    assert_eq!(text, "Paris.");
    assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
    let last = chunks.last().unwrap();
    assert!(last.done);
    assert_eq!(last.usage.map(|u| u.total_tokens), Some(12));
    assert!(last.duration_ms.is_some());
}

#[tokio::test]
async fn test_closed_service_rejects_calls() {
    let (service, _) = service();
    service.ingest(IngestRequest::text("before close")).await.unwrap();
    service.close().await.unwrap();
    // closing twice is fine
    service.close().await.unwrap();

    let err = service.ingest(IngestRequest::text("after close")).await.unwrap_err();
    assert!(matches!(kind_of(&err), Some(RagError::Closed(_))));
    assert_eq!(err.to_string(), "service is closed");
    assert!(service.search(&SearchRequest::new("before")).await.is_err());
    assert!(service.answer("anything", &AnswerOptions::default()).await.is_err());
    assert!(service.stats().await.is_err());
}

#[tokio::test]
async fn test_stats_cover_every_component() {
    let (service, _) = service();
    service.ingest(IngestRequest::text("counting documents")).await.unwrap();
    service.search(&SearchRequest::new("counting")).await.unwrap();
    service
        .hybrid_search(&SearchRequest::new("documents"))
        .await
        .unwrap();

    let stats = service.stats().await.unwrap();
    assert_eq!(stats.ingestion.documents_processed, 1);
    assert_eq!(stats.search.total_queries, 2);
    assert_eq!(stats.search.keyword_queries, 1);
    assert_eq!(stats.search.hybrid_queries, 1);
    assert_eq!(stats.storage.total_documents, 1);
    assert!(stats.pool.is_none());
}

#[tokio::test]
async fn test_ingest_publishes_scheduler_events() {
    let mut config = config();
    config.scheduler.enabled = true;
    let (service, _) = service_with(config);
    let scheduler = service.scheduler().unwrap();

    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&seen);
    let job = scheduler
        .add_job(
            JobSpec::new("reindex", Schedule::Event("document.ingested".into())),
            handler_fn(move |ctx| {
                let sink = Arc::clone(&sink);
                async move {
                    let event = ctx.event.expect("event job");
                    sink.lock()
                        .unwrap()
                        .push(event.payload["document_id"].as_str().unwrap_or("").to_string());
                    Ok::<(), anyhow::Error>(())
                }
            }),
        )
        .unwrap();

    service
        .ingest(IngestRequest::text("event driven").with_id("evt"))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduler.get_job(&job).unwrap().run_count == 0 {
        assert!(Instant::now() < deadline, "event job never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen.lock().unwrap().as_slice(), ["evt"]);
    service.close().await.unwrap();
    assert!(!scheduler.is_running());
}

#[tokio::test]
async fn test_delete_event_only_when_something_was_removed() {
    let mut config = config();
    config.scheduler.enabled = true;
    let (service, storage) = flaky_service_with(config, u32::MAX);
    let scheduler = service.scheduler().unwrap();

    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&seen);
    let job = scheduler
        .add_job(
            JobSpec::new("forget", Schedule::Event("document.deleted".into())),
            handler_fn(move |ctx| {
                let sink = Arc::clone(&sink);
                async move {
                    let event = ctx.event.expect("event job");
                    sink.lock()
                        .unwrap()
                        .push(event.payload["document_id"].as_str().unwrap_or("").to_string());
                    Ok::<(), anyhow::Error>(())
                }
            }),
        )
        .unwrap();

    service
        .ingest(IngestRequest::text(GLACIERS).with_id("ice"))
        .await
        .unwrap();
    let err = service.delete("ice").await.unwrap_err();
    assert_keyword_branch_failed(&err);

    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduler.get_job(&job).unwrap().run_count == 0 {
        assert!(Instant::now() < deadline, "event job never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // nothing can be removed once the storage is gone
    storage.close().await.unwrap();
    let err = service.delete("other").await.unwrap_err();
    assert!(matches!(kind_of(&err), Some(RagError::Closed(_))));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(scheduler.get_job(&job).unwrap().run_count, 1);
    assert_eq!(seen.lock().unwrap().as_slice(), ["ice"]);
    service.close().await.unwrap();
}
