//! Provider pool.
//!
//! Multiplexes requests across OpenAI-compatible endpoints. Each provider
//! carries a capability tier (1–5), an optional in-flight cap, an
//! active-request counter and a health flag.
//!
//! The **healthy set** is every provider whose flag is set and whose
//! active count is below its cap (no cap when `max_concurrency <= 0`).
//! Selection picks from the healthy set by [`Strategy`]:
//!
//! | Strategy | Pick |
//! |----------|------|
//! | `round_robin` | shared counter modulo healthy-set size |
//! | `random` | uniform |
//! | `least_load` | fewest active requests (first on ties) |
//! | `capability` | highest tier ≥ minimum, then least load |
//! | `failover` | first in declaration order |
//!
//! A selection returns a [`Lease`] that holds one active request until it
//! is dropped or passed to [`ProviderPool::release`]. Pool-level
//! pass-throughs lease a provider for exactly the duration of the call.
//!
//! The optional health loop probes idle providers every interval and
//! flips their flags; providers with work in flight count as healthy.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lodestone_core::embedding::Embedder;
use lodestone_core::highlight::query_terms;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    parse_json_reply, ChatMessage, ExtractedMetadata, GenerateOptions, Generation, Intent,
    LanguageModel, OpenAiClient, StreamCallback, ToolDefinition,
};
use crate::config::{EmbeddingConfig, PoolConfig};
use crate::error::RagError;
use crate::prompts::{PromptManager, INTENT_RECOGNIZE, METADATA_EXTRACT};

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const METADATA_INPUT_CHARS: usize = 4000;
const FALLBACK_SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
    LeastLoad,
    Capability,
    Failover,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::Random => "random",
            Strategy::LeastLoad => "least_load",
            Strategy::Capability => "capability",
            Strategy::Failover => "failover",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round_robin" => Ok(Strategy::RoundRobin),
            "random" => Ok(Strategy::Random),
            "least_load" => Ok(Strategy::LeastLoad),
            "capability" => Ok(Strategy::Capability),
            "failover" => Ok(Strategy::Failover),
            other => bail!(
                "Unknown pool strategy: '{}'. Use round_robin, random, least_load, capability, or failover.",
                other
            ),
        }
    }
}

/// A provider to place in a pool.
pub struct PoolMember {
    pub name: String,
    pub model: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn Embedder>,
    pub capability: u8,
    pub max_concurrency: i64,
}

impl PoolMember {
    /// A member backed by one object serving both generation and embedding.
    pub fn new<C>(client: Arc<C>, capability: u8, max_concurrency: i64) -> Self
    where
        C: LanguageModel + Embedder + 'static,
    {
        Self {
            name: LanguageModel::name(client.as_ref()).to_string(),
            model: client.clone(),
            embedder: client,
            capability,
            max_concurrency,
        }
    }
}

struct Provider {
    name: String,
    model: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    capability: u8,
    max_concurrency: i64,
    active: AtomicI64,
    healthy: AtomicBool,
    last_check: Mutex<Option<DateTime<Utc>>>,
}

impl Provider {
    fn active(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    fn is_available(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
            && (self.max_concurrency <= 0 || self.active() < self.max_concurrency)
    }

    /// Take one request slot unless the cap was reached concurrently.
    fn try_acquire(&self) -> bool {
        let cap = self.max_concurrency;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (cap <= 0 || n < cap).then_some(n + 1)
            })
            .is_ok()
    }
}

/// One leased provider; holds an active request until dropped.
pub struct Lease {
    provider: Arc<Provider>,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.provider.name
    }

    pub fn capability(&self) -> u8 {
        self.provider.capability
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.provider.model
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.provider.embedder
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.provider.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("provider", &self.provider.name).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: String,
    pub healthy: bool,
    pub active_requests: i64,
    pub capability: u8,
    pub max_concurrency: i64,
    pub last_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub strategy: Strategy,
    pub healthy: usize,
    pub providers: Vec<ProviderStatus>,
}

struct PoolState {
    providers: Vec<Arc<Provider>>,
    closed: bool,
}

struct HealthLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ProviderPool {
    strategy: Strategy,
    state: RwLock<PoolState>,
    cursor: AtomicUsize,
    dimensions: usize,
    prompts: Arc<PromptManager>,
    health_loop: Mutex<Option<HealthLoop>>,
}

impl ProviderPool {
    pub fn new(strategy: Strategy, members: Vec<PoolMember>) -> Result<Self> {
        if members.is_empty() {
            return Err(RagError::configuration("provider pool has no providers"));
        }
        let dimensions = members[0].embedder.dimensions();
        let providers = members
            .into_iter()
            .map(|m| {
                Arc::new(Provider {
                    name: m.name,
                    model: m.model,
                    embedder: m.embedder,
                    capability: m.capability,
                    max_concurrency: m.max_concurrency,
                    active: AtomicI64::new(0),
                    healthy: AtomicBool::new(true),
                    last_check: Mutex::new(None),
                })
            })
            .collect();
        Ok(Self {
            strategy,
            state: RwLock::new(PoolState {
                providers,
                closed: false,
            }),
            cursor: AtomicUsize::new(0),
            dimensions,
            prompts: Arc::new(PromptManager::default()),
            health_loop: Mutex::new(None),
        })
    }

    /// One [`OpenAiClient`] per `[[pool.providers]]` entry.
    pub fn from_config(pool: &PoolConfig, embedding: &EmbeddingConfig) -> Result<Self> {
        let strategy: Strategy = pool
            .strategy
            .parse()
            .map_err(|e| RagError::configuration(format!("{}", e)))?;
        let members = pool
            .providers
            .iter()
            .map(|p| {
                let client = Arc::new(OpenAiClient::from_provider(p, embedding)?);
                Ok(PoolMember::new(client, p.capability, p.max_concurrency))
            })
            .collect::<Result<Vec<_>>>()?;
        info!(
            providers = members.len(),
            strategy = %strategy,
            "provider pool configured"
        );
        Ok(Self::new(strategy, members)?.with_dimensions(embedding.dimensions))
    }

    pub fn with_prompts(mut self, prompts: Arc<PromptManager>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    fn providers(&self) -> Result<Vec<Arc<Provider>>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(RagError::closed("provider pool"));
        }
        Ok(state.providers.clone())
    }

    fn no_provider(what: &str) -> anyhow::Error {
        RagError::Transient(format!("no healthy provider available{}", what)).into()
    }

    /// Select by the pool strategy.
    pub fn get(&self) -> Result<Lease> {
        self.select(self.strategy, 1)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Lease> {
        let providers = self.providers()?;
        let provider = providers
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| RagError::not_found(format!("provider {}", name)))?;
        if !provider.is_available() || !provider.try_acquire() {
            return Err(Self::no_provider(&format!(" named {}", name)));
        }
        Ok(Lease {
            provider: Arc::clone(provider),
        })
    }

    /// Highest-tier healthy provider with `capability >= min_level`.
    pub fn get_by_capability(&self, min_level: u8) -> Result<Lease> {
        self.select(Strategy::Capability, min_level)
    }

    /// Return a lease's request slot.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    fn select(&self, strategy: Strategy, min_level: u8) -> Result<Lease> {
        let providers = self.providers()?;
        // A pick can lose a race for the last slot; retry on the new healthy set.
        for _ in 0..=providers.len() {
            let healthy: Vec<&Arc<Provider>> =
                providers.iter().filter(|p| p.is_available()).collect();
            let candidate = match strategy {
                Strategy::RoundRobin => {
                    if healthy.is_empty() {
                        None
                    } else {
                        let i = self.cursor.fetch_add(1, Ordering::SeqCst) % healthy.len();
                        Some(healthy[i])
                    }
                }
                Strategy::Random => {
                    if healthy.is_empty() {
                        None
                    } else {
                        Some(healthy[rand::thread_rng().gen_range(0..healthy.len())])
                    }
                }
                Strategy::LeastLoad => least_loaded(healthy.iter().copied()),
                Strategy::Capability => {
                    let eligible = healthy.iter().filter(|p| p.capability >= min_level);
                    let top = eligible.clone().map(|p| p.capability).max();
                    top.and_then(|tier| {
                        least_loaded(eligible.filter(|p| p.capability == tier).copied())
                    })
                }
                Strategy::Failover => healthy.first().copied(),
            };
            let Some(provider) = candidate else {
                break;
            };
            if provider.try_acquire() {
                debug!(provider = %provider.name, strategy = %strategy, "selected provider");
                return Ok(Lease {
                    provider: Arc::clone(provider),
                });
            }
        }
        if strategy == Strategy::Capability {
            return Err(Self::no_provider(&format!(" with capability >= {}", min_level)));
        }
        Err(Self::no_provider(""))
    }

    /// Probe every idle provider once and update health flags.
    pub async fn check_health(&self) -> Result<()> {
        let providers = self.providers()?;
        for provider in providers {
            let now = Utc::now();
            let healthy = if provider.active() > 0 {
                true
            } else {
                match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, provider.model.health()).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        debug!(provider = %provider.name, error = %e, "health probe failed");
                        false
                    }
                    Err(_) => false,
                }
            };

            self.record_health(&provider, healthy, now);
        }
        Ok(())
    }

    fn record_health(&self, provider: &Provider, healthy: bool, at: DateTime<Utc>) {
        let _state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let was = provider.healthy.swap(healthy, Ordering::SeqCst);
        *provider.last_check.lock().unwrap_or_else(|e| e.into_inner()) = Some(at);
        if was && !healthy {
            warn!(provider = %provider.name, "provider marked unhealthy");
        } else if !was && healthy {
            info!(provider = %provider.name, "provider recovered");
        }
    }

    /// Start the background health loop. Replaces a running loop.
    pub fn start_health_checks(self: &Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let pool = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        if let Err(e) = pool.check_health().await {
                            debug!(error = %e, "health loop stopping");
                            break;
                        }
                    }
                }
            }
        });
        let previous = self
            .health_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(HealthLoop { shutdown, handle });
        if let Some(prev) = previous {
            let _ = prev.shutdown.send(true);
            prev.handle.abort();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let providers: Vec<ProviderStatus> = state
            .providers
            .iter()
            .map(|p| ProviderStatus {
                name: p.name.clone(),
                healthy: p.healthy.load(Ordering::SeqCst),
                active_requests: p.active(),
                capability: p.capability,
                max_concurrency: p.max_concurrency,
                last_check: *p.last_check.lock().unwrap_or_else(|e| e.into_inner()),
            })
            .collect();
        PoolStats {
            strategy: self.strategy,
            healthy: state.providers.iter().filter(|p| p.is_available()).count(),
            providers,
        }
    }

    /// Stop the health loop; every later selection fails with a closed error.
    pub async fn close(&self) {
        let running = self
            .health_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            let _ = running.handle.await;
        }
        self.state.write().unwrap_or_else(|e| e.into_inner()).closed = true;
        info!("provider pool closed");
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let lease = self.get()?;
        lease.embedder().embed(text).await
    }

    pub async fn embed_multiple(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let lease = self.get()?;
        lease.embedder().embed_batch(texts).await
    }

    /// LLM-extracted document metadata. An unparseable reply yields a
    /// truncated-content summary with no keywords.
    pub async fn extract_metadata(&self, content: &str) -> Result<ExtractedMetadata> {
        let input: String = content.chars().take(METADATA_INPUT_CHARS).collect();
        let prompt = self.prompts.render(METADATA_EXTRACT, &[("content", &input)])?;
        let generation = self
            .generate(&[ChatMessage::user(prompt)], &GenerateOptions::default())
            .await?;
        match parse_json_reply::<ExtractedMetadata>(&generation.content) {
            Some(meta) => Ok(meta),
            None => {
                debug!("metadata reply was not JSON; using fallback summary");
                Ok(ExtractedMetadata {
                    summary: truncate_summary(content),
                    ..Default::default()
                })
            }
        }
    }

    /// LLM-classified query intent. An unparseable reply yields a `search`
    /// intent over the query's terms.
    pub async fn recognize_intent(&self, query: &str) -> Result<Intent> {
        let prompt = self.prompts.render(INTENT_RECOGNIZE, &[("query", query)])?;
        let generation = self
            .generate(&[ChatMessage::user(prompt)], &GenerateOptions::default())
            .await?;
        Ok(parse_json_reply::<Intent>(&generation.content).unwrap_or_else(|| Intent {
            intent: "search".to_string(),
            confidence: 0.0,
            entities: Vec::new(),
            keywords: query_terms(query),
        }))
    }
}

fn least_loaded<'a>(providers: impl Iterator<Item = &'a Arc<Provider>>) -> Option<&'a Arc<Provider>> {
    let mut best: Option<&Arc<Provider>> = None;
    for p in providers {
        if best.map_or(true, |b| p.active() < b.active()) {
            best = Some(p);
        }
    }
    best
}

fn truncate_summary(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= FALLBACK_SUMMARY_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(FALLBACK_SUMMARY_CHARS).collect();
    out.push_str("...");
    out
}

#[async_trait]
impl LanguageModel for ProviderPool {
    fn name(&self) -> &str {
        "pool"
    }

    async fn generate(&self, messages: &[ChatMessage], opts: &GenerateOptions) -> Result<Generation> {
        let lease = self.get()?;
        lease.model().generate(messages, opts).await
    }

    async fn generate_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
    ) -> Result<Generation> {
        let lease = self.get()?;
        lease.model().generate_with_tools(messages, tools, opts).await
    }

    async fn generate_structured(
        &self,
        messages: &[ChatMessage],
        schema_name: &str,
        schema: &Value,
        opts: &GenerateOptions,
    ) -> Result<Value> {
        let lease = self.get()?;
        lease
            .model()
            .generate_structured(messages, schema_name, schema, opts)
            .await
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
        on_chunk: StreamCallback<'_>,
    ) -> Result<Generation> {
        let lease = self.get()?;
        lease.model().stream(messages, opts, on_chunk).await
    }

    async fn stream_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
        on_chunk: StreamCallback<'_>,
    ) -> Result<Generation> {
        let lease = self.get()?;
        lease
            .model()
            .stream_with_tools(messages, tools, opts, on_chunk)
            .await
    }

    /// Healthy when at least one provider passes its probe.
    async fn health(&self) -> Result<()> {
        self.check_health().await?;
        if self.stats().healthy == 0 {
            return Err(Self::no_provider(""));
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for ProviderPool {
    fn model_name(&self) -> &str {
        "pool"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_multiple(texts).await
    }
}
