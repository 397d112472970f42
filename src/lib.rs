//! # Lodestone
//!
//! A local-first retrieval-augmented generation engine.
//!
//! Lodestone ingests documents (inline text, files, URLs), splits them
//! into chunks, embeds them, and keeps each chunk in a vector index and a
//! keyword index next to a document store. Queries run as vector, keyword,
//! or hybrid searches fused with RRF, weighted or linear scoring, with
//! optional query expansion. Answers are generated by any
//! OpenAI-compatible endpoint, alone or as a pool with a selection
//! strategy.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────────────┐
//! │ Ingestion  │──▶│   Storage    │──▶│ vector  (mem/SQLite) │
//! │ chunk+meta │   │   manager    │   │ keyword (mem/FTS5/   │
//! └────────────┘   │  (embedder)  │   │          Tantivy)    │
//!                  └──────┬───────┘   │ document(mem/SQLite) │
//! ┌────────────┐          │           └──────────────────────┘
//! │  Search    │──────────┘
//! │ fuse+expand│        ┌───────────────┐
//! └─────┬──────┘        │ Provider pool │  OpenAI-compatible HTTP
//!       ▼               └───────┬───────┘
//! ┌──────────────────────────────┴──┐
//! │ RagService: ingest / search /    │   Scheduler: cron, interval,
//! │ answer / stream_answer / close   │   one-shot and event jobs
//! └──────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use lodestone::config::Config;
//! use lodestone::ingest::IngestRequest;
//! use lodestone::search::SearchRequest;
//! use lodestone::service::RagService;
//! use lodestone_core::embedding::HashEmbedder;
//!
//! let service = RagService::new(Config::default(), Arc::new(HashEmbedder::new(384)), None)?;
//! service.ingest(IngestRequest::text("Paris is the capital of France.")).await?;
//! let hits = service.search(&SearchRequest::new("capital of France").with_limit(1)).await?;
//! assert_eq!(hits.results.hits.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Error taxonomy |
//! | [`backends`] | SQLite and Tantivy backends, backend factories |
//! | [`storage`] | Storage manager over the three backends |
//! | [`processor`] | Content-type detection and document processors |
//! | [`ingest`] | Ingestion engine |
//! | [`search`] | Vector, keyword, hybrid and expanded search |
//! | [`expansion`] | LLM query expansion and the expander factory |
//! | [`provider`] | OpenAI-compatible client and provider pool |
//! | [`prompts`] | Prompt templates |
//! | [`service`] | RAG service façade |
//! | [`scheduler`] | Job scheduler and event bus |
//! | [`logging`] | Tracing subscriber setup |

pub mod backends;
pub mod config;
pub mod db;
pub mod error;
pub mod expansion;
pub mod ingest;
pub mod logging;
pub mod processor;
pub mod prompts;
pub mod provider;
pub mod scheduler;
pub mod search;
pub mod service;
pub mod storage;
