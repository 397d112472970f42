//! Tantivy keyword backend.
//!
//! One tantivy document per chunk. `chunk_id` and `document_id` are raw
//! `STRING` fields so document-scoped deletes are a single term delete;
//! `title` and `content` are tokenized (with the `en_stem` analyzer when
//! stemming is on). User metadata is stored as JSON and filtered after
//! retrieval.
//!
//! Tantivy is synchronous, so every operation runs on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use lodestone_core::highlight::{excerpts, query_terms, EXCERPT_CHARS};
use lodestone_core::models::{
    decode_metadata, encode_metadata, matches_filter, HitSource, KeywordChunk, SearchHit,
    SearchResults, StoredMetadata,
};
use lodestone_core::store::memory::fuzzy_distance;
use lodestone_core::store::{BackendStats, KeywordBackend, KeywordSearchOptions};
use tantivy::collector::{Count, DocSetCollector, TopDocs};
use tantivy::directory::MmapDirectory;
use tantivy::query::{
    AllQuery, BooleanQuery, BoostQuery, FuzzyTermQuery, Occur, Query, QueryParser, TermQuery,
};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, FAST, INDEXED,
    STORED, STRING,
};
use tantivy::{
    doc, DocAddress, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term,
};

use crate::db::{from_millis, to_millis};

const WRITER_HEAP_BYTES: usize = 50_000_000;

#[derive(Clone, Copy)]
struct Fields {
    chunk_id: Field,
    document_id: Field,
    title: Field,
    content: Field,
    position: Field,
    created_at: Field,
    metadata: Field,
}

struct Inner {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: Fields,
}

pub struct TantivyKeywordBackend {
    inner: Arc<Inner>,
    path: PathBuf,
}

fn build_schema(stemming: bool) -> Schema {
    let tokenizer = if stemming { "en_stem" } else { "default" };
    let text = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(tokenizer)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();

    let mut builder = Schema::builder();
    builder.add_text_field("chunk_id", STRING | STORED);
    builder.add_text_field("document_id", STRING | STORED);
    builder.add_text_field("title", text.clone());
    builder.add_text_field("content", text);
    builder.add_i64_field("position", INDEXED | STORED | FAST);
    builder.add_i64_field("created_at", INDEXED | STORED | FAST);
    builder.add_text_field("metadata", STORED);
    builder.build()
}

impl TantivyKeywordBackend {
    /// Open the index at `dir`, creating it when absent.
    pub fn open(dir: &Path, stemming: bool) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create index dir: {}", dir.display()))?;
        let directory = MmapDirectory::open(dir)?;
        let index = Index::open_or_create(directory, build_schema(stemming))?;

        let schema = index.schema();
        let fields = Fields {
            chunk_id: schema.get_field("chunk_id")?,
            document_id: schema.get_field("document_id")?,
            title: schema.get_field("title")?,
            content: schema.get_field("content")?,
            position: schema.get_field("position")?,
            created_at: schema.get_field("created_at")?,
            metadata: schema.get_field("metadata")?,
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let writer = index.writer(WRITER_HEAP_BYTES)?;

        Ok(Self {
            inner: Arc::new(Inner {
                index,
                reader,
                writer: Mutex::new(writer),
                fields,
            }),
            path: dir.to_path_buf(),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }
}

impl Inner {
    /// Run `f` against the writer, then commit and reload the reader.
    fn write<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut IndexWriter) -> Result<()>,
    {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut writer)?;
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    fn document_term(&self, document_id: &str) -> Term {
        Term::from_field_text(self.fields.document_id, document_id)
    }

    fn text(&self, doc: &TantivyDocument, field: Field) -> Option<String> {
        doc.get_first(field).and_then(|v| v.as_str()).map(str::to_string)
    }

    fn int(&self, doc: &TantivyDocument, field: Field) -> i64 {
        doc.get_first(field).and_then(|v| v.as_i64()).unwrap_or(0)
    }

    fn stored_metadata(&self, doc: &TantivyDocument) -> StoredMetadata {
        self.text(doc, self.fields.metadata)
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default()
    }

    fn to_chunk(&self, doc: &TantivyDocument) -> KeywordChunk {
        let f = self.fields;
        KeywordChunk {
            id: self.text(doc, f.chunk_id).unwrap_or_default(),
            document_id: self.text(doc, f.document_id).unwrap_or_default(),
            content: self.text(doc, f.content).unwrap_or_default(),
            title: self.text(doc, f.title).filter(|t| !t.is_empty()),
            metadata: decode_metadata(&self.stored_metadata(doc)),
            position: self.int(doc, f.position),
            created_at: from_millis(self.int(doc, f.created_at)),
        }
    }

    /// Every stored document matching `query`.
    fn collect_all(&self, query: &dyn Query) -> Result<Vec<TantivyDocument>> {
        let searcher = self.reader.searcher();
        let addresses: Vec<DocAddress> = searcher
            .search(query, &DocSetCollector)?
            .into_iter()
            .collect();
        addresses
            .into_iter()
            .map(|addr| Ok(searcher.doc::<TantivyDocument>(addr)?))
            .collect()
    }

    fn build_query(&self, terms: &[String], opts: &KeywordSearchOptions) -> Box<dyn Query> {
        let f = self.fields;
        let (title_boost, content_boost) = (opts.boost("title") as f32, opts.boost("content") as f32);

        if opts.fuzzy {
            let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
            for t in terms {
                let distance = fuzzy_distance(t).max(1) as u8;
                for (field, boost) in [(f.content, content_boost), (f.title, title_boost)] {
                    let fuzzy = FuzzyTermQuery::new(Term::from_field_text(field, t), distance, true);
                    clauses.push((Occur::Should, Box::new(BoostQuery::new(Box::new(fuzzy), boost))));
                }
            }
            return Box::new(BooleanQuery::new(clauses));
        }

        let mut parser = QueryParser::for_index(&self.index, vec![f.content, f.title]);
        parser.set_field_boost(f.content, content_boost);
        parser.set_field_boost(f.title, title_boost);
        // Lenient parsing never fails; unparsable fragments are skipped.
        let (parsed, _errors) = parser.parse_query_lenient(&terms.join(" "));
        parsed
    }

    fn search(&self, query: &str, opts: &KeywordSearchOptions) -> Result<SearchResults> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(SearchResults::empty());
        }
        let q = self.build_query(&terms, opts);
        let searcher = self.reader.searcher();

        let count = searcher.search(q.as_ref(), &Count)?;
        if count == 0 {
            return Ok(SearchResults::empty());
        }
        let top = searcher.search(q.as_ref(), &TopDocs::with_limit(count))?;

        let mut hits = Vec::new();
        for (score, addr) in top {
            let doc: TantivyDocument = searcher.doc(addr)?;
            let stored = self.stored_metadata(&doc);
            if !matches_filter(&stored, &opts.filter) {
                continue;
            }
            let chunk = self.to_chunk(&doc);
            hits.push(SearchHit {
                highlights: if opts.highlight {
                    excerpts(&chunk.content, &terms, EXCERPT_CHARS)
                } else {
                    Vec::new()
                },
                chunk_id: chunk.id,
                document_id: chunk.document_id,
                content: chunk.content,
                score: score as f64,
                source: HitSource::Keyword,
                rank: 0,
                metadata: chunk.metadata,
                vector: None,
            });
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        let total = hits.len();
        let hits = hits
            .into_iter()
            .skip(opts.offset)
            .take(opts.limit)
            .collect();
        Ok(SearchResults::from_ranked(hits, total))
    }
}

#[async_trait]
impl KeywordBackend for TantivyKeywordBackend {
    fn name(&self) -> &str {
        "tantivy"
    }

    async fn index_chunks(&self, document_id: &str, chunks: &[KeywordChunk]) -> Result<()> {
        let document_id = document_id.to_string();
        let chunks = chunks.to_vec();
        self.blocking(move |inner| {
            let f = inner.fields;
            inner.write(|writer| {
                writer.delete_term(inner.document_term(&document_id));
                for c in &chunks {
                    let metadata = serde_json::to_string(&encode_metadata(&c.metadata))?;
                    writer.add_document(doc!(
                        f.chunk_id => c.id.as_str(),
                        f.document_id => document_id.as_str(),
                        f.title => c.title.as_deref().unwrap_or(""),
                        f.content => c.content.as_str(),
                        f.position => c.position,
                        f.created_at => to_millis(c.created_at),
                        f.metadata => metadata,
                    ))?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn search(&self, query: &str, opts: &KeywordSearchOptions) -> Result<SearchResults> {
        let query = query.to_string();
        let opts = opts.clone();
        self.blocking(move |inner| inner.search(&query, &opts)).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        let document_id = document_id.to_string();
        self.blocking(move |inner| {
            inner.write(|writer| {
                writer.delete_term(inner.document_term(&document_id));
                Ok(())
            })
        })
        .await
    }

    async fn get_document_content(&self, document_id: &str) -> Result<Vec<KeywordChunk>> {
        let document_id = document_id.to_string();
        self.blocking(move |inner| {
            let q = TermQuery::new(inner.document_term(&document_id), IndexRecordOption::Basic);
            let mut chunks: Vec<KeywordChunk> = inner
                .collect_all(&q)?
                .iter()
                .map(|d| inner.to_chunk(d))
                .collect();
            chunks.sort_by_key(|c| c.position);
            Ok(chunks)
        })
        .await
    }

    async fn stats(&self) -> Result<BackendStats> {
        self.blocking(|inner| {
            let docs = inner.collect_all(&AllQuery)?;
            let mut ids = std::collections::HashSet::new();
            let mut size_bytes = 0u64;
            for d in &docs {
                if let Some(id) = inner.text(d, inner.fields.document_id) {
                    ids.insert(id);
                }
                size_bytes += inner.text(d, inner.fields.content).map(|c| c.len()).unwrap_or(0) as u64;
            }
            Ok(BackendStats {
                backend: "tantivy".to_string(),
                documents: ids.len() as u64,
                entries: docs.len() as u64,
                size_bytes,
            })
        })
        .await
    }

    async fn optimize(&self) -> Result<()> {
        self.blocking(|inner| {
            let segments = inner.index.searchable_segment_ids()?;
            if segments.len() > 1 {
                let mut writer = inner.writer.lock().unwrap_or_else(|e| e.into_inner());
                writer.merge(&segments).wait()?;
                writer.commit()?;
                inner.reader.reload()?;
            }
            Ok(())
        })
        .await
    }

    async fn reset(&self) -> Result<()> {
        self.blocking(|inner| {
            inner.write(|writer| {
                writer.delete_all_documents()?;
                Ok(())
            })
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        // Commit anything pending so the directory is consistent on disk.
        self.blocking(|inner| inner.write(|_| Ok(()))).await
    }

    async fn health(&self) -> Result<()> {
        if !self.path.exists() {
            anyhow::bail!("index directory {} is missing", self.path.display());
        }
        Ok(())
    }
}
