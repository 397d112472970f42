//! Query expansion.
//!
//! A [`QueryExpander`] extends a query with related terms before hybrid
//! search. The engine binds [`NoopExpander`] unless configured otherwise.
//! An LLM-backed expander lives in the app crate.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::highlight::query_terms;

/// The result of expanding a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandedQuery {
    pub original: String,
    /// Original query followed by the added terms.
    pub expanded: String,
    pub added_terms: Vec<String>,
}

impl ExpandedQuery {
    pub fn unchanged(query: &str) -> Self {
        Self {
            original: query.to_string(),
            expanded: query.to_string(),
            added_terms: Vec::new(),
        }
    }

    pub fn with_terms(query: &str, added_terms: Vec<String>) -> Self {
        let mut expanded = query.to_string();
        for t in &added_terms {
            expanded.push(' ');
            expanded.push_str(t);
        }
        Self {
            original: query.to_string(),
            expanded,
            added_terms,
        }
    }
}

#[async_trait]
pub trait QueryExpander: Send + Sync {
    fn name(&self) -> &str;

    /// Add at most `max_terms` related terms to `query`.
    async fn expand(&self, query: &str, max_terms: usize) -> Result<ExpandedQuery>;
}

/// Returns the query unchanged.
#[derive(Debug, Clone, Default)]
pub struct NoopExpander;

#[async_trait]
impl QueryExpander for NoopExpander {
    fn name(&self) -> &str {
        "none"
    }

    async fn expand(&self, query: &str, _max_terms: usize) -> Result<ExpandedQuery> {
        Ok(ExpandedQuery::unchanged(query))
    }
}

/// Dictionary-based synonym expansion.
#[derive(Debug, Clone)]
pub struct SynonymExpander {
    synonyms: HashMap<String, Vec<String>>,
}

impl SynonymExpander {
    pub fn new(synonyms: HashMap<String, Vec<String>>) -> Self {
        let synonyms = synonyms
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self { synonyms }
    }

    /// A small general-purpose dictionary.
    pub fn builtin() -> Self {
        let pairs: &[(&str, &[&str])] = &[
            ("error", &["failure", "fault", "exception"]),
            ("bug", &["defect", "issue"]),
            ("fast", &["quick", "rapid"]),
            ("slow", &["sluggish", "latency"]),
            ("car", &["automobile", "vehicle"]),
            ("doc", &["document", "documentation"]),
            ("config", &["configuration", "settings"]),
            ("install", &["setup", "installation"]),
            ("delete", &["remove", "erase"]),
            ("search", &["query", "lookup", "retrieve"]),
            ("big", &["large", "huge"]),
            ("small", &["little", "tiny"]),
            ("start", &["begin", "launch"]),
            ("stop", &["halt", "terminate"]),
        ];
        Self::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect(),
        )
    }
}

#[async_trait]
impl QueryExpander for SynonymExpander {
    fn name(&self) -> &str {
        "synonym"
    }

    async fn expand(&self, query: &str, max_terms: usize) -> Result<ExpandedQuery> {
        let terms = query_terms(query);
        let mut added: Vec<String> = Vec::new();
        'outer: for term in &terms {
            if let Some(syns) = self.synonyms.get(term) {
                for s in syns {
                    if added.len() >= max_terms {
                        break 'outer;
                    }
                    let s = s.to_lowercase();
                    if !terms.contains(&s) && !added.contains(&s) {
                        added.push(s);
                    }
                }
            }
        }
        Ok(ExpandedQuery::with_terms(query, added))
    }
}
