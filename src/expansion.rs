//! LLM-backed query expansion and the expander factory.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lodestone_core::expansion::{ExpandedQuery, NoopExpander, QueryExpander, SynonymExpander};
use lodestone_core::highlight::query_terms;

use crate::config::ExpansionConfig;
use crate::error::RagError;
use crate::prompts::{PromptManager, QUERY_EXPAND};
use crate::provider::{ChatMessage, GenerateOptions, LanguageModel};

/// Asks a language model for related search terms.
pub struct LlmExpander {
    llm: Arc<dyn LanguageModel>,
    prompts: Arc<PromptManager>,
}

impl LlmExpander {
    pub fn new(llm: Arc<dyn LanguageModel>, prompts: Arc<PromptManager>) -> Self {
        Self { llm, prompts }
    }
}

#[async_trait]
impl QueryExpander for LlmExpander {
    fn name(&self) -> &str {
        "llm"
    }

    async fn expand(&self, query: &str, max_terms: usize) -> Result<ExpandedQuery> {
        if max_terms == 0 {
            return Ok(ExpandedQuery::unchanged(query));
        }
        let max = max_terms.to_string();
        let prompt = self
            .prompts
            .render(QUERY_EXPAND, &[("query", query), ("max_terms", &max)])?;
        let opts = GenerateOptions {
            temperature: Some(0.0),
            max_tokens: Some(100),
            ..Default::default()
        };
        let reply = self.llm.generate(&[ChatMessage::user(prompt)], &opts).await?;
        Ok(ExpandedQuery::with_terms(
            query,
            parse_terms(&reply.content, query, max_terms),
        ))
    }
}

/// Comma- or newline-separated terms, without list markers, terms already
/// in the query, or duplicates.
fn parse_terms(reply: &str, query: &str, max_terms: usize) -> Vec<String> {
    let existing = query_terms(query);
    let mut terms: Vec<String> = Vec::new();
    for raw in reply.split(|c| c == ',' || c == '\n') {
        let term = strip_list_marker(raw.trim())
            .trim_matches('"')
            .trim()
            .to_lowercase();
        if term.is_empty() || existing.contains(&term) || terms.contains(&term) {
            continue;
        }
        terms.push(term);
        if terms.len() >= max_terms {
            break;
        }
    }
    terms
}

/// `- term`, `* term`, `1. term`, `2) term` -> `term`.
fn strip_list_marker(item: &str) -> &str {
    let item = item.trim_start_matches(['-', '*']).trim_start();
    let digits = item.len() - item.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits > 0 {
        if let Some(rest) = item[digits..].strip_prefix(['.', ')']) {
            return rest.trim_start();
        }
    }
    item
}

/// The expander named by `search.expansion`. Disabled expansion binds the
/// no-op expander; `llm` needs a language model.
pub fn create_expander(
    config: &ExpansionConfig,
    llm: Option<Arc<dyn LanguageModel>>,
    prompts: Arc<PromptManager>,
) -> Result<Arc<dyn QueryExpander>> {
    if !config.enabled {
        return Ok(Arc::new(NoopExpander));
    }
    match config.method.as_str() {
        "none" => Ok(Arc::new(NoopExpander)),
        "synonym" => Ok(Arc::new(SynonymExpander::builtin())),
        "llm" => match llm {
            Some(llm) => Ok(Arc::new(LlmExpander::new(llm, prompts))),
            None => Err(RagError::configuration(
                "search.expansion.method = \"llm\" needs a language model",
            )),
        },
        other => Err(RagError::configuration(format!(
            "unknown expansion method '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_terms() {
        let reply = "1. Automobile\n2. vehicle, car\n- \"motorcar\"\nvehicle";
        assert_eq!(
            parse_terms(reply, "car", 5),
            vec!["automobile", "vehicle", "motorcar"]
        );
        assert_eq!(parse_terms(reply, "car", 1), vec!["automobile"]);
        assert!(parse_terms("", "car", 3).is_empty());
        assert_eq!(parse_terms("3d printing", "printer", 2), vec!["3d printing"]);
    }

    #[test]
    fn test_factory() {
        let prompts = Arc::new(PromptManager::default());
        let disabled = ExpansionConfig::default();
        assert_eq!(create_expander(&disabled, None, prompts.clone()).unwrap().name(), "none");

        let synonym = ExpansionConfig {
            enabled: true,
            ..Default::default()
        };
        assert_eq!(create_expander(&synonym, None, prompts.clone()).unwrap().name(), "synonym");

        let llm = ExpansionConfig {
            enabled: true,
            method: "llm".into(),
            ..Default::default()
        };
        assert!(create_expander(&llm, None, prompts).is_err());
    }
}
