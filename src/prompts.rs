//! Prompt templates.
//!
//! Templates are addressed as `namespace.key` and use `{{name}}`
//! placeholders. Built-ins cover answering, metadata extraction, intent
//! recognition and query expansion. A `[prompts] dir` may override any of
//! them with a file named `namespace.key.md`; files for unknown keys add
//! new templates.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::RagError;

pub const RAG_SYSTEM: &str = "rag.system";
pub const RAG_ANSWER: &str = "rag.answer";
pub const METADATA_EXTRACT: &str = "metadata.extract";
pub const INTENT_RECOGNIZE: &str = "intent.recognize";
pub const QUERY_EXPAND: &str = "query.expand";

const BUILTINS: &[(&str, &str)] = &[
    (
        RAG_SYSTEM,
        "You are a helpful assistant that answers questions using only the provided context. \
Answer directly and concisely. Do not show your reasoning or thinking process. \
If the context does not contain the answer, say so.",
    ),
    (
        RAG_ANSWER,
        "{{context}}\n\nQuestion: {{question}}\n\nAnswer based on the provided context:",
    ),
    (
        METADATA_EXTRACT,
        "Extract metadata from the following document. Reply with a single JSON object with \
the fields \"title\" (string), \"summary\" (one or two sentences), \"keywords\" (array of \
up to 10 strings) and \"category\" (string). Reply with JSON only.\n\nDocument:\n{{content}}",
    ),
    (
        INTENT_RECOGNIZE,
        "Classify the intent of the user query. Reply with a single JSON object with the \
fields \"intent\" (one of \"search\", \"question\", \"summarize\", \"compare\", \"other\"), \
\"confidence\" (0 to 1), \"entities\" (array of strings) and \"keywords\" (array of \
strings). Reply with JSON only.\n\nQuery: {{query}}",
    ),
    (
        QUERY_EXPAND,
        "List up to {{max_terms}} search terms closely related to the query below, such as \
synonyms or alternative phrasings. Reply with a comma-separated list only.\n\nQuery: {{query}}",
    ),
];

#[derive(Debug, Clone)]
pub struct PromptManager {
    templates: HashMap<String, String>,
}

impl Default for PromptManager {
    fn default() -> Self {
        Self {
            templates: BUILTINS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl PromptManager {
    /// Built-ins, overridden by `namespace.key.md` files in `dir` when given.
    pub fn new(dir: Option<&Path>) -> Result<Self> {
        let mut manager = Self::default();
        if let Some(dir) = dir {
            manager.load_dir(dir)?;
        }
        Ok(manager)
    }

    fn load_dir(&mut self, dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            return Err(RagError::configuration(format!(
                "prompts.dir {} is not a directory",
                dir.display()
            )));
        }
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read prompt directory: {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(key) = name.strip_suffix(".md") else {
                continue;
            };
            // namespace.key
            if key.split('.').filter(|p| !p.is_empty()).count() < 2 {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt: {}", path.display()))?;
            debug!(prompt = key, path = %path.display(), "loaded prompt override");
            self.templates.insert(key.to_string(), text.trim_end().to_string());
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.templates.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, template: impl Into<String>) {
        self.templates.insert(key.into(), template.into());
    }

    /// Substitute `{{name}}` placeholders. Placeholders without a value are
    /// left in place.
    pub fn render(&self, key: &str, vars: &[(&str, &str)]) -> Result<String> {
        let template = self
            .get(key)
            .ok_or_else(|| RagError::not_found(format!("prompt {}", key)))?;
        Ok(substitute(template, vars))
    }
}

fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                match vars.iter().find(|(k, _)| *k == name) {
                    Some((_, value)) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
