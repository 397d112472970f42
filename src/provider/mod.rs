//! Language-model providers.
//!
//! [`LanguageModel`] is the generation capability the service and the
//! LLM query expander depend on. Two implementations ship:
//!
//! - [`OpenAiClient`]: one OpenAI-compatible endpoint
//!   (`/chat/completions`, `/embeddings`, `/models`).
//! - [`ProviderPool`]: a set of clients behind a selection strategy,
//!   with concurrency caps and health tracking.
//!
//! Both also implement [`Embedder`](lodestone_core::embedding::Embedder).

pub mod client;
pub mod pool;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use client::OpenAiClient;
pub use pool::{PoolStats, ProviderPool, ProviderStatus, Strategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// The result of a tool call, answering `tool_call_id`.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Overrides the provider's configured model.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Vec<String>,
}

/// A function the model may call, described by a JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, as sent by the model.
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A complete model response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// One streamed increment. The last chunk has `done` set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub done: bool,
    pub usage: Option<Usage>,
    pub duration_ms: Option<u64>,
}

/// Callback receiving streamed chunks in order.
pub type StreamCallback<'a> = &'a mut (dyn FnMut(StreamChunk) + Send);

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, messages: &[ChatMessage], opts: &GenerateOptions) -> Result<Generation>;

    async fn generate_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
    ) -> Result<Generation>;

    /// Generate JSON conforming to `schema`, parsed.
    async fn generate_structured(
        &self,
        messages: &[ChatMessage],
        schema_name: &str,
        schema: &Value,
        opts: &GenerateOptions,
    ) -> Result<Value>;

    /// Stream a response through `on_chunk`; returns the assembled result.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
        on_chunk: StreamCallback<'_>,
    ) -> Result<Generation>;

    async fn stream_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
        on_chunk: StreamCallback<'_>,
    ) -> Result<Generation>;

    async fn health(&self) -> Result<()>;
}

/// Metadata an LLM extracted from document text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
}

/// The recognized intent of a user query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub intent: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Parse a JSON object out of a model reply, tolerating code fences and
/// surrounding prose.
pub fn parse_json_reply<T: serde::de::DeserializeOwned>(reply: &str) -> Option<T> {
    let trimmed = reply.trim();
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_reply_tolerates_fences() {
        let reply = "Sure!\n```json\n{\"summary\": \"s\", \"keywords\": [\"a\"]}\n```";
        let meta: ExtractedMetadata = parse_json_reply(reply).unwrap();
        assert_eq!(meta.summary, "s");
        assert_eq!(meta.keywords, vec!["a"]);
        assert!(parse_json_reply::<ExtractedMetadata>("no json here").is_none());
    }

    #[test]
    fn test_tool_message_serialization() {
        let msg = ChatMessage::tool("call_1", "42");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "call_1");
        assert!(v.get("tool_calls").is_none());
    }
}
