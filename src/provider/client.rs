//! OpenAI-compatible HTTP client.
//!
//! Endpoints, relative to `base_url`:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | generate / tools / structured | `POST /chat/completions` |
//! | stream | `POST /chat/completions` with `stream: true` (SSE) |
//! | embed | `POST /embeddings`, split into `batch_size` inputs per call |
//! | health | `GET /models` |
//!
//! The `Authorization: Bearer` header is sent only for a non-empty key.
//! HTTP 429, 5xx and network failures are [`RagError::Transient`]; other
//! non-success statuses are service errors. Nothing is retried here.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use lodestone_core::embedding::Embedder;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    parse_json_reply, ChatMessage, GenerateOptions, Generation, LanguageModel, Role,
    StreamCallback, StreamChunk, ToolCall, ToolDefinition, Usage,
};
use crate::config::{EmbeddingConfig, ProviderConfig};
use crate::error::RagError;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_BATCH_SIZE: usize = 64;

// ─── wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireStreamResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddings {
    data: Vec<WireEmbedding>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedding {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

fn wire_message(msg: &ChatMessage) -> Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut v = json!({ "role": role, "content": msg.content });
    if let Some(id) = &msg.tool_call_id {
        v["tool_call_id"] = json!(id);
    }
    if !msg.tool_calls.is_empty() {
        v["tool_calls"] = Value::Array(
            msg.tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.arguments },
                    })
                })
                .collect(),
        );
    }
    v
}

fn wire_tool(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        },
    })
}

/// Tool-call fragments accumulated by stream index.
#[derive(Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<usize, ToolCall>,
}

impl ToolCallAccumulator {
    fn apply(&mut self, delta: WireToolCallDelta) {
        let call = self.calls.entry(delta.index).or_insert_with(|| ToolCall {
            id: String::new(),
            name: String::new(),
            arguments: String::new(),
        });
        if let Some(id) = delta.id {
            call.id.push_str(&id);
        }
        if let Some(f) = delta.function {
            if let Some(name) = f.name {
                call.name.push_str(&name);
            }
            if let Some(args) = f.arguments {
                call.arguments.push_str(&args);
            }
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls.into_values().collect()
    }
}

// ─── client ──────────────────────────────────────────────────────────────

pub struct OpenAiClient {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: String,
    dimensions: usize,
    batch_size: usize,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        Self::with_timeout(name, base_url, api_key, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    fn with_timeout(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url: String = base_url.into();
        if base_url.trim().is_empty() {
            return Err(RagError::configuration("provider base_url is empty"));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimensions: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            http,
        })
    }

    /// A pool member. Embedding dimensions and batch size come from the
    /// `[embedding]` section.
    pub fn from_provider(provider: &ProviderConfig, embedding: &EmbeddingConfig) -> Result<Self> {
        let mut client = Self::with_timeout(
            provider.name.clone(),
            provider.base_url.clone(),
            provider.resolve_api_key(),
            Duration::from_secs(provider.timeout_secs.max(1)),
        )?
        .with_dimensions(embedding.dimensions)
        .with_batch_size(embedding.batch_size);
        if !provider.model.is_empty() {
            client.model = provider.model.clone();
        }
        if let Some(m) = provider.embedding_model.as_ref().or(embedding.model.as_ref()) {
            client.embedding_model = m.clone();
        }
        Ok(client)
    }

    /// The single-endpoint embedder described by `[embedding]`.
    pub fn from_embedding_config(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        let mut client = Self::new("openai", config.base_url.clone(), api_key)?
            .with_dimensions(config.dimensions)
            .with_batch_size(config.batch_size);
        if let Some(m) = &config.model {
            client.embedding_model = m.clone();
        }
        Ok(client)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }
        req
    }

    async fn send(&self, operation: &str, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = req
            .send()
            .await
            .map_err(|e| RagError::Transient(format!("{} {}: {}", self.name, operation, e)))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("HTTP {}: {}", status, body);
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(RagError::Transient(format!("{} {}: {}", self.name, operation, message)).into());
        }
        Err(RagError::service(self.name.clone(), operation, message))
    }

    fn chat_body(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": opts.model.as_deref().unwrap_or(&self.model),
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
        });
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = opts.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if !opts.stop.is_empty() {
            body["stop"] = json!(opts.stop);
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(wire_tool).collect());
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    async fn chat(&self, body: Value) -> Result<Generation> {
        let response = self
            .send("chat", self.request(reqwest::Method::POST, "/chat/completions").json(&body))
            .await?;
        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| RagError::service(self.name.clone(), "chat", format!("bad response: {}", e)))?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| RagError::service(self.name.clone(), "chat", "no choices returned"))?;
        Ok(Generation {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect(),
            usage: wire.usage.map(Usage::from).unwrap_or_default(),
            model: wire.model.unwrap_or_else(|| self.model.clone()),
            finish_reason: choice.finish_reason,
        })
    }

    async fn chat_stream(&self, body: Value, on_chunk: StreamCallback<'_>) -> Result<Generation> {
        let started = Instant::now();
        let response = self
            .send("stream", self.request(reqwest::Method::POST, "/chat/completions").json(&body))
            .await?;

        self.read_stream(response.bytes_stream(), started, on_chunk).await
    }

    /// Folds `data:` events into a [`Generation`] until `[DONE]` or the
    /// end of the body. Bytes are decoded per event, so code points split
    /// across network reads survive.
    async fn read_stream<S, B, E>(
        &self,
        body: S,
        started: Instant,
        on_chunk: StreamCallback<'_>,
    ) -> Result<Generation>
    where
        S: Stream<Item = std::result::Result<B, E>> + Send,
        B: AsRef<[u8]> + Send,
        E: std::fmt::Display + Send,
    {
        let events = body.eventsource();
        futures::pin_mut!(events);

        let mut tools = ToolCallAccumulator::default();
        let mut generation = Generation {
            model: self.model.clone(),
            ..Default::default()
        };

        while let Some(event) = events.next().await {
            let event = event.map_err(|e| RagError::Transient(format!("{} stream: {}", self.name, e)))?;
            let data = event.data.trim();
            if data == "[DONE]" {
                break;
            }
            if data.is_empty() {
                continue;
            }
            let wire: WireStreamResponse = match serde_json::from_str(data) {
                Ok(w) => w,
                Err(e) => {
                    debug!(provider = %self.name, error = %e, "skipping malformed stream event");
                    continue;
                }
            };
            if let Some(m) = wire.model {
                generation.model = m;
            }
            if let Some(u) = wire.usage {
                generation.usage = u.into();
            }
            for choice in wire.choices {
                if let Some(reason) = choice.finish_reason {
                    generation.finish_reason = Some(reason);
                }
                for delta in choice.delta.tool_calls.unwrap_or_default() {
                    tools.apply(delta);
                }
                if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                    generation.content.push_str(&text);
                    on_chunk(StreamChunk {
                        content: text,
                        ..Default::default()
                    });
                }
            }
        }

        generation.tool_calls = tools.finish();
        on_chunk(StreamChunk {
            content: String::new(),
            tool_calls: generation.tool_calls.clone(),
            done: true,
            usage: Some(generation.usage),
            duration_ms: Some(started.elapsed().as_millis() as u64),
        });
        Ok(generation)
    }

    async fn embed_request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({ "model": self.embedding_model, "input": inputs });
        let response = self
            .send("embed", self.request(reqwest::Method::POST, "/embeddings").json(&body))
            .await?;
        let mut wire: WireEmbeddings = response
            .json()
            .await
            .map_err(|e| RagError::service(self.name.clone(), "embed", format!("bad response: {}", e)))?;
        if wire.data.len() != inputs.len() {
            return Err(RagError::service(
                self.name.clone(),
                "embed",
                format!("expected {} embeddings, got {}", inputs.len(), wire.data.len()),
            ));
        }
        wire.data.sort_by_key(|e| e.index);
        Ok(wire.data.into_iter().map(|e| e.embedding).collect())
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, messages: &[ChatMessage], opts: &GenerateOptions) -> Result<Generation> {
        self.chat(self.chat_body(messages, &[], opts, false)).await
    }

    async fn generate_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
    ) -> Result<Generation> {
        self.chat(self.chat_body(messages, tools, opts, false)).await
    }

    async fn generate_structured(
        &self,
        messages: &[ChatMessage],
        schema_name: &str,
        schema: &Value,
        opts: &GenerateOptions,
    ) -> Result<Value> {
        let mut body = self.chat_body(messages, &[], opts, false);
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": { "name": schema_name, "schema": schema, "strict": true },
        });
        let generation = self.chat(body).await?;
        parse_json_reply(&generation.content).ok_or_else(|| {
            RagError::service(
                self.name.clone(),
                "generate structured",
                "response is not valid JSON",
            )
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
        on_chunk: StreamCallback<'_>,
    ) -> Result<Generation> {
        self.chat_stream(self.chat_body(messages, &[], opts, true), on_chunk)
            .await
    }

    async fn stream_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        opts: &GenerateOptions,
        on_chunk: StreamCallback<'_>,
    ) -> Result<Generation> {
        self.chat_stream(self.chat_body(messages, tools, opts, true), on_chunk)
            .await
    }

    async fn health(&self) -> Result<()> {
        self.send("health", self.request(reqwest::Method::GET, "/models"))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.embedding_model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_request(batch).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_body(parts: Vec<Vec<u8>>) -> impl Stream<Item = std::result::Result<Vec<u8>, std::io::Error>> {
        futures::stream::iter(parts.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_stream_keeps_code_points_split_across_reads() {
        let client = OpenAiClient::new("t", "http://localhost:1/v1", "").unwrap();
        let event = "data: {\"choices\":[{\"delta\":{\"content\":\"café 東京\"}}]}\n\ndata: [DONE]\n\n";
        let bytes = event.as_bytes();
        // cut inside the two bytes of 'é' and again inside '東'
        let e_at = event.find('é').unwrap() + 1;
        let kyo_at = event.find('東').unwrap() + 2;
        let body = split_body(vec![
            bytes[..e_at].to_vec(),
            bytes[e_at..kyo_at].to_vec(),
            bytes[kyo_at..].to_vec(),
        ]);

        let mut chunks = Vec::new();
        let mut on_chunk = |c: StreamChunk| chunks.push(c);
        let generation = client
            .read_stream(body, Instant::now(), &mut on_chunk)
            .await
            .unwrap();

        assert_eq!(generation.content, "café 東京");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "café 東京");
        assert!(chunks[1].done);
    }

    #[tokio::test]
    async fn test_stream_stops_at_done_and_skips_comments() {
        let client = OpenAiClient::new("t", "http://localhost:1/v1", "").unwrap();
        let body = split_body(vec![
            b": keep-alive\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n".to_vec(),
            b"\ndata: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n".to_vec(),
        ]);
        let mut on_chunk = |_: StreamChunk| {};
        let generation = client
            .read_stream(body, Instant::now(), &mut on_chunk)
            .await
            .unwrap();
        assert_eq!(generation.content, "a");
    }

    #[test]
    fn test_tool_call_fragments_accumulate() {
        let mut acc = ToolCallAccumulator::default();
        let deltas: Vec<WireToolCallDelta> = serde_json::from_value(json!([
            {"index": 0, "id": "call_1", "function": {"name": "lookup", "arguments": "{\"q\":"}},
            {"index": 0, "function": {"arguments": "\"rust\"}"}},
            {"index": 1, "id": "call_2", "function": {"name": "time", "arguments": "{}"}}
        ]))
        .unwrap();
        for d in deltas {
            acc.apply(d);
        }
        let calls = acc.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments, "{\"q\":\"rust\"}");
        assert_eq!(calls[1].name, "time");
    }

    #[test]
    fn test_chat_body_shape() {
        let client = OpenAiClient::new("t", "http://localhost:1/v1/", "").unwrap();
        assert_eq!(client.base_url(), "http://localhost:1/v1");
        let tools = [ToolDefinition {
            name: "lookup".into(),
            description: "find things".into(),
            parameters: json!({"type": "object"}),
        }];
        let opts = GenerateOptions {
            temperature: Some(0.5),
            ..Default::default()
        };
        let body = client.chat_body(&[ChatMessage::user("hi")], &tools, &opts, true);
        assert_eq!(body["model"], DEFAULT_CHAT_MODEL);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["tools"][0]["function"]["name"], "lookup");
        assert_eq!(body["stream"], true);
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_empty_base_url_is_config_error() {
        let err = OpenAiClient::new("t", " ", "").err().unwrap();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(RagError::Configuration(_))
        ));
    }
}
