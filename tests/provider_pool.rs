//! Client, pool and service against a mock OpenAI-compatible server.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lodestone::config::Config;
use lodestone::error::{is_transient, kind_of, RagError};
use lodestone::ingest::IngestRequest;
use lodestone::provider::pool::PoolMember;
use lodestone::provider::{
    ChatMessage, GenerateOptions, LanguageModel, OpenAiClient, ProviderPool, StreamChunk, Strategy,
    ToolDefinition,
};
use lodestone::service::{AnswerOptions, RagService};
use lodestone_core::embedding::Embedder;
use serde_json::{json, Value};

#[derive(Default)]
struct Mock {
    failing: AtomicBool,
    auth: Mutex<Vec<String>>,
    embedding_calls: AtomicUsize,
}

fn sse(events: &[Value]) -> String {
    let mut body = String::new();
    for e in events {
        body.push_str(&format!("data: {}\n\n", e));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

async fn chat(State(mock): State<Arc<Mock>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        mock.auth.lock().unwrap().push(auth.to_string());
    }
    if mock.failing.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded").into_response();
    }
    if body["stream"] == json!(true) {
        let events = [
            json!({"model": "mock-model", "choices": [{"delta": {"content": "Hello"}}]}),
            json!({"choices": [{"delta": {"content": " world"}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "get_weather", "arguments": "{\"city\":"}}
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"Paris\"}"}}
            ]}, "finish_reason": "tool_calls"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}}),
        ];
        return ([(header::CONTENT_TYPE, "text/event-stream")], sse(&events)).into_response();
    }

    let message = if body.get("response_format").is_some() {
        json!({"role": "assistant", "content": "```json\n{\"answer\": 42}\n```"})
    } else if body.get("tools").is_some() {
        json!({"role": "assistant", "content": null, "tool_calls": [
            {"id": "call_9", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\":\"rust\"}"}}
        ]})
    } else {
        let last = body["messages"]
            .as_array()
            .and_then(|m| m.last())
            .and_then(|m| m["content"].as_str())
            .unwrap_or("")
            .to_string();
        json!({"role": "assistant", "content": format!("echo: {}", last)})
    };
    Json(json!({
        "model": body["model"],
        "choices": [{"index": 0, "message": message, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7},
    }))
    .into_response()
}

async fn embeddings(State(mock): State<Arc<Mock>>, Json(body): Json<Value>) -> Response {
    mock.embedding_calls.fetch_add(1, Ordering::SeqCst);
    if mock.failing.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response();
    }
    let inputs: Vec<String> = match &body["input"] {
        Value::String(s) => vec![s.clone()],
        Value::Array(a) => a.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
        _ => Vec::new(),
    };
    // reversed, so the client has to restore input order
    let data: Vec<Value> = inputs
        .iter()
        .enumerate()
        .rev()
        .map(|(i, text)| json!({"index": i, "embedding": [text.len() as f32, 1.0, 0.0]}))
        .collect();
    Json(json!({"data": data, "model": body["model"]})).into_response()
}

async fn models(State(mock): State<Arc<Mock>>) -> Response {
    if mock.failing.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "down").into_response();
    }
    Json(json!({"object": "list", "data": [{"id": "mock-model"}]})).into_response()
}

/// Start a mock server; returns its `/v1` base URL.
async fn spawn_mock() -> (String, Arc<Mock>) {
    let mock = Arc::new(Mock::default());
    let app = Router::new()
        .route("/v1/chat/completions", post(chat))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(models))
        .with_state(Arc::clone(&mock));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/v1", addr), mock)
}

#[tokio::test]
async fn test_client_generate_sends_bearer_key() {
    let (base, mock) = spawn_mock().await;
    let client = OpenAiClient::new("mock", &base, "sk-test").unwrap().with_model("mock-model");

    let reply = client
        .generate(&[ChatMessage::user("hello")], &GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.content, "echo: hello");
    assert_eq!(reply.model, "mock-model");
    assert_eq!(reply.usage.total_tokens, 7);
    assert_eq!(reply.finish_reason.as_deref(), Some("stop"));
    assert_eq!(mock.auth.lock().unwrap().as_slice(), ["Bearer sk-test"]);

    // no key, no header
    let anonymous = OpenAiClient::new("anon", &base, "").unwrap();
    anonymous
        .generate(&[ChatMessage::user("hi")], &GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(mock.auth.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_client_tools_and_structured_output() {
    let (base, _) = spawn_mock().await;
    let client = OpenAiClient::new("mock", &base, "").unwrap();

    let tools = [ToolDefinition {
        name: "lookup".into(),
        description: "Search the index".into(),
        parameters: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
    }];
    let reply = client
        .generate_with_tools(&[ChatMessage::user("find rust")], &tools, &GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.content, "");
    assert_eq!(reply.tool_calls.len(), 1);
    assert_eq!(reply.tool_calls[0].name, "lookup");
    assert_eq!(reply.tool_calls[0].arguments, "{\"q\":\"rust\"}");

    let value = client
        .generate_structured(
            &[ChatMessage::user("answer")],
            "answer",
            &json!({"type": "object"}),
            &GenerateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(value, json!({"answer": 42}));
}

#[tokio::test]
async fn test_client_stream_accumulates_deltas() {
    let (base, _) = spawn_mock().await;
    let client = OpenAiClient::new("mock", &base, "").unwrap();

    let mut chunks: Vec<StreamChunk> = Vec::new();
    let mut collect = |c: StreamChunk| chunks.push(c);
    let generation = client
        .stream(&[ChatMessage::user("hi")], &GenerateOptions::default(), &mut collect)
        .await
        .unwrap();

    assert_eq!(generation.content, "Hello world");
    assert_eq!(generation.model, "mock-model");
    assert_eq!(generation.finish_reason.as_deref(), Some("tool_calls"));
    assert_eq!(generation.tool_calls.len(), 1);
    assert_eq!(generation.tool_calls[0].arguments, "{\"city\":\"Paris\"}");

    let deltas: Vec<&str> = chunks.iter().filter(|c| !c.done).map(|c| c.content.as_str()).collect();
    assert_eq!(deltas, vec!["Hello", " world"]);
    let last = chunks.last().unwrap();
    assert!(last.done);
    assert_eq!(last.usage.map(|u| u.total_tokens), Some(7));
    assert_eq!(last.tool_calls[0].name, "get_weather");
}

#[tokio::test]
async fn test_client_embeddings_are_batched_and_ordered() {
    let (base, mock) = spawn_mock().await;
    let client = OpenAiClient::new("mock", &base, "")
        .unwrap()
        .with_batch_size(2)
        .with_dimensions(3);

    let texts: Vec<String> = ["a", "bb", "ccc"].iter().map(|s| s.to_string()).collect();
    let vectors = client.embed_batch(&texts).await.unwrap();
    assert_eq!(vectors.len(), 3);
    let lengths: Vec<f32> = vectors.iter().map(|v| v[0]).collect();
    assert_eq!(lengths, vec![1.0, 2.0, 3.0]);
    assert_eq!(mock.embedding_calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.dimensions(), 3);
}

#[tokio::test]
async fn test_server_errors_are_transient() {
    let (base, mock) = spawn_mock().await;
    let client = OpenAiClient::new("mock", &base, "").unwrap();
    mock.failing.store(true, Ordering::SeqCst);

    let err = client
        .generate(&[ChatMessage::user("hi")], &GenerateOptions::default())
        .await
        .unwrap_err();
    assert!(is_transient(&err));
    assert!(err.to_string().contains("500"));
    assert!(is_transient(&client.embed("x").await.unwrap_err()));
    assert!(client.health().await.is_err());

    mock.failing.store(false, Ordering::SeqCst);
    client.health().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transient() {
    // bind and drop to get a port nothing listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let client = OpenAiClient::new("gone", format!("http://{}/v1", addr), "").unwrap();
    let err = client
        .generate(&[ChatMessage::user("hi")], &GenerateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(kind_of(&err), Some(RagError::Transient(_))));
}

#[tokio::test]
async fn test_pool_health_checks_route_around_failures() {
    let (good_base, _) = spawn_mock().await;
    let (bad_base, bad) = spawn_mock().await;
    let member = |name: &str, base: &str| {
        PoolMember::new(Arc::new(OpenAiClient::new(name, base, "").unwrap()), 3, 0)
    };
    let pool = ProviderPool::new(
        Strategy::RoundRobin,
        vec![member("good", &good_base), member("bad", &bad_base)],
    )
    .unwrap();

    bad.failing.store(true, Ordering::SeqCst);
    pool.check_health().await.unwrap();
    let stats = pool.stats();
    assert_eq!(stats.healthy, 1);
    assert!(stats.providers.iter().any(|p| p.name == "bad" && !p.healthy));

    for _ in 0..4 {
        let reply = pool
            .generate(&[ChatMessage::user("ping")], &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.content, "echo: ping");
    }
    assert!(pool.stats().providers.iter().all(|p| p.active_requests == 0));

    bad.failing.store(false, Ordering::SeqCst);
    pool.check_health().await.unwrap();
    assert_eq!(pool.stats().healthy, 2);

    let vector = pool.embed("four").await.unwrap();
    assert_eq!(vector[0], 4.0);
    pool.close().await;
    assert!(pool.get().is_err());
}

#[tokio::test]
async fn test_service_answers_through_configured_pool() {
    let (base, _) = spawn_mock().await;
    let config = Config::from_toml_str(&format!(
        r#"
[pool]
enabled = true
strategy = "least_load"
health_check_interval_secs = 0

[[pool.providers]]
name = "mock"
base_url = "{}"
model = "mock-model"
capability = 4
"#,
        base
    ))
    .unwrap();
    let service = RagService::from_config(config).unwrap();

    service
        .ingest(IngestRequest::text("Paris is the capital of France."))
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
    assert!(answer.answer.starts_with("echo: Source 1: Paris is the capital of France."));
    assert_eq!(answer.model, "mock-model");
    assert_eq!(answer.usage.total_tokens, 7);

    let stats = service.stats().await.unwrap();
    let pool = stats.pool.unwrap();
    assert_eq!(pool.strategy, Strategy::LeastLoad);
    assert_eq!(pool.providers[0].capability, 4);
    service.close().await.unwrap();
}
