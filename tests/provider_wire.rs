//! Wire-format tests: real adapters against local mock upstream servers,
//! asserting the exact payloads the upstreams receive and the canonical
//! shapes the adapters hand back.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ai_gateway::config::{BreakerSettings, ProviderSettings, RoutingSettings};
use ai_gateway::metrics::Metrics;
use ai_gateway::providers::{Claude, Gemini, LocalWorker, OpenAI};
use ai_gateway::router::RoutingEngine;
use ai_gateway::types::{ChatMessage, ChatRequest, EmbeddingInput, EmbeddingRequest};
use ai_gateway::AiProvider;
use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;

type Captured = Arc<Mutex<Option<(HeaderMap, Value)>>>;

async fn spawn_upstream(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn settings(base_url: &str, api_key: &str) -> ProviderSettings {
    ProviderSettings {
        api_key: api_key.to_string(),
        base_url: base_url.to_string(),
        timeout_seconds: 5,
        ..ProviderSettings::default()
    }
}

fn chat_request(messages: Vec<ChatMessage>, model: Option<&str>) -> ChatRequest {
    ChatRequest {
        model: model.map(str::to_string),
        messages,
        ..ChatRequest::default()
    }
}

#[tokio::test]
async fn openai_adapter_is_passthrough_with_bearer_auth() {
    let captured: Captured = Arc::new(Mutex::new(None));
    let capture = captured.clone();
    let upstream = Router::new().route(
        "/chat/completions",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let capture = capture.clone();
            async move {
                *capture.lock().unwrap() = Some((headers, body));
                Json(json!({
                    "id": "chatcmpl-123",
                    "object": "chat.completion",
                    "created": 1_700_000_000,
                    "model": "gpt-4o-mini",
                    "choices": [{
                        "index": 0,
                        "message": { "role": "assistant", "content": "Hello!" },
                        "finish_reason": "stop"
                    }],
                    "usage": { "prompt_tokens": 10, "completion_tokens": 4, "total_tokens": 14 }
                }))
            }
        }),
    );
    let base = spawn_upstream(upstream).await;

    let mut provider_settings = settings(&base, "sk-test");
    provider_settings.default_model = "gpt-4o-mini".to_string();
    provider_settings.input_cost_per_token = 0.000_000_15;
    provider_settings.output_cost_per_token = 0.000_000_6;
    let adapter = OpenAI::new(&provider_settings, Arc::new(Metrics::new()));

    let request = chat_request(
        vec![ChatMessage::system("be brief"), ChatMessage::user("Hi")],
        Some("gpt-4o-mini"),
    );
    let response = adapter.chat(&request).await.unwrap();

    let (headers, body) = captured.lock().unwrap().take().unwrap();
    assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-test");
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "Hi");

    assert_eq!(response.id, "chatcmpl-123");
    let gateway = response.gateway.unwrap();
    assert_eq!(gateway.provider, "openai");
    assert_eq!(gateway.original_model.as_deref(), Some("gpt-4o-mini"));
    assert!(!gateway.cached);
    assert_eq!(gateway.retry_count, 0);
    assert!(!gateway.request_id.is_empty());
    let cost = gateway.estimated_cost.unwrap();
    assert!((cost - (10.0 * 0.000_000_15 + 4.0 * 0.000_000_6)).abs() < 1e-12);
}

#[tokio::test]
async fn gemini_adapter_folds_system_messages_and_uses_query_key() {
    let captured: Captured = Arc::new(Mutex::new(None));
    let queries: Arc<Mutex<Option<HashMap<String, String>>>> = Arc::new(Mutex::new(None));
    let capture = captured.clone();
    let query_capture = queries.clone();
    let upstream = Router::new().route(
        "/models/{action}",
        post(
            move |headers: HeaderMap,
                  Query(query): Query<HashMap<String, String>>,
                  Json(body): Json<Value>| {
                let capture = capture.clone();
                let query_capture = query_capture.clone();
                async move {
                    *capture.lock().unwrap() = Some((headers, body));
                    *query_capture.lock().unwrap() = Some(query);
                    Json(json!({
                        "candidates": [{
                            "content": { "parts": [{ "text": "Answer" }], "role": "model" },
                            "finishReason": "STOP"
                        }],
                        "usageMetadata": {
                            "promptTokenCount": 5,
                            "candidatesTokenCount": 7,
                            "totalTokenCount": 12
                        }
                    }))
                }
            },
        ),
    );
    let base = spawn_upstream(upstream).await;

    let mut provider_settings = settings(&base, "g-key");
    provider_settings.default_model = "gemini-2.5-flash".to_string();
    let adapter = Gemini::new(&provider_settings, Arc::new(Metrics::new()));

    let request = chat_request(
        vec![
            ChatMessage::system("A"),
            ChatMessage::system("B"),
            ChatMessage::user("Q"),
        ],
        None,
    );
    let response = adapter.chat(&request).await.unwrap();

    let (headers, body) = captured.lock().unwrap().take().unwrap();
    let query = queries.lock().unwrap().take().unwrap();
    assert_eq!(query.get("key").map(String::as_str), Some("g-key"));
    assert!(headers.get("authorization").is_none());
    assert_eq!(
        body["contents"],
        json!([{ "role": "user", "parts": [{ "text": "A\n\nB\n\nQ" }] }])
    );
    assert_eq!(body["generationConfig"]["temperature"], 0.7);

    assert_eq!(
        response.choices[0].message.as_ref().unwrap().content,
        "Answer"
    );
    assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
    let usage = response.usage.unwrap();
    assert_eq!(usage.prompt_tokens, Some(5));
    assert_eq!(usage.completion_tokens, Some(7));
    assert_eq!(response.gateway.unwrap().provider, "gemini");
}

#[tokio::test]
async fn gemini_adapter_embeds_via_embed_content() {
    let captured: Captured = Arc::new(Mutex::new(None));
    let capture = captured.clone();
    let upstream = Router::new().route(
        "/models/{action}",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let capture = capture.clone();
            async move {
                *capture.lock().unwrap() = Some((headers, body));
                Json(json!({ "embedding": { "values": [0.25, -0.5, 0.75] } }))
            }
        }),
    );
    let base = spawn_upstream(upstream).await;
    let adapter = Gemini::new(&settings(&base, "g-key"), Arc::new(Metrics::new()));

    let request = EmbeddingRequest {
        input: EmbeddingInput::Batch(vec!["one".to_string(), "two".to_string()]),
        model: Some("embedding-001".to_string()),
        ..EmbeddingRequest::default()
    };
    let response = adapter.embed(&request).await.unwrap();

    let (_, body) = captured.lock().unwrap().take().unwrap();
    assert_eq!(body["model"], "models/text-embedding-004");
    assert_eq!(body["content"]["parts"][0]["text"], "one");
    assert_eq!(body["content"]["parts"][1]["text"], "two");

    assert_eq!(response.object, "list");
    assert_eq!(response.data[0].embedding, vec![0.25, -0.5, 0.75]);
    assert_eq!(response.data[0].index, 0);
    // The metadata carries the caller's model hint, not the upstream default.
    assert_eq!(
        response.gateway.unwrap().original_model.as_deref(),
        Some("embedding-001")
    );
}

#[tokio::test]
async fn claude_adapter_restructures_system_and_maps_stop_reason() {
    let captured: Captured = Arc::new(Mutex::new(None));
    let capture = captured.clone();
    let upstream = Router::new().route(
        "/messages",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let capture = capture.clone();
            async move {
                *capture.lock().unwrap() = Some((headers, body));
                Json(json!({
                    "id": "msg_01",
                    "type": "message",
                    "role": "assistant",
                    "content": [{ "type": "text", "text": "Short answer" }],
                    "model": "claude-3-5-sonnet-20241022",
                    "stop_reason": "max_tokens",
                    "usage": { "input_tokens": 100, "output_tokens": 50 }
                }))
            }
        }),
    );
    let base = spawn_upstream(upstream).await;

    let mut provider_settings = settings(&base, "ck-test");
    provider_settings.default_model = "claude-3-5-sonnet-20241022".to_string();
    provider_settings.input_cost_per_token = 0.000_003;
    provider_settings.output_cost_per_token = 0.000_015;
    let adapter = Claude::new(&provider_settings, Arc::new(Metrics::new()));

    let request = chat_request(
        vec![
            ChatMessage::system("first"),
            ChatMessage::system("dropped"),
            ChatMessage::user("Q"),
        ],
        None,
    );
    let response = adapter.chat(&request).await.unwrap();

    let (headers, body) = captured.lock().unwrap().take().unwrap();
    assert_eq!(headers.get("x-api-key").unwrap(), "ck-test");
    assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
    assert!(headers.get("authorization").is_none());
    assert_eq!(body["system"], "first");
    assert_eq!(body["max_tokens"], 4096);
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    assert_eq!(body["messages"][0]["role"], "user");

    assert_eq!(response.id, "msg_01");
    assert_eq!(response.choices[0].finish_reason.as_deref(), Some("length"));
    let gateway = response.gateway.unwrap();
    let cost = gateway.estimated_cost.unwrap();
    assert!((cost - (100.0 * 0.000_003 + 50.0 * 0.000_015)).abs() < 1e-12);
}

#[tokio::test]
async fn claude_adapter_rejects_embeddings() {
    let adapter = Claude::new(
        &settings("http://localhost:9", "ck-test"),
        Arc::new(Metrics::new()),
    );
    let request = EmbeddingRequest {
        input: EmbeddingInput::Single("text".to_string()),
        ..EmbeddingRequest::default()
    };
    let err = adapter.embed(&request).await.unwrap_err();
    assert_eq!(err.code(), "capability_unsupported");
}

#[tokio::test]
async fn worker_adapter_serves_unauthenticated_with_zero_cost() {
    let upstream = Router::new()
        .route(
            "/v1/chat/completions",
            post(|headers: HeaderMap, Json(_): Json<Value>| async move {
                assert!(headers.get("authorization").is_none());
                Json(json!({
                    "id": "local-1",
                    "object": "chat.completion",
                    "created": 1_700_000_000,
                    "model": "local-llm",
                    "choices": [{
                        "index": 0,
                        "message": { "role": "assistant", "content": "local reply" },
                        "finish_reason": "stop"
                    }],
                    "usage": { "prompt_tokens": 2, "completion_tokens": 3, "total_tokens": 5 }
                }))
            }),
        )
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }));
    let base = spawn_upstream(upstream).await;

    let mut provider_settings = settings(&base, "");
    provider_settings.default_model = "local-llm".to_string();
    let adapter = LocalWorker::new(&provider_settings, Arc::new(Metrics::new()));

    assert!(adapter.available());
    assert!(adapter.health_check().await);

    let request = chat_request(vec![ChatMessage::user("Hi")], None);
    let response = adapter.chat(&request).await.unwrap();
    let gateway = response.gateway.unwrap();
    assert_eq!(gateway.provider, "local-worker");
    assert_eq!(gateway.estimated_cost, Some(0.0));
}

#[tokio::test]
async fn engine_falls_back_across_real_adapters() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempt_counter = attempts.clone();
    let failing = Router::new().route(
        "/chat/completions",
        post(move |Json(_): Json<Value>| {
            let attempt_counter = attempt_counter.clone();
            async move {
                attempt_counter.fetch_add(1, Ordering::SeqCst);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": "overloaded" })),
                )
            }
        }),
    );
    let failing_base = spawn_upstream(failing).await;

    let healthy = Router::new().route(
        "/messages",
        post(|Json(_): Json<Value>| async move {
            Json(json!({
                "id": "msg_02",
                "content": [{ "type": "text", "text": "backup answer" }],
                "stop_reason": "end_turn",
                "usage": { "input_tokens": 3, "output_tokens": 4 }
            }))
        }),
    );
    let healthy_base = spawn_upstream(healthy).await;

    let mut openai_settings = settings(&failing_base, "sk-test");
    openai_settings.priority = 10;
    openai_settings.default_model = "gpt-4o-mini".to_string();
    let mut claude_settings = settings(&healthy_base, "ck-test");
    claude_settings.priority = 20;
    claude_settings.default_model = "claude-3-5-sonnet-20241022".to_string();

    let metrics = Arc::new(Metrics::new());
    let engine = RoutingEngine::new(
        vec![
            Arc::new(OpenAI::new(&openai_settings, metrics.clone())),
            Arc::new(Claude::new(&claude_settings, metrics.clone())),
        ],
        RoutingSettings {
            retry_delay_ms: 1,
            ..RoutingSettings::default()
        },
        BreakerSettings {
            min_samples: 1000,
            ..BreakerSettings::default()
        },
        metrics,
    );

    let request = chat_request(vec![ChatMessage::user("Hi")], None);
    let response = engine.route_chat(&request).await.unwrap();

    let gateway = response.gateway.unwrap();
    assert_eq!(gateway.provider, "claude");
    assert_eq!(gateway.retry_count, 1);
    // initial attempt plus the default two retries against the 503 upstream
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        response.choices[0].message.as_ref().unwrap().content,
        "backup answer"
    );
}

#[tokio::test]
async fn openai_adapter_classifies_upstream_statuses() {
    let upstream = Router::new().route(
        "/chat/completions",
        post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
    );
    let base = spawn_upstream(upstream).await;
    let adapter = OpenAI::new(&settings(&base, "sk-test"), Arc::new(Metrics::new()));

    let request = chat_request(vec![ChatMessage::user("Hi")], None);
    let err = adapter.chat(&request).await.unwrap_err();
    assert_eq!(err.code(), "upstream_throttled");
    assert!(err.is_retryable());
}
