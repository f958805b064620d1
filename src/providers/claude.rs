//! Adapter for Claude-shaped upstreams.
//!
//! The upstream takes a top-level `system` field separate from `messages`
//! and requires `max_tokens` on every request. Only the first system
//! message survives the translation; the upstream has no embedding API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::metrics::Metrics;
use crate::provider::{epoch_seconds, next_request_id, AiProvider, Capabilities, ChatStream};
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, Choice, EmbeddingRequest, EmbeddingResponse, Role,
    Usage,
};
use crate::{GatewayError, Result};

use super::{base_metadata, estimate_cost, join_url, patterns_or_default};
use crate::config::ProviderSettings;

const PROVIDER_NAME: &str = "claude";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_MODELS: &[&str] = &[
    "claude-3-5-sonnet",
    "claude-3-5-haiku",
    "claude-3-opus",
    "claude-3-sonnet",
    "claude-3-haiku",
];

pub struct Claude {
    http: reqwest::Client,
    enabled: bool,
    api_key: String,
    base_url: String,
    default_model: String,
    priority: i32,
    patterns: Vec<String>,
    input_cost_per_token: f64,
    output_cost_per_token: f64,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

impl Claude {
    pub fn new(settings: &ProviderSettings, metrics: Arc<Metrics>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            enabled: settings.enabled,
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.clone(),
            default_model: settings.default_model.clone(),
            priority: settings.priority,
            patterns: patterns_or_default(&settings.models, DEFAULT_MODELS),
            input_cost_per_token: settings.input_cost_per_token,
            output_cost_per_token: settings.output_cost_per_token,
            metrics,
        }
    }

    fn resolve_model<'a>(&'a self, hint: Option<&'a str>) -> &'a str {
        hint.filter(|m| !m.trim().is_empty())
            .unwrap_or(self.default_model.as_str())
    }

    /// The first system message becomes the top-level `system` field; any
    /// further system messages are dropped.
    fn chat_body(request: &ChatRequest, model: &str, stream: bool) -> Value {
        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(model.to_string()));
        body.insert(
            "max_tokens".to_string(),
            json!(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );

        let mut system: Option<&str> = None;
        let mut dropped_system = 0usize;
        let mut messages = Vec::<Value>::new();
        for message in &request.messages {
            if message.role == Role::System {
                if system.is_none() {
                    system = Some(message.content.as_str());
                } else {
                    dropped_system += 1;
                }
                continue;
            }
            messages.push(json!({
                "role": message.role.as_str(),
                "content": message.content,
            }));
        }
        if dropped_system > 0 {
            tracing::warn!(
                provider = PROVIDER_NAME,
                dropped = dropped_system,
                "dropping system messages after the first"
            );
        }
        if let Some(system) = system {
            body.insert("system".to_string(), Value::String(system.to_string()));
        }
        body.insert("messages".to_string(), Value::Array(messages));

        if let Some(temperature) = request.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            body.insert("top_p".to_string(), json!(top_p));
        }
        if stream {
            body.insert("stream".to_string(), Value::Bool(true));
        }
        Value::Object(body)
    }

    fn map_stop_reason(stop_reason: Option<&str>) -> String {
        match stop_reason {
            None | Some("end_turn") | Some("stop_sequence") => "stop".to_string(),
            Some("max_tokens") => "length".to_string(),
            Some(other) => other.to_string(),
        }
    }

    fn to_chat_response(parsed: MessagesResponse, model: &str, request_id: &str) -> ChatResponse {
        let content: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .concat();

        let usage = parsed
            .usage
            .map(|usage| Usage::with_total(usage.input_tokens, usage.output_tokens));

        ChatResponse {
            id: parsed
                .id
                .unwrap_or_else(|| format!("claude-{}", request_id.trim_start_matches("req-"))),
            object: "chat.completion".to_string(),
            created: epoch_seconds(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: Some(ChatMessage::assistant(content)),
                delta: None,
                finish_reason: Some(Self::map_stop_reason(parsed.stop_reason.as_deref())),
            }],
            usage,
            gateway: None,
        }
    }

    /// Translate one upstream stream event into a delta chunk, if it
    /// carries anything the client needs.
    fn stream_event_to_chunk(event: &Value, model: &str, request_id: &str) -> Option<ChatResponse> {
        let kind = event.get("type")?.as_str()?;
        let choice = match kind {
            "content_block_delta" => {
                let text = event
                    .get("delta")
                    .and_then(|delta| delta.get("text"))
                    .and_then(Value::as_str)?;
                Choice {
                    index: 0,
                    message: None,
                    delta: Some(ChatMessage::assistant(text)),
                    finish_reason: None,
                }
            }
            "message_delta" => {
                let stop_reason = event
                    .get("delta")
                    .and_then(|delta| delta.get("stop_reason"))
                    .and_then(Value::as_str)?;
                Choice {
                    index: 0,
                    message: None,
                    delta: None,
                    finish_reason: Some(Self::map_stop_reason(Some(stop_reason))),
                }
            }
            _ => return None,
        };

        Some(ChatResponse {
            id: format!("claude-{}", request_id.trim_start_matches("req-")),
            object: "chat.completion.chunk".to_string(),
            created: epoch_seconds(),
            model: model.to_string(),
            choices: vec![choice],
            usage: None,
            gateway: None,
        })
    }

    async fn post_messages(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(join_url(&self.base_url, "/messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|err| GatewayError::from_reqwest(PROVIDER_NAME, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(
                PROVIDER_NAME,
                status.as_u16(),
                body,
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl AiProvider for Claude {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn available(&self) -> bool {
        self.enabled && !self.api_key.is_empty()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            chat: true,
            chat_stream: true,
            embedding: false,
        }
    }

    fn model_patterns(&self) -> &[String] {
        &self.patterns
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        if !self.available() {
            return Err(GatewayError::ProviderUnavailable {
                provider: PROVIDER_NAME.to_string(),
            });
        }

        let request_id = next_request_id();
        let model = self.resolve_model(request.model.as_deref());
        let started = Instant::now();
        tracing::debug!(provider = PROVIDER_NAME, model, request_id, "chat request");

        let body = Self::chat_body(request, model, false);
        let response = match self.post_messages(&body).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(provider = PROVIDER_NAME, error = %err, "chat failed");
                self.metrics.record_provider_request(PROVIDER_NAME, false);
                return Err(err);
            }
        };

        let parsed: MessagesResponse = response.json().await.map_err(|err| {
            self.metrics.record_provider_request(PROVIDER_NAME, false);
            GatewayError::InvalidResponse(format!("claude chat response: {err}"))
        })?;

        let latency_ms = started.elapsed().as_millis() as u64;
        let mut chat_response = Self::to_chat_response(parsed, model, &request_id);
        let mut gateway = base_metadata(
            PROVIDER_NAME,
            request.model.as_deref(),
            latency_ms,
            request_id,
        );
        gateway.estimated_cost = Some(estimate_cost(
            chat_response.usage.as_ref(),
            self.input_cost_per_token,
            self.output_cost_per_token,
        ));
        chat_response.gateway = Some(gateway);

        self.metrics.record_provider_request(PROVIDER_NAME, true);
        self.metrics
            .record_provider_latency_ms(PROVIDER_NAME, latency_ms);
        Ok(chat_response)
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        if !self.available() {
            return Err(GatewayError::ProviderUnavailable {
                provider: PROVIDER_NAME.to_string(),
            });
        }

        let request_id = next_request_id();
        let model = self.resolve_model(request.model.as_deref()).to_string();
        let body = Self::chat_body(request, &model, true);
        let response = self.post_messages(&body).await?;

        let events = crate::utils::sse::data_event_stream(response);
        let chunks = events.filter_map(move |event| {
            let model = model.clone();
            let request_id = request_id.clone();
            futures_util::future::ready(match event {
                Err(err) => Some(Err(err)),
                Ok(data) => match serde_json::from_str::<Value>(&data) {
                    Err(err) => Some(Err(GatewayError::InvalidResponse(format!(
                        "claude stream chunk: {err}"
                    )))),
                    Ok(value) => {
                        Self::stream_event_to_chunk(&value, &model, &request_id).map(Ok)
                    }
                },
            })
        });
        Ok(Box::pin(chunks))
    }

    async fn embed(&self, _request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        Err(GatewayError::CapabilityUnsupported {
            provider: PROVIDER_NAME.to_string(),
            operation: "embeddings",
        })
    }

    async fn health_check(&self) -> bool {
        // No cheap probe endpoint upstream; configuration presence is the
        // only signal.
        self.available()
    }
}
