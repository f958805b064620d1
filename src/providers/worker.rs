//! Passthrough adapter for the in-cluster inference worker.
//!
//! Same wire shape as the OpenAI-style upstream, but unauthenticated and
//! free: estimated cost is always zero.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};

use crate::metrics::Metrics;
use crate::provider::{next_request_id, AiProvider, Capabilities, ChatStream};
use crate::types::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::{GatewayError, Result};

use super::{base_metadata, join_url, patterns_or_default};
use crate::config::ProviderSettings;

const PROVIDER_NAME: &str = "local-worker";
const DEFAULT_MODELS: &[&str] = &["local-llm", "local-embed", "qwen", "llama", "mistral"];

pub struct LocalWorker {
    http: reqwest::Client,
    enabled: bool,
    base_url: String,
    default_model: String,
    priority: i32,
    patterns: Vec<String>,
    metrics: Arc<Metrics>,
}

impl LocalWorker {
    pub fn new(settings: &ProviderSettings, metrics: Arc<Metrics>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            enabled: settings.enabled,
            base_url: settings.base_url.clone(),
            default_model: settings.default_model.clone(),
            priority: settings.priority,
            patterns: patterns_or_default(&settings.models, DEFAULT_MODELS),
            metrics,
        }
    }

    fn resolve_model<'a>(&'a self, hint: Option<&'a str>) -> &'a str {
        hint.filter(|m| !m.trim().is_empty())
            .unwrap_or(self.default_model.as_str())
    }

    fn chat_body(request: &ChatRequest, model: &str, stream: bool) -> Value {
        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(model.to_string()));
        body.insert(
            "messages".to_string(),
            serde_json::to_value(&request.messages).unwrap_or_default(),
        );
        if let Some(temperature) = request.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            body.insert("max_tokens".to_string(), json!(max_tokens));
        }
        if let Some(top_p) = request.top_p {
            body.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(frequency_penalty) = request.frequency_penalty {
            body.insert("frequency_penalty".to_string(), json!(frequency_penalty));
        }
        if let Some(presence_penalty) = request.presence_penalty {
            body.insert("presence_penalty".to_string(), json!(presence_penalty));
        }
        if let Some(stop) = &request.stop {
            body.insert("stop".to_string(), json!(stop));
        }
        if let Some(user) = &request.user {
            body.insert("user".to_string(), json!(user));
        }
        if stream {
            body.insert("stream".to_string(), Value::Bool(true));
        }
        Value::Object(body)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(join_url(&self.base_url, path))
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
impl AiProvider for LocalWorker {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn available(&self) -> bool {
        self.enabled && !self.base_url.is_empty()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            chat: true,
            chat_stream: true,
            embedding: true,
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
        let response = match self.post_json("/v1/chat/completions", &body).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(provider = PROVIDER_NAME, error = %err, "chat failed");
                self.metrics.record_provider_request(PROVIDER_NAME, false);
                return Err(err);
            }
        };

        let mut parsed: ChatResponse = response.json().await.map_err(|err| {
            self.metrics.record_provider_request(PROVIDER_NAME, false);
            GatewayError::InvalidResponse(format!("worker chat response: {err}"))
        })?;

        let latency_ms = started.elapsed().as_millis() as u64;
        let mut gateway = base_metadata(
            PROVIDER_NAME,
            request.model.as_deref(),
            latency_ms,
            request_id,
        );
        gateway.estimated_cost = Some(0.0);
        parsed.gateway = Some(gateway);

        self.metrics.record_provider_request(PROVIDER_NAME, true);
        self.metrics
            .record_provider_latency_ms(PROVIDER_NAME, latency_ms);
        Ok(parsed)
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        if !self.available() {
            return Err(GatewayError::ProviderUnavailable {
                provider: PROVIDER_NAME.to_string(),
            });
        }

        let model = self.resolve_model(request.model.as_deref());
        let body = Self::chat_body(request, model, true);
        let response = self.post_json("/v1/chat/completions", &body).await?;

        let events = crate::utils::sse::data_event_stream(response);
        let chunks = events.map(|event| {
            event.and_then(|data| {
                serde_json::from_str::<ChatResponse>(&data).map_err(|err| {
                    GatewayError::InvalidResponse(format!("worker stream chunk: {err}"))
                })
            })
        });
        Ok(Box::pin(chunks))
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        if !self.available() {
            return Err(GatewayError::ProviderUnavailable {
                provider: PROVIDER_NAME.to_string(),
            });
        }

        let request_id = next_request_id();
        let started = Instant::now();

        let mut body = Map::<String, Value>::new();
        body.insert(
            "input".to_string(),
            serde_json::to_value(&request.input).unwrap_or_default(),
        );
        if let Some(model) = &request.model {
            body.insert("model".to_string(), json!(model));
        }

        let response = match self.post_json("/v1/embeddings", &Value::Object(body)).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(provider = PROVIDER_NAME, error = %err, "embed failed");
                self.metrics.record_provider_request(PROVIDER_NAME, false);
                return Err(err);
            }
        };

        let mut parsed: EmbeddingResponse = response.json().await.map_err(|err| {
            self.metrics.record_provider_request(PROVIDER_NAME, false);
            GatewayError::InvalidResponse(format!("worker embedding response: {err}"))
        })?;

        let latency_ms = started.elapsed().as_millis() as u64;
        let mut gateway = base_metadata(
            PROVIDER_NAME,
            request.model.as_deref(),
            latency_ms,
            request_id,
        );
        gateway.estimated_cost = Some(0.0);
        parsed.gateway = Some(gateway);

        self.metrics.record_provider_request(PROVIDER_NAME, true);
        self.metrics
            .record_provider_latency_ms(PROVIDER_NAME, latency_ms);
        Ok(parsed)
    }

    async fn health_check(&self) -> bool {
        if !self.available() {
            return false;
        }
        let result = self
            .http
            .get(join_url(&self.base_url, "/health"))
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::warn!(provider = PROVIDER_NAME, error = %err, "health check failed");
                false
            }
        }
    }
}
