//! Passthrough adapter for OpenAI-shaped upstreams.
//!
//! The canonical chat and embedding shapes map almost one-to-one onto this
//! wire format, so requests are forwarded field-for-field and responses are
//! deserialized directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};

use crate::metrics::Metrics;
use crate::provider::{next_request_id, AiProvider, Capabilities, ChatStream};
use crate::types::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::{GatewayError, Result};

use super::{base_metadata, estimate_cost, join_url, patterns_or_default};
use crate::config::ProviderSettings;

const PROVIDER_NAME: &str = "openai";
const DEFAULT_MODELS: &[&str] = &[
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4-turbo",
    "gpt-4",
    "gpt-3.5-turbo",
    "text-embedding-3-small",
    "text-embedding-3-large",
    "text-embedding-ada-002",
];
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

pub struct OpenAI {
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

impl OpenAI {
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

    fn chat_body(&self, request: &ChatRequest, model: &str, stream: bool) -> Value {
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
            .bearer_auth(&self.api_key)
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
impl AiProvider for OpenAI {
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

        let body = self.chat_body(request, model, false);
        let result = self.post_json("/chat/completions", &body).await;
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(provider = PROVIDER_NAME, error = %err, "chat failed");
                self.metrics.record_provider_request(PROVIDER_NAME, false);
                return Err(err);
            }
        };

        let mut parsed: ChatResponse = response.json().await.map_err(|err| {
            self.metrics.record_provider_request(PROVIDER_NAME, false);
            GatewayError::InvalidResponse(format!("openai chat response: {err}"))
        })?;

        let latency_ms = started.elapsed().as_millis() as u64;
        let mut gateway = base_metadata(
            PROVIDER_NAME,
            request.model.as_deref(),
            latency_ms,
            request_id,
        );
        gateway.estimated_cost = Some(estimate_cost(
            parsed.usage.as_ref(),
            self.input_cost_per_token,
            self.output_cost_per_token,
        ));
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
        let body = self.chat_body(request, model, true);
        let response = self.post_json("/chat/completions", &body).await?;

        let events = crate::utils::sse::data_event_stream(response);
        let chunks = events.map(|event| {
            event.and_then(|data| {
                serde_json::from_str::<ChatResponse>(&data).map_err(|err| {
                    GatewayError::InvalidResponse(format!("openai stream chunk: {err}"))
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
        let model = request
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(DEFAULT_EMBEDDING_MODEL);
        let started = Instant::now();

        let mut body = Map::<String, Value>::new();
        body.insert("model".to_string(), Value::String(model.to_string()));
        body.insert(
            "input".to_string(),
            serde_json::to_value(&request.input).unwrap_or_default(),
        );
        if let Some(encoding_format) = &request.encoding_format {
            body.insert("encoding_format".to_string(), json!(encoding_format));
        }
        if let Some(dimensions) = request.dimensions {
            body.insert("dimensions".to_string(), json!(dimensions));
        }
        if let Some(user) = &request.user {
            body.insert("user".to_string(), json!(user));
        }

        let result = self.post_json("/embeddings", &Value::Object(body)).await;
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(provider = PROVIDER_NAME, error = %err, "embed failed");
                self.metrics.record_provider_request(PROVIDER_NAME, false);
                return Err(err);
            }
        };

        let mut parsed: EmbeddingResponse = response.json().await.map_err(|err| {
            self.metrics.record_provider_request(PROVIDER_NAME, false);
            GatewayError::InvalidResponse(format!("openai embedding response: {err}"))
        })?;

        let latency_ms = started.elapsed().as_millis() as u64;
        parsed.gateway = Some(base_metadata(
            PROVIDER_NAME,
            request.model.as_deref(),
            latency_ms,
            request_id,
        ));

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
            .get(join_url(&self.base_url, "/models"))
            .bearer_auth(&self.api_key)
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
