//! Adapter for Gemini-shaped upstreams.
//!
//! The upstream consumes `contents` with `user`/`model` roles and a
//! separate `generationConfig`; there is no native system role, so leading
//! system messages are folded into the first user message. The credential
//! travels as a URL query parameter rather than a header.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::metrics::Metrics;
use crate::provider::{epoch_seconds, next_request_id, AiProvider, Capabilities, ChatStream};
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, Choice, EmbeddingData, EmbeddingRequest,
    EmbeddingResponse, Role, Usage,
};
use crate::{GatewayError, Result};

use super::{base_metadata, join_url, patterns_or_default};
use crate::config::ProviderSettings;

const PROVIDER_NAME: &str = "gemini";
const DEFAULT_MODELS: &[&str] = &[
    "gemini-2.5-flash",
    "gemini-2.5-pro",
    "gemini-2.0-flash",
    "gemini-2.0-pro",
    "text-embedding-004",
    "embedding-001",
];
const EMBEDDING_MODEL: &str = "text-embedding-004";

pub struct Gemini {
    http: reqwest::Client,
    enabled: bool,
    api_key: String,
    base_url: String,
    default_model: String,
    priority: i32,
    patterns: Vec<String>,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u32>,
    #[serde(default)]
    candidates_token_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EmbedContentResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    #[serde(default)]
    values: Vec<f32>,
}

impl Gemini {
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
            metrics,
        }
    }

    fn resolve_model<'a>(&'a self, hint: Option<&'a str>) -> &'a str {
        hint.filter(|m| !m.trim().is_empty())
            .unwrap_or(self.default_model.as_str())
    }

    /// Map canonical messages onto `contents`. System messages have no
    /// native role upstream: their texts are concatenated (blank-line
    /// separated) and prepended to the first user message that follows.
    /// A request that is all system text becomes a single user message.
    fn convert_messages(messages: &[ChatMessage]) -> Vec<Value> {
        let mut contents = Vec::<Value>::new();
        let mut pending_system = Vec::<&str>::new();

        for message in messages {
            if message.role == Role::System {
                pending_system.push(message.content.as_str());
                continue;
            }

            let role = match message.role {
                Role::Assistant => "model",
                _ => "user",
            };
            let mut text = message.content.clone();
            if message.role == Role::User && !pending_system.is_empty() {
                let mut folded = pending_system.join("\n\n");
                folded.push_str("\n\n");
                folded.push_str(&text);
                text = folded;
                pending_system.clear();
            }
            contents.push(json!({ "role": role, "parts": [{ "text": text }] }));
        }

        if contents.is_empty() && !pending_system.is_empty() {
            contents.push(json!({
                "role": "user",
                "parts": [{ "text": pending_system.join("\n\n") }],
            }));
        }

        contents
    }

    fn chat_body(request: &ChatRequest) -> Value {
        let mut body = Map::<String, Value>::new();
        body.insert(
            "contents".to_string(),
            Value::Array(Self::convert_messages(&request.messages)),
        );

        let mut generation_config = Map::<String, Value>::new();
        generation_config.insert("temperature".to_string(), json!(request.temperature_or_default()));
        if let Some(max_tokens) = request.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if let Some(top_p) = request.top_p {
            generation_config.insert("topP".to_string(), json!(top_p));
        }
        body.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );

        Value::Object(body)
    }

    fn map_finish_reason(reason: Option<&str>) -> String {
        match reason {
            None | Some("STOP") => "stop".to_string(),
            Some("MAX_TOKENS") => "length".to_string(),
            Some("SAFETY") => "content_filter".to_string(),
            Some(other) => other.to_lowercase(),
        }
    }

    fn to_chat_response(
        parsed: GenerateContentResponse,
        model: &str,
        request_id: &str,
        streaming: bool,
    ) -> ChatResponse {
        let candidate = parsed.candidates.first();
        let content: String = candidate
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .concat()
            })
            .unwrap_or_default();
        let finish_reason = candidate.and_then(|c| c.finish_reason.as_deref());

        let message = ChatMessage::assistant(content);
        let choice = if streaming {
            Choice {
                index: 0,
                message: None,
                delta: Some(message),
                finish_reason: finish_reason.map(|r| Self::map_finish_reason(Some(r))),
            }
        } else {
            Choice {
                index: 0,
                message: Some(message),
                delta: None,
                finish_reason: Some(Self::map_finish_reason(finish_reason)),
            }
        };

        let usage = parsed.usage_metadata.map(|usage| {
            Usage::with_total(usage.prompt_token_count, usage.candidates_token_count)
        });

        ChatResponse {
            id: format!("gemini-{}", request_id.trim_start_matches("req-")),
            object: "chat.completion".to_string(),
            created: epoch_seconds(),
            model: model.to_string(),
            choices: vec![choice],
            usage,
            gateway: None,
        }
    }

    async fn post_generate(&self, url: String, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(url)
            .query(&[("key", self.api_key.as_str())])
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
impl AiProvider for Gemini {
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

        let url = join_url(&self.base_url, &format!("/models/{model}:generateContent"));
        let body = Self::chat_body(request);
        let response = match self.post_generate(url, &body).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(provider = PROVIDER_NAME, error = %err, "chat failed");
                self.metrics.record_provider_request(PROVIDER_NAME, false);
                return Err(err);
            }
        };

        let parsed: GenerateContentResponse = response.json().await.map_err(|err| {
            self.metrics.record_provider_request(PROVIDER_NAME, false);
            GatewayError::InvalidResponse(format!("gemini chat response: {err}"))
        })?;

        let latency_ms = started.elapsed().as_millis() as u64;
        let mut chat_response = Self::to_chat_response(parsed, model, &request_id, false);
        chat_response.gateway = Some(base_metadata(
            PROVIDER_NAME,
            request.model.as_deref(),
            latency_ms,
            request_id,
        ));

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
        let url = join_url(
            &self.base_url,
            &format!("/models/{model}:streamGenerateContent"),
        );

        let body = Self::chat_body(request);
        let response = self
            .http
            .post(url)
            .query(&[("key", self.api_key.as_str()), ("alt", "sse")])
            .json(&body)
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

        let events = crate::utils::sse::data_event_stream(response);
        let chunks = events.map(move |event| {
            event.and_then(|data| {
                let parsed: GenerateContentResponse =
                    serde_json::from_str(&data).map_err(|err| {
                        GatewayError::InvalidResponse(format!("gemini stream chunk: {err}"))
                    })?;
                Ok(Self::to_chat_response(parsed, &model, &request_id, true))
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

        let parts: Vec<Value> = request
            .input
            .texts()
            .into_iter()
            .map(|text| json!({ "text": text }))
            .collect();
        let body = json!({
            "model": format!("models/{EMBEDDING_MODEL}"),
            "content": { "parts": parts },
        });

        let url = join_url(
            &self.base_url,
            &format!("/models/{EMBEDDING_MODEL}:embedContent"),
        );
        let response = match self.post_generate(url, &body).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(provider = PROVIDER_NAME, error = %err, "embed failed");
                self.metrics.record_provider_request(PROVIDER_NAME, false);
                return Err(err);
            }
        };

        let parsed: EmbedContentResponse = response.json().await.map_err(|err| {
            self.metrics.record_provider_request(PROVIDER_NAME, false);
            GatewayError::InvalidResponse(format!("gemini embedding response: {err}"))
        })?;

        let latency_ms = started.elapsed().as_millis() as u64;
        let embedding_response = EmbeddingResponse {
            object: "list".to_string(),
            data: vec![EmbeddingData {
                object: "embedding".to_string(),
                embedding: parsed.embedding.values,
                index: 0,
            }],
            model: EMBEDDING_MODEL.to_string(),
            usage: None,
            gateway: Some(base_metadata(
                PROVIDER_NAME,
                request.model.as_deref(),
                latency_ms,
                request_id,
            )),
        };

        self.metrics.record_provider_request(PROVIDER_NAME, true);
        self.metrics
            .record_provider_latency_ms(PROVIDER_NAME, latency_ms);
        Ok(embedding_response)
    }

    async fn health_check(&self) -> bool {
        if !self.available() {
            return false;
        }
        let result = self
            .http
            .get(join_url(&self.base_url, "/models"))
            .query(&[("key", self.api_key.as_str())])
            .timeout(Duration::from_secs(10))
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
