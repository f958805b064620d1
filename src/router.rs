//! Candidate selection, retry, and fallback across provider adapters.
//!
//! Selection is deterministic: available adapters sorted by priority (name
//! breaks ties), the preference hint moved to the head, the model filter
//! applied only when it leaves at least one candidate, embedding-incapable
//! adapters dropped for embedding routing, and the list truncated to its
//! head when fallback is disabled.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::breaker::CircuitBreaker;
use crate::config::{BreakerSettings, RoutingSettings};
use crate::metrics::Metrics;
use crate::provider::{AiProvider, ChatStream};
use crate::types::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::{GatewayError, Result};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProviderStatus {
    pub configured: bool,
    pub healthy: bool,
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelListing {
    pub id: String,
    pub provider: String,
}

pub struct RoutingEngine {
    providers: Vec<Arc<dyn AiProvider>>,
    breakers: HashMap<String, CircuitBreaker>,
    routing: RoutingSettings,
    metrics: Arc<Metrics>,
}

impl RoutingEngine {
    pub fn new(
        providers: Vec<Arc<dyn AiProvider>>,
        routing: RoutingSettings,
        breaker: BreakerSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        let breakers = providers
            .iter()
            .map(|provider| {
                (
                    provider.name().to_string(),
                    CircuitBreaker::new(breaker.clone()),
                )
            })
            .collect();
        Self {
            providers,
            breakers,
            routing,
            metrics,
        }
    }

    pub async fn route_chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let candidates =
            self.candidates(request.provider.as_deref(), request.model.as_deref(), false);
        tracing::info!(
            provider_hint = request.provider.as_deref().unwrap_or(""),
            model = request.model.as_deref().unwrap_or(""),
            candidates = candidates.len(),
            "routing chat request"
        );
        if candidates.is_empty() {
            return Err(GatewayError::NoProvidersAvailable);
        }

        let mut last_error = None;
        let mut hops = 0u32;
        for provider in candidates {
            match self.chat_with_retry(provider.as_ref(), request).await {
                Ok(mut response) => {
                    if hops > 0 {
                        if let Some(gateway) = response.gateway.as_mut() {
                            gateway.retry_count += hops;
                        }
                    }
                    return Ok(response);
                }
                Err(err) => {
                    tracing::error!(provider = provider.name(), error = %err, "provider failed");
                    self.metrics.record_fallback(provider.name());
                    last_error = Some(err);
                    hops += 1;
                }
            }
        }
        Err(last_error.unwrap_or(GatewayError::NoProvidersAvailable))
    }

    pub async fn route_embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        let candidates =
            self.candidates(request.provider.as_deref(), request.model.as_deref(), true);
        tracing::info!(
            provider_hint = request.provider.as_deref().unwrap_or(""),
            candidates = candidates.len(),
            "routing embedding request"
        );
        if candidates.is_empty() {
            return Err(GatewayError::NoProvidersAvailable);
        }

        let mut last_error = None;
        let mut hops = 0u32;
        for provider in candidates {
            match self.embed_with_retry(provider.as_ref(), request).await {
                Ok(mut response) => {
                    if hops > 0 {
                        if let Some(gateway) = response.gateway.as_mut() {
                            gateway.retry_count += hops;
                        }
                    }
                    return Ok(response);
                }
                Err(err) => {
                    tracing::error!(provider = provider.name(), error = %err, "provider failed");
                    self.metrics.record_fallback(provider.name());
                    last_error = Some(err);
                    hops += 1;
                }
            }
        }
        Err(last_error.unwrap_or(GatewayError::NoProvidersAvailable))
    }

    /// Streaming disables retry and fallback: the head candidate's stream is
    /// forwarded as-is, since emitted tokens cannot be replayed.
    pub async fn route_chat_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let candidates =
            self.candidates(request.provider.as_deref(), request.model.as_deref(), false);
        let Some(provider) = candidates.into_iter().next() else {
            return Err(GatewayError::NoProvidersAvailable);
        };
        tracing::info!(provider = provider.name(), "streaming via provider");
        provider.chat_stream(request).await
    }

    pub async fn providers_status(&self) -> BTreeMap<String, ProviderStatus> {
        let checks = self.providers.iter().map(|provider| async move {
            (
                provider.name().to_string(),
                ProviderStatus {
                    configured: provider.available(),
                    healthy: provider.health_check().await,
                    priority: provider.priority(),
                },
            )
        });
        futures_util::future::join_all(checks).await.into_iter().collect()
    }

    /// Flat `{id, provider}` listing over currently-available adapters.
    pub fn advertised_models(&self) -> Vec<ModelListing> {
        let mut models = Vec::new();
        for provider in self.providers.iter().filter(|p| p.available()) {
            for id in provider.advertised_models() {
                models.push(ModelListing {
                    id,
                    provider: provider.name().to_string(),
                });
            }
        }
        models
    }

    fn candidates(
        &self,
        provider_hint: Option<&str>,
        model_hint: Option<&str>,
        embedding: bool,
    ) -> Vec<Arc<dyn AiProvider>> {
        let mut candidates: Vec<Arc<dyn AiProvider>> = self
            .providers
            .iter()
            .filter(|provider| provider.available())
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.name().cmp(b.name()))
        });

        if let Some(hint) = provider_hint.filter(|h| !h.is_empty()) {
            if let Some(position) = candidates
                .iter()
                .position(|provider| provider.name().eq_ignore_ascii_case(hint))
            {
                let preferred = candidates.remove(position);
                candidates.insert(0, preferred);
            }
        }

        if let Some(model) = model_hint.filter(|m| !m.is_empty()) {
            let matching: Vec<Arc<dyn AiProvider>> = candidates
                .iter()
                .filter(|provider| provider.supports_model(Some(model)))
                .cloned()
                .collect();
            if !matching.is_empty() {
                candidates = matching;
            }
        }

        if embedding {
            candidates.retain(|provider| provider.capabilities().embedding);
        }

        if !self.routing.fallback_enabled {
            candidates.truncate(1);
        }

        candidates
    }

    fn breaker_allows(&self, provider: &str) -> Result<()> {
        match self.breakers.get(provider) {
            Some(breaker) if !breaker.allow() => Err(GatewayError::ProviderUnavailable {
                provider: provider.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn record_outcome(&self, provider: &str, success: bool) {
        if let Some(breaker) = self.breakers.get(provider) {
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    async fn chat_with_retry(
        &self,
        provider: &dyn AiProvider,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        let name = provider.name();
        let mut attempt = 0u32;
        loop {
            self.breaker_allows(name)?;
            match provider.chat(request).await {
                Ok(response) => {
                    self.record_outcome(name, true);
                    return Ok(response);
                }
                Err(err) => {
                    self.record_outcome(name, false);
                    if attempt >= self.routing.max_retries || !err.is_retryable() {
                        return Err(err);
                    }
                    attempt += 1;
                    self.metrics.record_retry(name);
                    tracing::warn!(provider = name, attempt, error = %err, "retrying after error");
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                }
            }
        }
    }

    async fn embed_with_retry(
        &self,
        provider: &dyn AiProvider,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse> {
        let name = provider.name();
        let mut attempt = 0u32;
        loop {
            self.breaker_allows(name)?;
            match provider.embed(request).await {
                Ok(response) => {
                    self.record_outcome(name, true);
                    return Ok(response);
                }
                Err(err) => {
                    self.record_outcome(name, false);
                    if attempt >= self.routing.max_retries || !err.is_retryable() {
                        return Err(err);
                    }
                    attempt += 1;
                    self.metrics.record_retry(name);
                    tracing::warn!(provider = name, attempt, error = %err, "retrying after error");
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                }
            }
        }
    }

    /// Exponential backoff with deterministic half-jitter: the delay for
    /// attempt `n` lands in `[base/2, base]` where `base = delay * 2^(n-1)`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        let base = self
            .routing
            .retry_delay_ms
            .saturating_mul(1u64 << exponent);
        let spread = base / 2;
        let jitter = if spread == 0 {
            0
        } else {
            let micros = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_micros() as u64;
            hash64_fnv1a(&micros.to_le_bytes()) % (spread + 1)
        };
        Duration::from_millis(base - spread + jitter)
    }
}

fn hash64_fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
