//! HTTP surface: canonical endpoints, identity extraction, and the
//! mapping from gateway errors to status codes and structured bodies.

pub mod admin;
pub mod chat;
pub mod embeddings;

use std::sync::Arc;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::cache::ResponseCache;
use crate::config::GatewayConfig;
use crate::limiter::{RateLimiter, RateLimitStatus};
use crate::metrics::Metrics;
use crate::providers::build_providers;
use crate::router::RoutingEngine;
use crate::{GatewayError, Result};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RoutingEngine>,
    pub cache: Arc<ResponseCache>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Wire every component from configuration; the composition the binary
    /// and the integration tests share.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let providers = build_providers(config, metrics.clone());
        let engine = Arc::new(RoutingEngine::new(
            providers,
            config.routing.clone(),
            config.breaker.clone(),
            metrics.clone(),
        ));
        let cache = Arc::new(ResponseCache::new(&config.cache, metrics.clone())?);
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit, metrics.clone()));
        Ok(Self {
            engine,
            cache,
            limiter,
            metrics,
        })
    }

    pub fn with_engine(mut self, engine: RoutingEngine) -> Self {
        self.engine = Arc::new(engine);
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat::completions))
        .route("/v1/chat/completions/stream", post(chat::completions_stream))
        .route("/v1/embeddings", post(embeddings::create))
        .route("/v1/models", get(admin::list_models))
        .route("/health", get(admin::health))
        .route("/health/detailed", get(admin::health_detailed))
        .route("/metrics", get(admin::metrics))
        .route("/admin/cache", delete(admin::clear_cache))
        .route(
            "/admin/ratelimit/{identifier}",
            get(admin::ratelimit_status).delete(admin::ratelimit_reset),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub code: String,
}

pub(crate) fn error_response(err: &GatewayError) -> Response {
    let (status, kind) = match err {
        GatewayError::InvalidRequest(_) | GatewayError::CapabilityUnsupported { .. } => {
            (StatusCode::BAD_REQUEST, "invalid_request_error")
        }
        GatewayError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error"),
        GatewayError::NoProvidersAvailable | GatewayError::ProviderUnavailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
    };
    let body = ErrorBody {
        error: ErrorDetail {
            kind: kind.to_string(),
            message: err.to_string(),
            code: err.code().to_string(),
        },
    };
    (status, Json(body)).into_response()
}

/// First non-empty of the API-key header, the bearer token, or `anonymous`.
pub(crate) fn extract_identifier(headers: &HeaderMap) -> String {
    if let Some(api_key) = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        return api_key.to_string();
    }
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        return token.to_string();
    }
    "anonymous".to_string()
}

pub(crate) fn apply_rate_limit_headers(
    response: &mut Response,
    rate: &RateLimitStatus,
    request_id: Option<&str>,
) {
    let headers = response.headers_mut();
    for (name, value) in [
        ("x-ratelimit-limit", rate.limit.to_string()),
        ("x-ratelimit-remaining", rate.remaining.to_string()),
        ("x-ratelimit-reset", rate.reset_seconds.to_string()),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    if let Some(request_id) = request_id {
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert("x-request-id", value);
        }
    }
}

pub(crate) fn rate_limited_response(rate: &RateLimitStatus) -> Response {
    let mut response = error_response(&GatewayError::RateLimited);
    apply_rate_limit_headers(&mut response, rate, None);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_prefers_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("key-1"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok-1"),
        );
        assert_eq!(extract_identifier(&headers), "key-1");
    }

    #[test]
    fn identifier_falls_back_to_bearer_then_anonymous() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok-1"),
        );
        assert_eq!(extract_identifier(&headers), "tok-1");

        assert_eq!(extract_identifier(&HeaderMap::new()), "anonymous");
    }

    #[test]
    fn error_statuses_follow_the_taxonomy() {
        let cases = [
            (
                GatewayError::InvalidRequest("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (GatewayError::RateLimited, StatusCode::TOO_MANY_REQUESTS),
            (
                GatewayError::NoProvidersAvailable,
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::CapabilityUnsupported {
                    provider: "claude".into(),
                    operation: "embeddings",
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                GatewayError::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(error_response(&err).status(), expected, "{err}");
        }
    }
}
