use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::{error_response, AppState};

const SERVICE_NAME: &str = "ai-gateway";

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

pub async fn health() -> Response {
    Json(json!({
        "status": "healthy",
        "timestamp": timestamp(),
        "service": SERVICE_NAME,
    }))
    .into_response()
}

pub async fn health_detailed(State(state): State<AppState>) -> Response {
    let providers = state.engine.providers_status().await;
    Json(json!({
        "status": "healthy",
        "timestamp": timestamp(),
        "service": SERVICE_NAME,
        "providers": providers,
    }))
    .into_response()
}

pub async fn list_models(State(state): State<AppState>) -> Response {
    let models = state.engine.advertised_models();
    Json(json!({
        "object": "list",
        "data": models,
    }))
    .into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    let body = state.metrics.render();
    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

#[derive(Debug, Deserialize)]
pub struct CacheQuery {
    pattern: Option<String>,
}

pub async fn clear_cache(
    State(state): State<AppState>,
    Query(query): Query<CacheQuery>,
) -> Response {
    let pattern = query.pattern.unwrap_or_else(|| "*".to_string());
    match state.cache.invalidate(&pattern).await {
        Ok(cleared) => {
            tracing::info!(pattern, cleared, "cache invalidated");
            Json(json!({ "status": "success", "cleared": cleared })).into_response()
        }
        Err(err) => {
            tracing::error!(pattern, error = %err, "cache invalidation failed");
            error_response(&err)
        }
    }
}

pub async fn ratelimit_status(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Response {
    let status = state.limiter.status(&identifier);
    Json(json!({
        "identifier": identifier,
        "limit": status.limit,
        "remaining": status.remaining,
        "resetSeconds": status.reset_seconds,
    }))
    .into_response()
}

pub async fn ratelimit_reset(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Response {
    state.limiter.reset(&identifier);
    Json(json!({ "status": "success", "identifier": identifier })).into_response()
}
