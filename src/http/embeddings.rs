use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::types::EmbeddingRequest;
use crate::GatewayError;

use super::{
    apply_rate_limit_headers, error_response, extract_identifier, rate_limited_response, AppState,
};

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<EmbeddingRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(&GatewayError::InvalidRequest(rejection.body_text()));
        }
    };
    let identifier = extract_identifier(&headers);
    state.metrics.record_request("embedding");
    tracing::info!(
        model = request.model.as_deref().unwrap_or(""),
        provider = request.provider.as_deref().unwrap_or(""),
        "embedding request received"
    );

    if request.input.is_empty() {
        return error_response(&GatewayError::InvalidRequest(
            "input cannot be empty".to_string(),
        ));
    }

    let (allowed, rate) = state.limiter.try_consume(&identifier);
    if !allowed {
        return rate_limited_response(&rate);
    }

    match state.engine.route_embed(&request).await {
        Ok(routed) => {
            let request_id = routed
                .gateway
                .as_ref()
                .map(|gateway| gateway.request_id.clone());
            let mut response = (StatusCode::OK, Json(routed)).into_response();
            apply_rate_limit_headers(&mut response, &rate, request_id.as_deref());
            response
        }
        Err(err) => {
            tracing::error!(error = %err, "embedding request failed");
            state.metrics.record_request_error("embedding");
            error_response(&err)
        }
    }
}
