use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use std::convert::Infallible;

use crate::provider::next_request_id;
use crate::types::ChatRequest;
use crate::GatewayError;

use super::{
    apply_rate_limit_headers, error_response, extract_identifier, rate_limited_response, AppState,
};

fn validate(request: &ChatRequest) -> Result<(), GatewayError> {
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages cannot be empty".to_string(),
        ));
    }
    Ok(())
}

pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(&GatewayError::InvalidRequest(rejection.body_text()));
        }
    };
    let identifier = extract_identifier(&headers);
    state.metrics.record_request("chat");
    tracing::info!(
        model = request.model.as_deref().unwrap_or(""),
        messages = request.messages.len(),
        provider = request.provider.as_deref().unwrap_or(""),
        "chat request received"
    );

    if let Err(err) = validate(&request) {
        return error_response(&err);
    }
    if request.stream {
        return error_response(&GatewayError::InvalidRequest(
            "use /v1/chat/completions/stream for streaming".to_string(),
        ));
    }

    let (allowed, rate) = state.limiter.try_consume(&identifier);
    if !allowed {
        return rate_limited_response(&rate);
    }

    if let Some(cached) = state.cache.lookup(&request).await {
        let request_id = cached
            .gateway
            .as_ref()
            .map(|gateway| gateway.request_id.clone());
        let mut response = (StatusCode::OK, Json(cached)).into_response();
        apply_rate_limit_headers(&mut response, &rate, request_id.as_deref());
        return response;
    }

    match state.engine.route_chat(&request).await {
        Ok(routed) => {
            state.cache.store(&request, &routed).await;
            let request_id = routed
                .gateway
                .as_ref()
                .map(|gateway| gateway.request_id.clone());
            let mut response = (StatusCode::OK, Json(routed)).into_response();
            apply_rate_limit_headers(&mut response, &rate, request_id.as_deref());
            response
        }
        Err(err) => {
            tracing::error!(error = %err, "chat request failed");
            state.metrics.record_request_error("chat");
            error_response(&err)
        }
    }
}

pub async fn completions_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(&GatewayError::InvalidRequest(rejection.body_text()));
        }
    };
    let identifier = extract_identifier(&headers);
    state.metrics.record_request("chat_stream");

    if let Err(err) = validate(&request) {
        return error_response(&err);
    }

    let (allowed, rate) = state.limiter.try_consume(&identifier);
    if !allowed {
        return rate_limited_response(&rate);
    }

    let mut request = request;
    request.stream = true;

    let upstream = match state.engine.route_chat_stream(&request).await {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::error!(error = %err, "streaming chat failed");
            state.metrics.record_request_error("chat_stream");
            return error_response(&err);
        }
    };

    // Events are framed as they arrive; a mid-stream failure ends the body
    // with no trailer, since emitted tokens cannot be taken back.
    let body_stream = stream::unfold((upstream, false), |(mut upstream, done)| async move {
        if done {
            return None;
        }
        match upstream.next().await {
            Some(Ok(chunk)) => {
                let payload = serde_json::to_string(&chunk).unwrap_or_default();
                let frame = Bytes::from(format!("data: {payload}\n\n"));
                Some((Ok::<_, Infallible>(frame), (upstream, false)))
            }
            Some(Err(err)) => {
                tracing::error!(error = %err, "stream terminated mid-flight");
                None
            }
            None => Some((
                Ok(Bytes::from_static(b"data: [DONE]\n\n")),
                (upstream, true),
            )),
        }
    });

    let mut response = Response::new(Body::from_stream(body_stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    let request_id = next_request_id();
    apply_rate_limit_headers(&mut response, &rate, Some(&request_id));
    response
}
