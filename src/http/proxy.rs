use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;

use super::{error_response, gateway_error, ApiError, AppState};
use crate::pipeline::{ProxyRequest, ResponseBody};

/// Inbound bodies are capped at 10 MiB; larger payloads fail before any
/// budget reservation.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let secret = bearer_token(&headers).ok_or_else(|| {
        error_response(StatusCode::UNAUTHORIZED, "missing bearer application key")
    })?;
    let key = state.keys.verify(secret).await.map_err(gateway_error)?;

    let body = to_bytes(body, MAX_BODY_BYTES).await.map_err(|_| {
        error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
    })?;

    let provider_selection = &key.configuration.provider;
    let provider = state
        .providers
        .get(&provider_selection.id)
        .ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                format!("provider not found: {}", provider_selection.id),
            )
        })?;
    let provider = if provider_selection.config.is_empty() {
        provider
    } else {
        provider
            .configure(&provider_selection.config)
            .map_err(gateway_error)?
    };

    let (model, stream) = provider.parse_request(&body).map_err(gateway_error)?;

    let request = ProxyRequest {
        key: Some(key),
        provider,
        model,
        body,
        stream,
        reserved_cost: 0.0,
        committer: None,
    };
    let response = state.pipeline.execute(request).await.map_err(gateway_error)?;

    let mut builder = Response::builder().status(response.status);
    if let Some(response_headers) = builder.headers_mut() {
        for (name, value) in response.headers.iter() {
            // The body is re-framed on the way out.
            if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
                continue;
            }
            response_headers.append(name, value.clone());
        }
    }

    let built = match response.body {
        ResponseBody::Buffered(bytes) => builder.body(Body::from(bytes)),
        ResponseBody::Stream(stream_body) => {
            if let Some(response_headers) = builder.headers_mut() {
                response_headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/event-stream"),
                );
                response_headers
                    .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            }
            builder.body(Body::from_stream(stream_body))
        }
    };

    built.map_err(|err| {
        tracing::error!(error = %err, "failed to build proxy response");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "")
    })
}
