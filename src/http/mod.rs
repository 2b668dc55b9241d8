//! Management and proxy HTTP surface.

mod keys;
mod proxy;

use std::sync::Arc;

use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::GatewayError;
use crate::keys::KeyService;
use crate::pipeline::ProxyPipeline;
use crate::providers::ProviderRegistry;

#[derive(Clone)]
pub struct AppState {
    pub keys: Arc<KeyService>,
    pub providers: Arc<ProviderRegistry>,
    pub pipeline: Arc<ProxyPipeline>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(proxy::chat_completions))
        .route("/v1/config/app-keys", get(keys::list).post(keys::create))
        .route(
            "/v1/config/app-keys/:id",
            put(keys::update).delete(keys::delete),
        )
        .route("/v1/config/providers", get(keys::providers))
        .route("/v1/config/providers/usage", get(keys::provider_usage))
        .route("/v1/config/middlewares", get(keys::middlewares))
        .with_state(state)
}

pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origin = if allowed_origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok()),
        )
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: status
                .canonical_reason()
                .unwrap_or("Unknown")
                .to_string(),
            code: status.as_u16(),
            message: message.into(),
        }),
    )
}

pub(crate) fn gateway_error(err: GatewayError) -> ApiError {
    let status = err.status_code();
    // 5xx details stay in the log; clients get the generic reason.
    let message = if status.is_server_error() {
        tracing::error!(error = %err, "internal error");
        String::new()
    } else {
        err.to_string()
    };
    error_response(status, message)
}
