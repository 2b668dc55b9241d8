use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{gateway_error, ApiError, AppState};
use crate::domain::{ConfigMap, Key, KeyId, PluginConfig, PluginInfo};
use crate::keys::{CreateKeyInput, UpdateKeyInput};

/// Key as exposed by the management API: everything except the secret and
/// its hash.
#[derive(Debug, Serialize)]
pub struct KeyView {
    pub id: KeyId,
    pub name: String,
    pub prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub auto_renew: bool,
    pub budget_usage: f64,
    pub last_reset_at: i64,
    pub created_at: i64,
    pub configuration: crate::domain::KeyConfiguration,
}

impl From<Key> for KeyView {
    fn from(key: Key) -> Self {
        Self {
            id: key.id,
            name: key.name,
            prefix: key.prefix,
            expires_at: key.expires_at.map(unix_secs),
            auto_renew: key.auto_renew,
            budget_usage: key.budget_usage,
            last_reset_at: unix_secs(key.last_reset_at),
            created_at: unix_secs(key.created_at),
            configuration: key.configuration,
        }
    }
}

fn unix_secs(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

fn from_unix_secs(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub provider_config: ConfigMap,
    #[serde(default)]
    pub middlewares: Vec<PluginConfig>,
    #[serde(default)]
    pub budget_limit: f64,
    #[serde(default)]
    pub reset_period: u64,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub auto_renew: bool,
}

#[derive(Debug, Serialize)]
pub struct CreateKeyResponse {
    /// Plaintext secret, returned exactly once.
    pub key: String,
    pub id: KeyId,
    pub prefix: String,
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<KeyView>>, ApiError> {
    let keys = state.keys.list().await.map_err(gateway_error)?;
    Ok(Json(keys.into_iter().map(KeyView::from).collect()))
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<CreateKeyResponse>), ApiError> {
    let input = CreateKeyInput {
        name: request.name,
        provider: PluginConfig {
            id: request.provider,
            config: request.provider_config,
        },
        middlewares: request.middlewares,
        budget_limit: request.budget_limit,
        reset_period_secs: request.reset_period,
        expires_at: request.expires_at.map(from_unix_secs),
        auto_renew: request.auto_renew,
    };

    let (raw, key) = state.keys.create(input).await.map_err(gateway_error)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateKeyResponse {
            key: raw,
            id: key.id,
            prefix: key.prefix,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UpdateKeyRequest {
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub provider_config: ConfigMap,
    #[serde(default)]
    pub middlewares: Vec<PluginConfig>,
    #[serde(default)]
    pub budget_limit: f64,
    #[serde(default)]
    pub reset_period: u64,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub auto_renew: bool,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<KeyId>,
    Json(request): Json<UpdateKeyRequest>,
) -> Result<StatusCode, ApiError> {
    let input = UpdateKeyInput {
        id,
        name: request.name,
        provider: PluginConfig {
            id: request.provider,
            config: request.provider_config,
        },
        middlewares: request.middlewares,
        budget_limit: request.budget_limit,
        reset_period_secs: request.reset_period,
        expires_at: request.expires_at.map(from_unix_secs),
        auto_renew: request.auto_renew,
    };

    state.keys.update(input).await.map_err(gateway_error)?;
    Ok(StatusCode::OK)
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<KeyId>,
) -> Result<StatusCode, ApiError> {
    state.keys.delete(id).await.map_err(gateway_error)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub providers: Vec<PluginInfo>,
}

pub async fn providers(State(state): State<AppState>) -> Json<ProvidersResponse> {
    Json(ProvidersResponse {
        providers: state.keys.list_providers(),
    })
}

pub async fn provider_usage(State(state): State<AppState>) -> Json<BTreeMap<String, f64>> {
    Json(state.keys.provider_usage().await)
}

#[derive(Debug, Serialize)]
pub struct MiddlewaresResponse {
    pub middlewares: Vec<PluginInfo>,
}

pub async fn middlewares(State(state): State<AppState>) -> Json<MiddlewaresResponse> {
    Json(MiddlewaresResponse {
        middlewares: state.keys.list_middlewares(),
    })
}
