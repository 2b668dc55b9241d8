use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("key not found")]
    KeyNotFound,
    #[error("invalid application key")]
    InvalidKey,
    #[error("key has expired")]
    KeyExpired,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("provider not found: {0}")]
    ProviderNotFound(String),
    #[error("budget limit exceeded (limit: ${limit:.2}, attempted: ${attempted:.2})")]
    BudgetExceeded { limit: f64, attempted: f64 },
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::KeyNotFound | Self::InvalidKey | Self::KeyExpired => StatusCode::UNAUTHORIZED,
            Self::Validation(_) | Self::ProviderNotFound(_) => StatusCode::BAD_REQUEST,
            Self::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest errors render their URL; keep messages free of query strings
        // that could carry provider credentials.
        Self::Upstream(err.without_url().to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
