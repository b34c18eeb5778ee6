//! Admin route errors.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hirebridge_cache::CacheError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A subsystem the route depends on is not running.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl AdminError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid"),
            Self::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            Self::Cache(CacheError::InvalidKey(_) | CacheError::Configuration(_)) => {
                (StatusCode::BAD_REQUEST, "invalid")
            }
            Self::Cache(_) => (StatusCode::INTERNAL_SERVER_ERROR, "exception"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Admin request failed");
        }

        (status, Json(json!({ "code": code, "message": self.to_string() }))).into_response()
    }
}
