use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Flag, segment or rollout absent
    #[error("{0} not found")]
    NotFound(String),

    /// Out-of-range percentage, empty user id, malformed key
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backing store could not be read or written
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for ServiceError {
    fn from(e: sqlx::Error) -> Self {
        ServiceError::UpstreamUnavailable(e.to_string())
    }
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ServiceError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "success": false, "error": self.to_string() }))).into_response()
    }
}
