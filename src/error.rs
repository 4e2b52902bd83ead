use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::fetcher::FetchError;
use crate::search::{SearchError, SEARCH_FAILED_MESSAGE};

/// Handler error rendered as `{"error": "..."}` with a matching status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Invalid or missing admin token")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn internal(err: anyhow::Error) -> Self {
        error!("Internal error: {:#}", err);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        let status = match &err {
            FetchError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            FetchError::Status(404) => StatusCode::NOT_FOUND,
            FetchError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            FetchError::Status(_)
            | FetchError::Network(_)
            | FetchError::Decode(_)
            | FetchError::TooLarge(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<SearchError> for ApiError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::MissingQuery => Self::bad_request(err.to_string()),
            SearchError::Upstream(FetchError::Timeout) => FetchError::Timeout.into(),
            SearchError::Upstream(inner) => {
                let mapped = Self::from(inner);
                Self::new(mapped.status, SEARCH_FAILED_MESSAGE)
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "Request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
