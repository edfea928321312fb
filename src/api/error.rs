use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::query::QueryError;
use crate::queue::QueueError;
use crate::storage::StoreError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    /// The queue stopped accepting partway through a batch. The first
    /// `accepted` records were enqueued.
    PartiallyAccepted { accepted: usize, message: String },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, json!({ "message": m })),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, json!({ "message": m })),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, json!({ "message": m })),
            ApiError::PartiallyAccepted { accepted, message } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "message": message, "accepted": accepted }),
            ),
            ApiError::Internal(m) => {
                error!(error = %m, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "message": m }))
            }
        };
        (status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full { .. } => ApiError::Unavailable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::EmptyQuery => ApiError::BadRequest(e.to_string()),
            QueryError::Embedding(inner) if !inner.is_transient() => match inner {
                crate::embedding::EmbeddingError::InvalidInput(m) => ApiError::BadRequest(m),
                other => ApiError::Unavailable(other.to_string()),
            },
            QueryError::Embedding(inner) => ApiError::Unavailable(inner.to_string()),
            QueryError::Index(inner) => ApiError::Internal(inner.to_string()),
        }
    }
}
