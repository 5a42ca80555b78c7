//! Error types for Recall.
//!
//! Uses thiserror for ergonomic error definitions that integrate
//! with axum's response system. Failures of optional backends (vector
//! store, embeddings, LLM) normally never reach this type: services
//! degrade instead, see `services::capabilities::Degraded`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Llm(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_)
            | Self::VectorStore(_)
            | Self::Embedding(_)
            | Self::Internal(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::VectorStore(_) => "VECTOR_STORE_ERROR",
            Self::Embedding(_) => "EMBEDDING_ERROR",
            Self::Llm(_) => "LLM_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "UNKNOWN_ERROR",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        // Storage details stay in the logs
        let message = match &self {
            Self::Database(e) => {
                tracing::error!(error = %e, "Database error");
                "Database error".to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<recall_qdrant::Error> for Error {
    fn from(err: recall_qdrant::Error) -> Self {
        Self::VectorStore(err.to_string())
    }
}

impl From<recall_embeddings::Error> for Error {
    fn from(err: recall_embeddings::Error) -> Self {
        Self::Embedding(err.to_string())
    }
}

impl From<recall_llm::Error> for Error {
    fn from(err: recall_llm::Error) -> Self {
        Self::Llm(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::Unauthenticated.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::Forbidden("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(Error::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::Forbidden("x".into()).error_code(), "FORBIDDEN");
    }
}
