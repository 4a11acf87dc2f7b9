//! API error responses
//!
//! Every error body is `{"message": "..."}`. Client mistakes are 400, an
//! unknown message is 404 (not an error from the service's point of view),
//! anything else is a 500 with a generic message and the detail in the log.

use crate::queue::QueueError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found required header[{0}]")]
    MissingHeader(&'static str),

    #[error("{0} is required but was not found")]
    MissingParam(&'static str),

    #[error("{0} should be a number")]
    InvalidNumber(&'static str),

    #[error("invalid request body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingHeader(_)
            | ApiError::MissingParam(_)
            | ApiError::InvalidNumber(_)
            | ApiError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ApiError::Queue(QueueError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Queue(QueueError::InvalidChannel(_) | QueueError::InvalidEntryId(_)) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Queue(QueueError::Unavailable(_) | QueueError::Encode(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            error!(error = %self, "internal server error");
            "internal server error".to_string()
        } else {
            debug!(status = status.as_u16(), error = %self, "rejected request");
            self.to_string()
        };
        (status, Json(ErrorBody { message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EntryId, StoreError};

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::MissingHeader("x-line-signature").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Queue(QueueError::NotFound {
                entry_id: EntryId::new(1, 0)
            })
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Queue(QueueError::Unavailable(StoreError::Unavailable(
                "connection refused".to_string()
            )))
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            ApiError::MissingHeader("x-line-signature").to_string(),
            "not found required header[x-line-signature]"
        );
        assert_eq!(
            ApiError::MissingParam("consumer").to_string(),
            "consumer is required but was not found"
        );
    }
}
