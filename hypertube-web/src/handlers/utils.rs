//! Response envelope and error mapping shared by the handlers

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hypertube_core::storage::StorageError;
use hypertube_core::{HypertubeError, TorrentError};
use serde::Serialize;

/// `{ "status": bool, "data": ... }` envelope of every response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    /// True on success
    pub status: bool,
    /// Payload on success, message on failure
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    /// Wraps a successful payload.
    pub fn ok(data: T) -> Json<Self> {
        Json(Self { status: true, data })
    }
}

/// Handler failure rendered as a failed envelope.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    /// HTTP status of the response
    pub status: StatusCode,
    /// Message placed in `data`
    pub message: String,
}

impl ApiError {
    /// Creates an error with an explicit status.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<HypertubeError> for ApiError {
    fn from(error: HypertubeError) -> Self {
        let status = match &error {
            HypertubeError::Storage(StorageError::RecordNotFound { .. })
            | HypertubeError::Torrent(TorrentError::Storage(StorageError::RecordNotFound {
                ..
            })) => StatusCode::NOT_FOUND,
            e if e.is_user_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.user_message())
    }
}

impl From<TorrentError> for ApiError {
    fn from(error: TorrentError) -> Self {
        // Undecodable torrents are a stored-data problem, not a bad request
        if let TorrentError::MalformedMetadata { .. } = &error {
            return Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                HypertubeError::from(error).user_message(),
            );
        }
        HypertubeError::from(error).into()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        HypertubeError::from(error).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("Request failed: {}", self.message);
        } else {
            tracing::warn!("Request rejected: {}", self.message);
        }
        let body = ApiResponse {
            status: false,
            data: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let missing = ApiError::from(TorrentError::Storage(StorageError::RecordNotFound {
            id: "1".to_string(),
        }));
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let malformed = ApiError::from(TorrentError::MalformedMetadata {
            reason: "bad".to_string(),
        });
        assert_eq!(malformed.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(malformed.message, "Invalid torrent file: bad");

        let scheme = ApiError::from(TorrentError::UnsupportedTrackerScheme {
            scheme: "wss".to_string(),
            url: "wss://t".to_string(),
        });
        assert_eq!(scheme.status, StatusCode::BAD_REQUEST);
    }
}
