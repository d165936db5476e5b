use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use fieldsync_core::SyncError;
use fieldsync_proto::ErrorBody;
use thiserror::Error;

/// Request-level failure surfaced to the client as a machine-readable
/// error body. Per-record bulk-upload failures never reach this type;
/// they are folded into the response by the reconciliation mapper.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{message}")]
    BadRequest {
        code: &'static str,
        message: String,
    },

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// A stored payload failed to parse back; only possible with a
    /// corrupted database.
    #[error("stored payload corrupted: {0}")]
    CorruptPayload(#[from] serde_json::Error),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &str) {
        match self {
            ApiError::Sync(e) => {
                let status = match e {
                    SyncError::Conflict { .. }
                    | SyncError::VersionConflict { .. }
                    | SyncError::CursorRegression { .. } => StatusCode::CONFLICT,
                    SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
                    SyncError::UnresolvedReference { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    SyncError::InvalidCursor(_) | SyncError::UnknownEntityType(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    SyncError::DeviceRevoked(_) => StatusCode::FORBIDDEN,
                    SyncError::UnknownOperation(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.code())
            }
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::BadRequest { code, .. } => (StatusCode::BAD_REQUEST, code),
            ApiError::Db(_) | ApiError::CorruptPayload(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = if status.is_server_error() {
            // Persistence details stay in the logs, not on the wire.
            tracing::error!(error = %self, "request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(ErrorBody::new(code, message))).into_response()
    }
}
