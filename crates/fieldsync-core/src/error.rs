use crate::cursor::Cursor;
use thiserror::Error;

/// Errors in the sync contract between a device and the server.
///
/// Every variant maps to a stable machine-readable code via [`SyncError::code`],
/// which is what mobile clients switch on. Messages are for humans and may change.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A (entity type, entity id, version) triple was recorded twice in the
    /// change ledger. The ledger is append-only and idempotent per version.
    #[error("duplicate change record for {entity_type} #{entity_id} at version {version}")]
    Conflict {
        entity_type: String,
        entity_id: i64,
        version: i64,
    },

    /// An optimistic write carried a stale expected version.
    #[error("version conflict on {entity_type} #{entity_id}: expected {expected}, stored {stored}")]
    VersionConflict {
        entity_type: String,
        entity_id: i64,
        expected: i64,
        stored: i64,
    },

    #[error("{entity_type} #{entity_id} not found")]
    NotFound {
        entity_type: String,
        entity_id: i64,
    },

    /// A batch record referenced a temp id that has not been resolved yet.
    /// Clients must submit records in dependency order.
    #[error("unresolved reference {temp_id:?} in field {field:?}")]
    UnresolvedReference { field: String, temp_id: String },

    /// The client presented a cursor older than its last-acknowledged one.
    #[error("cursor regression: client presented {presented}, last acknowledged {acknowledged}")]
    CursorRegression {
        presented: Cursor,
        acknowledged: Cursor,
    },

    #[error("invalid cursor {0:?}")]
    InvalidCursor(String),

    #[error("unknown entity type {0:?}")]
    UnknownEntityType(String),

    /// A persisted change record carries an operation string this build
    /// does not know. Only possible with a corrupted or newer database.
    #[error("unknown change operation {0:?}")]
    UnknownOperation(String),

    #[error("device {0:?} has been revoked")]
    DeviceRevoked(String),
}

impl SyncError {
    /// Stable error code surfaced in HTTP error bodies and per-record failures.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Conflict { .. } => "conflict",
            SyncError::VersionConflict { .. } => "version_conflict",
            SyncError::NotFound { .. } => "not_found",
            SyncError::UnresolvedReference { .. } => "unresolved_reference",
            SyncError::CursorRegression { .. } => "cursor_regression",
            SyncError::InvalidCursor(_) => "invalid_cursor",
            SyncError::UnknownEntityType(_) => "unknown_entity_type",
            SyncError::UnknownOperation(_) => "internal",
            SyncError::DeviceRevoked(_) => "device_revoked",
        }
    }
}
