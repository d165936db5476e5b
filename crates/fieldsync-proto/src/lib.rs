//! Wire types shared between the FieldSync server and its mobile clients.
//!
//! Response bodies keep entity-type keyed payloads at the top level
//! (`{"sites": [...], "sync_timestamp": "..."}`) for compatibility with
//! existing clients; `#[serde(flatten)]` maps carry those keys. Schema
//! changes must be additive: new optional fields only, never renames.

use fieldsync_core::{ChangeOp, Cursor, EntityType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Header identifying the calling device on every sync request.
pub const DEVICE_ID_HEADER: &str = "x-device-id";
/// Optional header naming the device platform ("ios", "android", ...).
pub const DEVICE_PLATFORM_HEADER: &str = "x-device-platform";

/// One mutation observed by the change ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub cursor: Cursor,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub op: ChangeOp,
    pub version: i64,
    /// Snapshot of the entity after the mutation; absent for deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialSyncRequest {
    pub data_types: Vec<EntityType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialSyncResponse {
    /// Full snapshot per requested type, keyed by the type name.
    #[serde(flatten)]
    pub data: BTreeMap<String, Vec<Value>>,
    pub sync_timestamp: Cursor,
}

/// The device holds one cursor across all entity types, not one per
/// type. Acknowledging a delta (presenting its cursor as `since`)
/// advances past every change up to that point, including changes to
/// types the request did not ask for. A client that wants to start
/// syncing an additional type later must fetch it through a fresh
/// initial sync; its earlier history is behind the cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalSyncRequest {
    pub data_types: Vec<EntityType>,
    pub since: Cursor,
}

/// Changes to one entity type since a device's cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltaSet {
    pub created: Vec<Value>,
    pub updated: Vec<Value>,
    pub deleted: Vec<DeletedRecord>,
}

impl DeltaSet {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRecord {
    pub id: i64,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalSyncResponse {
    #[serde(flatten)]
    pub deltas: BTreeMap<String, DeltaSet>,
    pub sync_timestamp: Cursor,
}

/// One record created on-device while offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineRecord {
    /// Client-local identifier, unique within the batch.
    pub temp_id: String,
    /// Required retry guard: resubmitting the same key returns the
    /// previously assigned real id instead of creating a duplicate.
    pub idempotency_key: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkUploadRequest {
    /// Batches keyed by entity type name.
    #[serde(flatten)]
    pub batches: BTreeMap<String, Vec<OfflineRecord>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordFailure {
    pub temp_id: String,
    pub entity_type: EntityType,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkUploadResponse {
    /// Per-type creation counts, keyed as `<type>_created`.
    #[serde(flatten)]
    pub created: BTreeMap<String, u64>,
    /// temp_id to server-assigned id, successes only.
    pub mappings: BTreeMap<String, i64>,
    /// Records the client must fix and resubmit.
    pub failures: Vec<RecordFailure>,
}

/// Machine-readable error body for 4xx/5xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorBody {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn incremental_response_keeps_types_at_top_level() {
        let mut deltas = BTreeMap::new();
        deltas.insert(
            "sites".to_string(),
            DeltaSet {
                created: vec![json!({"id": 5, "version": 1})],
                updated: vec![],
                deleted: vec![DeletedRecord { id: 9, version: 4 }],
            },
        );
        let resp = IncrementalSyncResponse {
            deltas,
            sync_timestamp: Cursor::new(100, 7),
        };
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["sites"]["created"][0]["id"], 5);
        assert_eq!(v["sites"]["deleted"][0]["id"], 9);
        assert_eq!(v["sync_timestamp"], "100-7");

        let back: IncrementalSyncResponse = serde_json::from_value(v).unwrap();
        assert_eq!(back.deltas["sites"].len(), 2);
    }

    #[test]
    fn bulk_upload_request_parses_type_keyed_batches() {
        let req: BulkUploadRequest = serde_json::from_value(json!({
            "sites": [
                {"temp_id": "t1", "idempotency_key": "k1", "payload": {"name": "Camp A"}}
            ]
        }))
        .unwrap();
        assert_eq!(req.batches["sites"][0].temp_id, "t1");
    }
}
