use crate::error::ApiError;
use crate::ledger;
use fieldsync_core::{ChangeOp, EntityType, SyncError};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::{Row, SqliteConnection};

/// Current authoritative state of one entity.
#[derive(Debug, Clone)]
pub struct StoredEntity {
    pub id: i64,
    pub entity_type: EntityType,
    pub version: i64,
    pub payload: Value,
    pub deleted: bool,
}

impl StoredEntity {
    /// Payload with `id` and `version` merged in, the shape clients see.
    pub fn to_wire(&self) -> Value {
        wire_value(&self.payload, self.id, self.version)
    }
}

/// Merge server-assigned identity into a payload object.
pub fn wire_value(payload: &Value, id: i64, version: i64) -> Value {
    let mut map = match payload {
        Value::Object(m) => m.clone(),
        other => {
            let mut m = serde_json::Map::new();
            m.insert("data".to_string(), other.clone());
            m
        }
    };
    map.insert("id".to_string(), Value::from(id));
    map.insert("version".to_string(), Value::from(version));
    Value::Object(map)
}

/// Authoritative server-side store for synchronizable entities.
///
/// Every successful mutation writes exactly one change-ledger record in
/// the same transaction; the rest of sync depends on that invariant.
/// Writes are optimistic: callers carry the version they read at, and a
/// stale version is rejected rather than overwritten.
#[derive(Clone)]
pub struct EntityStore {
    pool: SqlitePool,
}

impl EntityStore {
    pub fn new(pool: SqlitePool) -> Self {
        EntityStore { pool }
    }

    /// Current state, including tombstones (`deleted` set). Unknown id
    /// fails with NotFoundError.
    pub async fn get(&self, entity_type: EntityType, id: i64) -> Result<StoredEntity, ApiError> {
        let row = sqlx::query(
            "SELECT id, version, payload, deleted FROM entities
             WHERE entity_type = ? AND id = ?",
        )
        .bind(entity_type.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SyncError::NotFound {
            entity_type: entity_type.as_str().to_string(),
            entity_id: id,
        })?;
        Ok(StoredEntity {
            id: row.get("id"),
            entity_type,
            version: row.get("version"),
            payload: serde_json::from_str(&row.get::<String, _>("payload"))?,
            deleted: row.get::<i64, _>("deleted") != 0,
        })
    }

    /// Live entities of one type, oldest first, capped for mobile payloads.
    pub async fn snapshot(
        &self,
        entity_type: EntityType,
        limit: i64,
    ) -> Result<Vec<StoredEntity>, ApiError> {
        let rows = sqlx::query(
            "SELECT id, version, payload FROM entities
             WHERE entity_type = ? AND deleted = 0
             ORDER BY id
             LIMIT ?",
        )
        .bind(entity_type.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            entities.push(StoredEntity {
                id: row.get("id"),
                entity_type,
                version: row.get("version"),
                payload: serde_json::from_str(&row.get::<String, _>("payload"))?,
                deleted: false,
            });
        }
        Ok(entities)
    }

    /// Assign a new server id at version 1 and log the creation.
    pub async fn create(
        &self,
        entity_type: EntityType,
        payload: Value,
    ) -> Result<StoredEntity, ApiError> {
        let mut tx = self.pool.begin().await?;
        let id = insert_in_tx(&mut *tx, entity_type, &payload).await?;
        tx.commit().await?;
        Ok(StoredEntity {
            id,
            entity_type,
            version: 1,
            payload,
            deleted: false,
        })
    }

    /// Optimistic-concurrency update. `expected_version` must match the
    /// stored version or the write fails with VersionConflictError and
    /// the caller re-fetches. Tombstoned entities read as not found.
    pub async fn upsert(
        &self,
        entity_type: EntityType,
        id: i64,
        payload: Value,
        expected_version: i64,
    ) -> Result<StoredEntity, ApiError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE entities
             SET version = version + 1, payload = ?, updated_at = CURRENT_TIMESTAMP
             WHERE entity_type = ? AND id = ? AND version = ? AND deleted = 0",
        )
        .bind(payload.to_string())
        .bind(entity_type.as_str())
        .bind(id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(stale_write_error(&mut *tx, entity_type, id, expected_version).await);
        }

        let version = expected_version + 1;
        ledger::record_in_tx(&mut *tx, entity_type, id, ChangeOp::Update, version, Some(&payload))
            .await?;
        tx.commit().await?;
        Ok(StoredEntity {
            id,
            entity_type,
            version,
            payload,
            deleted: false,
        })
    }

    /// Soft delete: the row becomes a tombstone and the ledger records a
    /// delete so offline devices can apply it.
    pub async fn delete(
        &self,
        entity_type: EntityType,
        id: i64,
        expected_version: i64,
    ) -> Result<(), ApiError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE entities
             SET version = version + 1, deleted = 1, updated_at = CURRENT_TIMESTAMP
             WHERE entity_type = ? AND id = ? AND version = ? AND deleted = 0",
        )
        .bind(entity_type.as_str())
        .bind(id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(stale_write_error(&mut *tx, entity_type, id, expected_version).await);
        }

        ledger::record_in_tx(
            &mut *tx,
            entity_type,
            id,
            ChangeOp::Delete,
            expected_version + 1,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Insert a new entity and its creation record inside the caller's
/// transaction; used by both `create` and offline reconciliation.
pub(crate) async fn insert_in_tx(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    payload: &Value,
) -> Result<i64, ApiError> {
    let result = sqlx::query(
        "INSERT INTO entities (entity_type, version, payload) VALUES (?, 1, ?)",
    )
    .bind(entity_type.as_str())
    .bind(payload.to_string())
    .execute(&mut *conn)
    .await?;
    let id = result.last_insert_rowid();
    ledger::record_in_tx(conn, entity_type, id, ChangeOp::Create, 1, Some(payload)).await?;
    Ok(id)
}

/// Distinguish a missing/tombstoned entity from a stale version after a
/// guarded UPDATE matched no row.
async fn stale_write_error(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    id: i64,
    expected_version: i64,
) -> ApiError {
    let current = sqlx::query(
        "SELECT version, deleted FROM entities WHERE entity_type = ? AND id = ?",
    )
    .bind(entity_type.as_str())
    .bind(id)
    .fetch_optional(&mut *conn)
    .await;
    match current {
        Ok(Some(row)) if row.get::<i64, _>("deleted") == 0 => {
            ApiError::Sync(SyncError::VersionConflict {
                entity_type: entity_type.as_str().to_string(),
                entity_id: id,
                expected: expected_version,
                stored: row.get("version"),
            })
        }
        Ok(_) => ApiError::Sync(SyncError::NotFound {
            entity_type: entity_type.as_str().to_string(),
            entity_id: id,
        }),
        Err(e) => ApiError::Db(e),
    }
}
