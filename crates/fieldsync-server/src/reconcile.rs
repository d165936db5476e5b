use crate::error::ApiError;
use crate::store;
use fieldsync_core::{refs, EntityType, SyncError};
use fieldsync_proto::{OfflineRecord, RecordFailure};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::BTreeMap;

/// Result of materializing one type's batch of offline records.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub created: u64,
    pub failures: Vec<RecordFailure>,
}

/// Materialize a batch of offline-created records into the entity store.
///
/// Records are processed in client-submitted order. `resolved` is the
/// request-scoped temp-id map, shared across types so a record can
/// reference an entity created earlier in the same upload; entries are
/// added only for successes. One record's failure never aborts the
/// batch: validation and reference errors become per-record failures the
/// client retries later, and anything already committed stays committed
/// even if the client disconnects mid-batch. Only a persistence failure
/// propagates and fails the whole request.
///
/// A record whose idempotency key was already reconciled for this device
/// (a retry after a lost acknowledgment) maps to the previously assigned
/// id; no second entity is created.
pub async fn reconcile_batch(
    pool: &SqlitePool,
    device_id: &str,
    entity_type: EntityType,
    records: &[OfflineRecord],
    resolved: &mut BTreeMap<String, i64>,
    mappings: &mut BTreeMap<String, i64>,
) -> Result<BatchOutcome, ApiError> {
    let mut outcome = BatchOutcome::default();

    for record in records {
        if resolved.contains_key(&record.temp_id) {
            outcome.failures.push(failure(
                record,
                entity_type,
                "duplicate_temp_id",
                format!("temp id {:?} appears twice in this batch", record.temp_id),
            ));
            continue;
        }

        if let Some(existing) = prior_reconciliation(pool, device_id, record).await? {
            resolved.insert(record.temp_id.clone(), existing);
            mappings.insert(record.temp_id.clone(), existing);
            continue;
        }

        if !record.payload.is_object() {
            outcome.failures.push(failure(
                record,
                entity_type,
                "invalid_payload",
                "payload must be a JSON object".to_string(),
            ));
            continue;
        }

        let mut payload = record.payload.clone();
        if let Err(e) = refs::rewrite_temp_refs(&mut payload, resolved) {
            outcome
                .failures
                .push(failure(record, entity_type, e.code(), e.to_string()));
            continue;
        }

        match materialize(pool, device_id, entity_type, record, &payload).await? {
            Materialized::Created(id) => {
                outcome.created += 1;
                resolved.insert(record.temp_id.clone(), id);
                mappings.insert(record.temp_id.clone(), id);
            }
            Materialized::AlreadyReconciled(id) => {
                resolved.insert(record.temp_id.clone(), id);
                mappings.insert(record.temp_id.clone(), id);
            }
            Materialized::Failed(f) => outcome.failures.push(f),
        }
    }

    Ok(outcome)
}

enum Materialized {
    Created(i64),
    AlreadyReconciled(i64),
    Failed(RecordFailure),
}

/// Create the entity, its ledger record, and the reconciliation audit row
/// in one transaction.
async fn materialize(
    pool: &SqlitePool,
    device_id: &str,
    entity_type: EntityType,
    record: &OfflineRecord,
    payload: &Value,
) -> Result<Materialized, ApiError> {
    let mut tx = pool.begin().await?;
    let id = match store::insert_in_tx(&mut *tx, entity_type, payload).await {
        Ok(id) => id,
        Err(ApiError::Sync(e)) => {
            // Per-record contract violation; the batch keeps going.
            return Ok(Materialized::Failed(failure(
                record,
                entity_type,
                e.code(),
                e.to_string(),
            )));
        }
        Err(e) => return Err(e),
    };

    let inserted = sqlx::query(
        "INSERT INTO reconciliations (device_id, idempotency_key, entity_type, entity_id)
         VALUES (?, ?, ?, ?)",
    )
    .bind(device_id)
    .bind(&record.idempotency_key)
    .bind(entity_type.as_str())
    .bind(id)
    .execute(&mut *tx)
    .await;

    match inserted {
        Ok(_) => {
            tx.commit().await?;
            Ok(Materialized::Created(id))
        }
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            // A concurrent retry won the race; keep its entity, drop ours.
            drop(tx);
            let existing = prior_reconciliation(pool, device_id, record)
                .await?
                .ok_or(ApiError::Sync(SyncError::Conflict {
                    entity_type: entity_type.as_str().to_string(),
                    entity_id: id,
                    version: 1,
                }))?;
            Ok(Materialized::AlreadyReconciled(existing))
        }
        Err(e) => Err(ApiError::Db(e)),
    }
}

async fn prior_reconciliation(
    pool: &SqlitePool,
    device_id: &str,
    record: &OfflineRecord,
) -> Result<Option<i64>, ApiError> {
    let row = sqlx::query(
        "SELECT entity_id FROM reconciliations
         WHERE device_id = ? AND idempotency_key = ?",
    )
    .bind(device_id)
    .bind(&record.idempotency_key)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get("entity_id")))
}

fn failure(
    record: &OfflineRecord,
    entity_type: EntityType,
    code: &str,
    message: String,
) -> RecordFailure {
    RecordFailure {
        temp_id: record.temp_id.clone(),
        entity_type,
        code: code.to_string(),
        message,
    }
}
