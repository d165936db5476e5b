use crate::error::ApiError;
use chrono::Utc;
use fieldsync_core::{ChangeOp, Cursor, EntityType, SyncError};
use fieldsync_proto::ChangeRecord;
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::{Row, SqliteConnection};

/// Append-only record of every mutation to a synchronizable entity.
///
/// Any device can ask for "everything since cursor X" without the
/// server rescanning the whole dataset. Records are ordered by
/// (recorded_at_ms, seq); seq is assigned at write time so replay is
/// deterministic even when two writes share a timestamp.
#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub fn new(pool: SqlitePool) -> Self {
        Ledger { pool }
    }

    /// Append one change record in its own transaction.
    pub async fn record(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        op: ChangeOp,
        version: i64,
        payload: Option<&Value>,
    ) -> Result<Cursor, ApiError> {
        let mut tx = self.pool.begin().await?;
        let cursor =
            record_in_tx(&mut *tx, entity_type, entity_id, op, version, payload).await?;
        tx.commit().await?;
        Ok(cursor)
    }

    /// Ordered page of changes with cursor strictly after `since`,
    /// restricted to the given entity types. Returns the records and
    /// the cursor to resume from; when the page is empty the resume
    /// cursor equals `since`.
    pub async fn delta(
        &self,
        entity_types: &[EntityType],
        since: Cursor,
        limit: i64,
    ) -> Result<(Vec<ChangeRecord>, Cursor), ApiError> {
        if entity_types.is_empty() {
            return Ok((Vec::new(), since));
        }
        let placeholders = vec!["?"; entity_types.len()].join(", ");
        let sql = format!(
            "SELECT seq, entity_type, entity_id, op, version, payload, recorded_at_ms
             FROM change_log
             WHERE entity_type IN ({placeholders})
               AND (recorded_at_ms > ? OR (recorded_at_ms = ? AND seq > ?))
             ORDER BY recorded_at_ms, seq
             LIMIT ?"
        );
        let mut query = sqlx::query(&sql);
        for t in entity_types {
            query = query.bind(t.as_str());
        }
        let rows = query
            .bind(since.ts_ms)
            .bind(since.ts_ms)
            .bind(since.seq)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let entity_type = EntityType::parse(&row.get::<String, _>("entity_type"))?;
            let op = ChangeOp::parse(&row.get::<String, _>("op"))?;
            let payload = row
                .get::<Option<String>, _>("payload")
                .map(|p| serde_json::from_str(&p))
                .transpose()?;
            records.push(ChangeRecord {
                cursor: Cursor::new(row.get("recorded_at_ms"), row.get("seq")),
                entity_type,
                entity_id: row.get("entity_id"),
                op,
                version: row.get("version"),
                payload,
            });
        }
        let next = records.last().map_or(since, |r| r.cursor);
        Ok((records, next))
    }

    /// Cursor of the most recent change, or ZERO when the ledger is empty.
    pub async fn head(&self) -> Result<Cursor, ApiError> {
        let row = sqlx::query(
            "SELECT recorded_at_ms, seq FROM change_log
             ORDER BY recorded_at_ms DESC, seq DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map_or(Cursor::ZERO, |r| {
            Cursor::new(r.get("recorded_at_ms"), r.get("seq"))
        }))
    }

    /// Fold records older than `floor` (the minimum active device cursor)
    /// into per-entity baselines: every superseded record below the floor
    /// is dropped, the newest record per entity is kept as its snapshot.
    ///
    /// Tombstones survive at least one full cycle: a deleted entity and
    /// its final delete record are only purged once they fall below the
    /// floor recorded by the previous compaction run. Returns the number
    /// of ledger rows removed.
    pub async fn compact(&self, floor: Cursor) -> Result<u64, ApiError> {
        let mut tx = self.pool.begin().await?;

        let prev_floor = read_compaction_floor(&mut *tx).await?;
        // A device registered since the last run can pull the floor back;
        // tombstone purging must respect both floors.
        let purge_floor = prev_floor.min(floor);

        // Records at or below the floor have been acknowledged by every
        // active device (delta delivery is strictly-after), so folding
        // them is safe; the newest record per entity stays as baseline.
        let superseded = sqlx::query(
            "DELETE FROM change_log
             WHERE (recorded_at_ms < ? OR (recorded_at_ms = ? AND seq <= ?))
               AND seq NOT IN (SELECT MAX(seq) FROM change_log GROUP BY entity_type, entity_id)",
        )
        .bind(floor.ts_ms)
        .bind(floor.ts_ms)
        .bind(floor.seq)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "DELETE FROM entities
             WHERE deleted = 1
               AND EXISTS (
                 SELECT 1 FROM change_log cl
                 WHERE cl.entity_type = entities.entity_type
                   AND cl.entity_id = entities.id
                   AND cl.op = 'delete'
                   AND (cl.recorded_at_ms < ? OR (cl.recorded_at_ms = ? AND cl.seq <= ?)))",
        )
        .bind(purge_floor.ts_ms)
        .bind(purge_floor.ts_ms)
        .bind(purge_floor.seq)
        .execute(&mut *tx)
        .await?;

        let purged_tombstones = sqlx::query(
            "DELETE FROM change_log
             WHERE op = 'delete'
               AND (recorded_at_ms < ? OR (recorded_at_ms = ? AND seq <= ?))",
        )
        .bind(purge_floor.ts_ms)
        .bind(purge_floor.ts_ms)
        .bind(purge_floor.seq)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // The stored floor never regresses.
        let new_floor = prev_floor.max(floor);
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES ('compaction_floor', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(new_floor.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(superseded + purged_tombstones)
    }
}

async fn read_compaction_floor(conn: &mut SqliteConnection) -> Result<Cursor, ApiError> {
    let row = sqlx::query("SELECT value FROM meta WHERE key = 'compaction_floor'")
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(r) => Ok(r.get::<String, _>("value").parse()?),
        None => Ok(Cursor::ZERO),
    }
}

/// Append one immutable change record inside the caller's transaction.
/// Every entity mutation and its ledger record commit or fail together.
/// A duplicate (entity type, id, version) triple fails with ConflictError.
pub async fn record_in_tx(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: i64,
    op: ChangeOp,
    version: i64,
    payload: Option<&Value>,
) -> Result<Cursor, ApiError> {
    let ts_ms = Utc::now().timestamp_millis();
    let payload_text = payload.map(|p| p.to_string());
    let result = sqlx::query(
        "INSERT INTO change_log (entity_type, entity_id, op, version, payload, recorded_at_ms)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(entity_type.as_str())
    .bind(entity_id)
    .bind(op.as_str())
    .bind(version)
    .bind(payload_text)
    .bind(ts_ms)
    .execute(&mut *conn)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ApiError::Sync(SyncError::Conflict {
                entity_type: entity_type.as_str().to_string(),
                entity_id,
                version,
            })
        }
        _ => ApiError::Db(e),
    })?;
    Ok(Cursor::new(ts_ms, result.last_insert_rowid()))
}
