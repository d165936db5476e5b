use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// Open (creating if needed) the sync database and initialize its schema.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db directory {}", parent.display()))?;
        }
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database {}", path.display()))?;
    init_schema(&pool).await?;
    Ok(pool)
}

async fn init_schema(pool: &SqlitePool) -> Result<()> {
    // Authoritative current state, one row per entity. Deletes are soft:
    // tombstone rows stay queryable so incremental clients can apply them.
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS entities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            version INTEGER NOT NULL,
            payload TEXT NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )"#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entities_type ON entities (entity_type, deleted)",
    )
    .execute(pool)
    .await?;

    // Append-only change ledger. The UNIQUE triple is the idempotency
    // guard: one change record per entity version, ever.
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS change_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id INTEGER NOT NULL,
            op TEXT NOT NULL,
            version INTEGER NOT NULL,
            payload TEXT,
            recorded_at_ms INTEGER NOT NULL,
            UNIQUE (entity_type, entity_id, version)
        )"#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_change_log_cursor
         ON change_log (entity_type, recorded_at_ms, seq)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS devices (
            device_id TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            platform TEXT NOT NULL DEFAULT 'unknown',
            cursor_ts_ms INTEGER NOT NULL DEFAULT 0,
            cursor_seq INTEGER NOT NULL DEFAULT 0,
            revoked INTEGER NOT NULL DEFAULT 0,
            registered_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            last_seen_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )"#,
    )
    .execute(pool)
    .await?;

    // Audit trail of reconciled offline records; the UNIQUE pair is the
    // duplicate-upload detector for client retries.
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS reconciliations (
            device_id TEXT NOT NULL,
            idempotency_key TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id INTEGER NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (device_id, idempotency_key)
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS sync_logs (
            id TEXT PRIMARY KEY,
            device_id TEXT NOT NULL,
            user TEXT NOT NULL,
            sync_type TEXT NOT NULL,
            status TEXT NOT NULL,
            total_items INTEGER NOT NULL DEFAULT 0,
            processed_items INTEGER NOT NULL DEFAULT 0,
            failed_items INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            started_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            completed_at TIMESTAMP
        )"#,
    )
    .execute(pool)
    .await?;

    // Single-row key/value state, currently only the previous compaction
    // floor (tombstones survive at least one full cycle).
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
