use crate::error::ApiError;
use sqlx::sqlite::SqlitePool;
use uuid::Uuid;

/// One row per synchronization attempt, created when the sync starts and
/// finalized when it ends. Completed rows are never mutated again; they
/// exist for observability only.
#[derive(Clone)]
pub struct SyncLogs {
    pool: SqlitePool,
}

impl SyncLogs {
    pub fn new(pool: SqlitePool) -> Self {
        SyncLogs { pool }
    }

    pub async fn start(
        &self,
        device_id: &str,
        user: &str,
        sync_type: &str,
    ) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO sync_logs (id, device_id, user, sync_type, status)
             VALUES (?, ?, ?, ?, 'in_progress')",
        )
        .bind(id.to_string())
        .bind(device_id)
        .bind(user)
        .bind(sync_type)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Finalize a successful attempt; `partial` when some items failed.
    pub async fn complete(
        &self,
        id: Uuid,
        total_items: u64,
        processed_items: u64,
        failed_items: u64,
    ) -> Result<(), ApiError> {
        let status = if failed_items > 0 { "partial" } else { "completed" };
        sqlx::query(
            "UPDATE sync_logs
             SET status = ?, total_items = ?, processed_items = ?, failed_items = ?,
                 completed_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(status)
        .bind(total_items as i64)
        .bind(processed_items as i64)
        .bind(failed_items as i64)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail(&self, id: Uuid, error_message: &str) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE sync_logs
             SET status = 'failed', error_message = ?, completed_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(error_message)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
