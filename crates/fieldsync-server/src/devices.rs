use crate::error::ApiError;
use fieldsync_core::{Cursor, SyncError};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

/// One mobile installation. Created on first sight of a new device id,
/// updated on every sync, soft-revoked on deauthorization, never
/// hard-deleted. The stored cursor is the device's last-acknowledged
/// download position in the change ledger.
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: String,
    pub user: String,
    pub platform: String,
    pub cursor: Cursor,
    pub revoked: bool,
}

#[derive(Clone)]
pub struct Devices {
    pool: SqlitePool,
}

impl Devices {
    pub fn new(pool: SqlitePool) -> Self {
        Devices { pool }
    }

    /// Register the device on first sight and bump last_seen. Fails with
    /// DeviceRevoked for a soft-revoked device.
    pub async fn touch(
        &self,
        device_id: &str,
        user: &str,
        platform: Option<&str>,
    ) -> Result<Device, ApiError> {
        sqlx::query(
            "INSERT INTO devices (device_id, user, platform) VALUES (?, ?, ?)
             ON CONFLICT(device_id) DO UPDATE SET
                 last_seen_at = CURRENT_TIMESTAMP,
                 platform = CASE
                     WHEN excluded.platform != 'unknown' THEN excluded.platform
                     ELSE devices.platform
                 END",
        )
        .bind(device_id)
        .bind(user)
        .bind(platform.unwrap_or("unknown"))
        .execute(&self.pool)
        .await?;

        let device = self.get(device_id).await?;
        if device.revoked {
            return Err(SyncError::DeviceRevoked(device_id.to_string()).into());
        }
        Ok(device)
    }

    pub async fn get(&self, device_id: &str) -> Result<Device, ApiError> {
        let row = sqlx::query(
            "SELECT device_id, user, platform, cursor_ts_ms, cursor_seq, revoked
             FROM devices WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SyncError::NotFound {
            entity_type: "devices".to_string(),
            entity_id: 0,
        })?;
        Ok(Device {
            device_id: row.get("device_id"),
            user: row.get("user"),
            platform: row.get("platform"),
            cursor: Cursor::new(row.get("cursor_ts_ms"), row.get("cursor_seq")),
            revoked: row.get::<i64, _>("revoked") != 0,
        })
    }

    /// Persist the device's acknowledged cursor. Callers enforce
    /// monotonicity before calling.
    pub async fn set_cursor(&self, device_id: &str, cursor: Cursor) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE devices SET cursor_ts_ms = ?, cursor_seq = ?, last_seen_at = CURRENT_TIMESTAMP
             WHERE device_id = ?",
        )
        .bind(cursor.ts_ms)
        .bind(cursor.seq)
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Soft-revoke: the device row stays for audit but all sync calls fail.
    pub async fn revoke(&self, device_id: &str) -> Result<(), ApiError> {
        sqlx::query("UPDATE devices SET revoked = 1 WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Oldest acknowledged cursor across active devices; the compaction
    /// floor. None when no active device exists (nothing may be folded:
    /// an unseen device could still need full history).
    pub async fn min_active_cursor(&self) -> Result<Option<Cursor>, ApiError> {
        let row = sqlx::query(
            "SELECT cursor_ts_ms, cursor_seq FROM devices
             WHERE revoked = 0
             ORDER BY cursor_ts_ms, cursor_seq
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| Cursor::new(r.get("cursor_ts_ms"), r.get("cursor_seq"))))
    }
}
