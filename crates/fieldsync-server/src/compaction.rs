use crate::error::ApiError;
use crate::AppState;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Periodic out-of-request ledger compaction. Never runs in the request
/// path; a failed cycle is logged and retried on the next tick.
pub fn spawn(state: AppState, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so a fresh server
        // does not compact before any device has synced.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match run_once(&state).await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "compacted change ledger");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "ledger compaction failed"),
            }
        }
    })
}

/// One compaction cycle. The floor is the minimum acknowledged cursor
/// across active devices: nothing at or above it may be folded, and with
/// no active devices (or one that has never synced) nothing is touched.
pub async fn run_once(state: &AppState) -> Result<u64, ApiError> {
    let Some(floor) = state.devices.min_active_cursor().await? else {
        return Ok(0);
    };
    if floor.is_zero() {
        return Ok(0);
    }
    state.ledger.compact(floor).await
}
