use crate::auth::DeviceContext;
use crate::devices::Device;
use crate::error::ApiError;
use crate::reconcile;
use crate::store;
use crate::AppState;
use axum::{extract::State, Extension, Json};
use fieldsync_core::{ChangeOp, EntityType, SyncError};
use fieldsync_proto::{
    BulkUploadRequest, BulkUploadResponse, DeletedRecord, DeltaSet, IncrementalSyncRequest,
    IncrementalSyncResponse, InitialSyncRequest, InitialSyncResponse, OfflineRecord,
};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Full snapshot for a brand-new device: current live state per requested
/// type plus the ledger head cursor, which becomes the device's baseline
/// for incremental syncs.
pub async fn initial_sync(
    State(state): State<AppState>,
    Extension(ctx): Extension<DeviceContext>,
    Json(req): Json<InitialSyncRequest>,
) -> Result<Json<InitialSyncResponse>, ApiError> {
    state
        .devices
        .touch(&ctx.device_id, &ctx.user, ctx.platform.as_deref())
        .await?;
    let log_id = state
        .sync_logs
        .start(&ctx.device_id, &ctx.user, "initial")
        .await?;

    match run_initial(&state, &ctx, &req).await {
        Ok((resp, total)) => {
            finalize_ok(&state, log_id, total, total, 0).await;
            tracing::info!(device = %ctx.device_id, items = total, "initial sync completed");
            Ok(Json(resp))
        }
        Err(e) => {
            finalize_err(&state, log_id, &e).await;
            Err(e)
        }
    }
}

async fn run_initial(
    state: &AppState,
    ctx: &DeviceContext,
    req: &InitialSyncRequest,
) -> Result<(InitialSyncResponse, u64), ApiError> {
    let head = state.ledger.head().await?;
    let mut data = BTreeMap::new();
    let mut total = 0u64;
    for t in dedup_types(&req.data_types) {
        let rows = state.store.snapshot(t, state.limits.snapshot_limit).await?;
        total += rows.len() as u64;
        data.insert(
            t.as_str().to_string(),
            rows.iter().map(store::StoredEntity::to_wire).collect(),
        );
    }
    state.devices.set_cursor(&ctx.device_id, head).await?;
    Ok((
        InitialSyncResponse {
            data,
            sync_timestamp: head,
        },
        total,
    ))
}

/// Changes since the device's cursor, grouped per type into
/// created/updated/deleted.
///
/// Delivery is at-least-once: the returned cursor is never persisted
/// here. The client acknowledges by presenting it as `since` on its next
/// call, which is when the stored cursor advances; a lost response just
/// means the same delta is sent again. A `since` older than the
/// last-acknowledged cursor is a contract violation, not a resend.
pub async fn incremental_sync(
    State(state): State<AppState>,
    Extension(ctx): Extension<DeviceContext>,
    Json(req): Json<IncrementalSyncRequest>,
) -> Result<Json<IncrementalSyncResponse>, ApiError> {
    let device = state
        .devices
        .touch(&ctx.device_id, &ctx.user, ctx.platform.as_deref())
        .await?;
    let log_id = state
        .sync_logs
        .start(&ctx.device_id, &ctx.user, "incremental")
        .await?;

    match run_incremental(&state, &device, &req).await {
        Ok((resp, total)) => {
            finalize_ok(&state, log_id, total, total, 0).await;
            tracing::info!(device = %ctx.device_id, items = total, "incremental sync completed");
            Ok(Json(resp))
        }
        Err(e) => {
            finalize_err(&state, log_id, &e).await;
            Err(e)
        }
    }
}

async fn run_incremental(
    state: &AppState,
    device: &Device,
    req: &IncrementalSyncRequest,
) -> Result<(IncrementalSyncResponse, u64), ApiError> {
    if req.since < device.cursor {
        return Err(SyncError::CursorRegression {
            presented: req.since,
            acknowledged: device.cursor,
        }
        .into());
    }
    if req.since > device.cursor {
        // Implicit acknowledgment of the previously delivered delta.
        state.devices.set_cursor(&device.device_id, req.since).await?;
    }

    let types = dedup_types(&req.data_types);
    let (records, next) = state
        .ledger
        .delta(&types, req.since, state.limits.delta_page_size)
        .await?;
    let total = records.len() as u64;

    // Stable keys: every requested type appears even when unchanged.
    let mut deltas: BTreeMap<String, DeltaSet> = types
        .iter()
        .map(|t| (t.as_str().to_string(), DeltaSet::default()))
        .collect();
    for rec in records {
        let set = deltas.entry(rec.entity_type.as_str().to_string()).or_default();
        match rec.op {
            ChangeOp::Create => set.created.push(record_body(&rec)),
            ChangeOp::Update => set.updated.push(record_body(&rec)),
            ChangeOp::Delete => set.deleted.push(DeletedRecord {
                id: rec.entity_id,
                version: rec.version,
            }),
        }
    }

    Ok((
        IncrementalSyncResponse {
            deltas,
            sync_timestamp: next,
        },
        total,
    ))
}

fn record_body(rec: &fieldsync_proto::ChangeRecord) -> Value {
    let empty = Value::Object(serde_json::Map::new());
    let payload = rec.payload.as_ref().unwrap_or(&empty);
    store::wire_value(payload, rec.entity_id, rec.version)
}

/// Materialize offline-created records and return the temp-id mapping.
///
/// Batches are reconciled in dependency order (sites before assessments
/// before responses) so cross-type temp-id references resolve; within a
/// type, records keep client order. The download cursor is untouched:
/// upload and download positions are independent.
pub async fn bulk_upload(
    State(state): State<AppState>,
    Extension(ctx): Extension<DeviceContext>,
    Json(req): Json<BulkUploadRequest>,
) -> Result<Json<BulkUploadResponse>, ApiError> {
    state
        .devices
        .touch(&ctx.device_id, &ctx.user, ctx.platform.as_deref())
        .await?;

    // Reject unknown type keys before opening the sync log.
    let mut batches: Vec<(EntityType, &Vec<OfflineRecord>)> = Vec::new();
    for (key, records) in &req.batches {
        batches.push((EntityType::parse(key)?, records));
    }
    batches.sort_by_key(|(t, _)| *t);

    let total: u64 = batches.iter().map(|(_, r)| r.len() as u64).sum();
    let log_id = state
        .sync_logs
        .start(&ctx.device_id, &ctx.user, "upload")
        .await?;

    match run_bulk_upload(&state, &ctx, &batches).await {
        Ok(resp) => {
            let failed = resp.failures.len() as u64;
            finalize_ok(&state, log_id, total, total - failed, failed).await;
            tracing::info!(
                device = %ctx.device_id,
                items = total,
                failed,
                "bulk upload completed"
            );
            Ok(Json(resp))
        }
        Err(e) => {
            finalize_err(&state, log_id, &e).await;
            Err(e)
        }
    }
}

async fn run_bulk_upload(
    state: &AppState,
    ctx: &DeviceContext,
    batches: &[(EntityType, &Vec<OfflineRecord>)],
) -> Result<BulkUploadResponse, ApiError> {
    let mut resolved = BTreeMap::new();
    let mut mappings = BTreeMap::new();
    let mut created = BTreeMap::new();
    let mut failures = Vec::new();

    for (entity_type, records) in batches {
        let outcome = reconcile::reconcile_batch(
            &state.pool,
            &ctx.device_id,
            *entity_type,
            records.as_slice(),
            &mut resolved,
            &mut mappings,
        )
        .await?;
        created.insert(format!("{}_created", entity_type), outcome.created);
        failures.extend(outcome.failures);
    }

    Ok(BulkUploadResponse {
        created,
        mappings,
        failures,
    })
}

fn dedup_types(types: &[EntityType]) -> Vec<EntityType> {
    let mut seen = Vec::new();
    for t in types {
        if !seen.contains(t) {
            seen.push(*t);
        }
    }
    seen
}

async fn finalize_ok(state: &AppState, log_id: Uuid, total: u64, processed: u64, failed: u64) {
    if let Err(e) = state.sync_logs.complete(log_id, total, processed, failed).await {
        tracing::warn!(error = %e, %log_id, "failed to finalize sync log");
    }
}

async fn finalize_err(state: &AppState, log_id: Uuid, err: &ApiError) {
    if let Err(e) = state.sync_logs.fail(log_id, &err.to_string()).await {
        tracing::warn!(error = %e, %log_id, "failed to finalize sync log");
    }
}
