use axum_test::TestServer;
use fieldsync_core::{ChangeOp, Cursor, EntityType, SyncError};
use fieldsync_server::error::ApiError;
use fieldsync_server::{app, compaction, config::SyncSettings, db, AppState};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use serde_json::{json, Value};
use tempfile::TempDir;

const JWT_SECRET: &str = "fieldsync-test-secret";

#[derive(Serialize)]
struct Claims {
    sub: String,
    exp: usize,
}

fn bearer(user: &str) -> String {
    let exp = (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize;
    let claims = Claims {
        sub: user.to_string(),
        exp,
    };
    let jwt = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {jwt}")
}

async fn setup() -> (TestServer, AppState, TempDir) {
    setup_with_limits(SyncSettings::default()).await
}

async fn setup_with_limits(limits: SyncSettings) -> (TestServer, AppState, TempDir) {
    let dir = TempDir::new().unwrap();
    let pool = db::connect(&dir.path().join("sync.db")).await.unwrap();
    let state = AppState::new(pool, JWT_SECRET.to_string(), limits);
    let server = TestServer::new(app(state.clone())).unwrap();
    (server, state, dir)
}

async fn post_sync(server: &TestServer, device: &str, path: &str, body: Value) -> axum_test::TestResponse {
    server
        .post(path)
        .add_header("authorization", bearer("aid.worker@example.org"))
        .add_header("x-device-id", device.to_string())
        .json(&body)
        .await
}

#[tokio::test]
async fn health_endpoint_is_public() {
    let (server, _state, _dir) = setup().await;
    let response = server.get("/api/health").await;
    response.assert_status_ok();
    assert_eq!(response.text(), "OK");
}

#[tokio::test]
async fn sync_routes_require_token_and_device_id() {
    let (server, _state, _dir) = setup().await;

    // No bearer token at all.
    server
        .post("/api/sync/initial")
        .json(&json!({"data_types": ["sites"]}))
        .await
        .assert_status_unauthorized();

    // Token signed with the wrong secret.
    let claims = Claims {
        sub: "x".to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
    };
    let bad = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"wrong-secret"),
    )
    .unwrap();
    server
        .post("/api/sync/initial")
        .add_header("authorization", format!("Bearer {bad}"))
        .add_header("x-device-id", "device-1")
        .json(&json!({"data_types": ["sites"]}))
        .await
        .assert_status_unauthorized();

    // Valid token but no device header.
    let response = server
        .post("/api/sync/initial")
        .add_header("authorization", bearer("aid.worker@example.org"))
        .json(&json!({"data_types": ["sites"]}))
        .await;
    response.assert_status_bad_request();
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "missing_device_id");
}

#[tokio::test]
async fn initial_sync_returns_snapshot_and_excludes_tombstones() {
    let (server, state, _dir) = setup().await;

    let a = state
        .store
        .create(EntityType::Sites, json!({"name": "Camp A"}))
        .await
        .unwrap();
    state
        .store
        .create(EntityType::Sites, json!({"name": "Camp B"}))
        .await
        .unwrap();
    let gone = state
        .store
        .create(EntityType::Sites, json!({"name": "Closed"}))
        .await
        .unwrap();
    state
        .store
        .delete(EntityType::Sites, gone.id, 1)
        .await
        .unwrap();

    let response = post_sync(
        &server,
        "device-1",
        "/api/sync/initial",
        json!({"data_types": ["sites", "assessments"]}),
    )
    .await;
    response.assert_status_ok();
    let body: Value = response.json();

    let sites = body["sites"].as_array().unwrap();
    assert_eq!(sites.len(), 2);
    assert_eq!(sites[0]["id"], a.id);
    assert_eq!(sites[0]["version"], 1);
    assert_eq!(sites[0]["name"], "Camp A");
    assert_eq!(body["assessments"].as_array().unwrap().len(), 0);

    // Cursor is opaque but parseable, and becomes the device baseline.
    let head: Cursor = body["sync_timestamp"].as_str().unwrap().parse().unwrap();
    assert!(!head.is_zero());
    let device = state.devices.get("device-1").await.unwrap();
    assert_eq!(device.cursor, head);
}

#[tokio::test]
async fn incremental_sync_resends_until_acknowledged_then_rejects_regression() {
    let (server, state, _dir) = setup().await;

    // Baseline on an empty ledger.
    let response = post_sync(
        &server,
        "device-1",
        "/api/sync/initial",
        json!({"data_types": ["sites"]}),
    )
    .await;
    response.assert_status_ok();
    let baseline: Value = response.json();
    let since = baseline["sync_timestamp"].as_str().unwrap().to_string();
    assert_eq!(since, "0-0");

    let site = state
        .store
        .create(EntityType::Sites, json!({"name": "Camp A"}))
        .await
        .unwrap();
    state
        .store
        .upsert(EntityType::Sites, site.id, json!({"name": "Camp A (moved)"}), 1)
        .await
        .unwrap();

    let req = json!({"data_types": ["sites"], "since": since});
    let first: Value = post_sync(&server, "device-1", "/api/sync/incremental", req.clone())
        .await
        .json();
    assert_eq!(first["sites"]["created"].as_array().unwrap().len(), 1);
    assert_eq!(first["sites"]["updated"].as_array().unwrap().len(), 1);
    assert_eq!(first["sites"]["updated"][0]["version"], 2);

    // Client never stored the new cursor (lost response): the identical
    // delta comes back, proving no cursor advance without acknowledgment.
    let second: Value = post_sync(&server, "device-1", "/api/sync/incremental", req)
        .await
        .json();
    assert_eq!(first, second);

    // Acknowledge by presenting the new cursor; the delta drains.
    let next = first["sync_timestamp"].as_str().unwrap().to_string();
    let drained: Value = post_sync(
        &server,
        "device-1",
        "/api/sync/incremental",
        json!({"data_types": ["sites"], "since": next}),
    )
    .await
    .json();
    assert!(drained["sites"]["created"].as_array().unwrap().is_empty());
    assert!(drained["sites"]["updated"].as_array().unwrap().is_empty());

    // An out-of-order resend of the old cursor is now a regression.
    let response = post_sync(
        &server,
        "device-1",
        "/api/sync/incremental",
        json!({"data_types": ["sites"], "since": "0-0"}),
    )
    .await;
    response.assert_status(axum::http::StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "cursor_regression");
}

#[tokio::test]
async fn malformed_cursor_is_a_bad_request() {
    let (server, _state, _dir) = setup().await;
    let response = post_sync(
        &server,
        "device-1",
        "/api/sync/incremental",
        json!({"data_types": ["sites"], "since": "not-a-cursor"}),
    )
    .await;
    // Rejected during deserialization of the opaque cursor.
    assert!(response.status_code().is_client_error());
}

#[tokio::test]
async fn paginated_deltas_return_every_mutation_exactly_once_in_order() {
    let (server, state, _dir) = setup_with_limits(SyncSettings {
        snapshot_limit: 500,
        delta_page_size: 2,
    })
    .await;

    post_sync(
        &server,
        "device-1",
        "/api/sync/initial",
        json!({"data_types": ["sites"]}),
    )
    .await
    .assert_status_ok();

    let mut expected_ids = Vec::new();
    for i in 0..5 {
        let site = state
            .store
            .create(EntityType::Sites, json!({"name": format!("Camp {i}")}))
            .await
            .unwrap();
        expected_ids.push(site.id);
    }

    let mut since = "0-0".to_string();
    let mut seen_ids = Vec::new();
    loop {
        let body: Value = post_sync(
            &server,
            "device-1",
            "/api/sync/incremental",
            json!({"data_types": ["sites"], "since": since}),
        )
        .await
        .json();
        let created = body["sites"]["created"].as_array().unwrap();
        if created.is_empty() {
            break;
        }
        assert!(created.len() <= 2, "page size respected");
        for item in created {
            seen_ids.push(item["id"].as_i64().unwrap());
        }
        since = body["sync_timestamp"].as_str().unwrap().to_string();
    }

    assert_eq!(seen_ids, expected_ids, "each mutation once, in cursor order");
}

#[tokio::test]
async fn ledger_rejects_duplicate_change_records() {
    let (_server, state, _dir) = setup().await;

    let cursor = state
        .ledger
        .record(
            EntityType::Sites,
            1,
            ChangeOp::Create,
            1,
            Some(&json!({"name": "Camp A"})),
        )
        .await
        .unwrap();

    // Same (entity type, id, version) triple again: the ledger is
    // append-only and idempotent per version.
    let err = state
        .ledger
        .record(
            EntityType::Sites,
            1,
            ChangeOp::Create,
            1,
            Some(&json!({"name": "Camp A again"})),
        )
        .await
        .unwrap_err();
    match err {
        ApiError::Sync(SyncError::Conflict {
            entity_type,
            entity_id,
            version,
        }) => {
            assert_eq!(entity_type, "sites");
            assert_eq!(entity_id, 1);
            assert_eq!(version, 1);
        }
        other => panic!("expected conflict, got {other}"),
    }

    // Only the first record survives.
    let (records, _) = state
        .ledger
        .delta(&[EntityType::Sites], Cursor::ZERO, 100)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].cursor, cursor);
    assert_eq!(records[0].payload.as_ref().unwrap()["name"], "Camp A");

    // A new version of the same entity is a different triple and lands.
    state
        .ledger
        .record(EntityType::Sites, 1, ChangeOp::Update, 2, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn stale_optimistic_write_is_rejected() {
    let (_server, state, _dir) = setup().await;

    let site = state
        .store
        .create(EntityType::Sites, json!({"name": "Camp A"}))
        .await
        .unwrap();

    // Two writers read version 1; the first in wins.
    state
        .store
        .upsert(EntityType::Sites, site.id, json!({"name": "First"}), 1)
        .await
        .unwrap();
    let err = state
        .store
        .upsert(EntityType::Sites, site.id, json!({"name": "Second"}), 1)
        .await
        .unwrap_err();
    match err {
        ApiError::Sync(SyncError::VersionConflict {
            expected, stored, ..
        }) => {
            assert_eq!(expected, 1);
            assert_eq!(stored, 2);
        }
        other => panic!("expected version conflict, got {other}"),
    }

    // The losing write produced no change record.
    let current = state.store.get(EntityType::Sites, site.id).await.unwrap();
    assert_eq!(current.version, 2);
    assert_eq!(current.payload["name"], "First");
}

#[tokio::test]
async fn bulk_upload_maps_temp_ids_and_rewrites_references() {
    let (server, state, _dir) = setup().await;

    let response = post_sync(
        &server,
        "device-1",
        "/api/sync/bulk-upload",
        json!({
            "sites": [
                {"temp_id": "t1", "idempotency_key": "k1", "payload": {"name": "Camp A"}}
            ],
            "assessments": [
                {"temp_id": "t2", "idempotency_key": "k2",
                 "payload": {"site_temp_id": "t1", "notes": "water survey"}}
            ]
        }),
    )
    .await;
    response.assert_status_ok();
    let body: Value = response.json();

    assert_eq!(body["sites_created"], 1);
    assert_eq!(body["assessments_created"], 1);
    assert!(body["failures"].as_array().unwrap().is_empty());

    let site_id = body["mappings"]["t1"].as_i64().unwrap();
    let assessment_id = body["mappings"]["t2"].as_i64().unwrap();

    // The stored assessment carries the real foreign id, not the temp id.
    let assessment = state
        .store
        .get(EntityType::Assessments, assessment_id)
        .await
        .unwrap();
    assert_eq!(assessment.payload["site_id"], site_id);
    assert!(assessment.payload.get("site_temp_id").is_none());
}

#[tokio::test]
async fn out_of_order_reference_fails_only_the_referencing_record() {
    let (server, _state, _dir) = setup().await;

    let response = post_sync(
        &server,
        "device-1",
        "/api/sync/bulk-upload",
        json!({
            "assessments": [
                {"temp_id": "a2", "idempotency_key": "k2",
                 "payload": {"parent_temp_id": "a1", "round": 2}},
                {"temp_id": "a1", "idempotency_key": "k1", "payload": {"round": 1}}
            ]
        }),
    )
    .await;
    response.assert_status_ok();
    let body: Value = response.json();

    assert_eq!(body["assessments_created"], 1);
    assert!(body["mappings"].get("a1").is_some());
    assert!(body["mappings"].get("a2").is_none());

    let failures = body["failures"].as_array().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["temp_id"], "a2");
    assert_eq!(failures[0]["code"], "unresolved_reference");
}

#[tokio::test]
async fn resubmitted_batch_is_idempotent() {
    let (server, state, _dir) = setup().await;

    let batch = json!({
        "sites": [
            {"temp_id": "t1", "idempotency_key": "k1", "payload": {"name": "Camp A"}},
            {"temp_id": "t2", "idempotency_key": "k2", "payload": {"name": "Camp B"}}
        ]
    });

    let first: Value = post_sync(&server, "device-1", "/api/sync/bulk-upload", batch.clone())
        .await
        .json();
    assert_eq!(first["sites_created"], 2);

    // Retry after a lost acknowledgment: same mappings, nothing new created.
    let second: Value = post_sync(&server, "device-1", "/api/sync/bulk-upload", batch)
        .await
        .json();
    assert_eq!(second["sites_created"], 0);
    assert_eq!(second["mappings"], first["mappings"]);
    assert!(second["failures"].as_array().unwrap().is_empty());

    let sites = state.store.snapshot(EntityType::Sites, 100).await.unwrap();
    assert_eq!(sites.len(), 2, "no duplicate entities");
}

#[tokio::test]
async fn one_bad_record_does_not_abort_the_batch() {
    let (server, _state, _dir) = setup().await;

    let response = post_sync(
        &server,
        "device-1",
        "/api/sync/bulk-upload",
        json!({
            "sites": [
                {"temp_id": "bad", "idempotency_key": "k1", "payload": "not an object"},
                {"temp_id": "good", "idempotency_key": "k2", "payload": {"name": "Camp B"}}
            ]
        }),
    )
    .await;
    response.assert_status_ok();
    let body: Value = response.json();

    assert_eq!(body["sites_created"], 1);
    assert!(body["mappings"].get("good").is_some());
    let failures = body["failures"].as_array().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["temp_id"], "bad");
    assert_eq!(failures[0]["code"], "invalid_payload");
}

#[tokio::test]
async fn unknown_entity_type_in_upload_is_rejected() {
    let (server, _state, _dir) = setup().await;
    let response = post_sync(
        &server,
        "device-1",
        "/api/sync/bulk-upload",
        json!({
            "reports": [
                {"temp_id": "t1", "idempotency_key": "k1", "payload": {"x": 1}}
            ]
        }),
    )
    .await;
    response.assert_status_bad_request();
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "unknown_entity_type");
}

#[tokio::test]
async fn deletes_propagate_as_tombstones() {
    let (server, state, _dir) = setup().await;

    let site = state
        .store
        .create(EntityType::Sites, json!({"name": "Camp A"}))
        .await
        .unwrap();

    // Device baselines while the site is live.
    let baseline: Value = post_sync(
        &server,
        "device-1",
        "/api/sync/initial",
        json!({"data_types": ["sites"]}),
    )
    .await
    .json();
    assert_eq!(baseline["sites"].as_array().unwrap().len(), 1);
    let since = baseline["sync_timestamp"].as_str().unwrap().to_string();

    state.store.delete(EntityType::Sites, site.id, 1).await.unwrap();

    let delta: Value = post_sync(
        &server,
        "device-1",
        "/api/sync/incremental",
        json!({"data_types": ["sites"], "since": since}),
    )
    .await
    .json();
    let deleted = delta["sites"]["deleted"].as_array().unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0]["id"], site.id);
    assert_eq!(deleted[0]["version"], 2);

    // A brand-new device never sees the tombstone in its snapshot.
    let fresh: Value = post_sync(
        &server,
        "device-2",
        "/api/sync/initial",
        json!({"data_types": ["sites"]}),
    )
    .await
    .json();
    assert!(fresh["sites"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn uploads_do_not_advance_the_download_cursor() {
    let (server, state, _dir) = setup().await;

    post_sync(
        &server,
        "device-1",
        "/api/sync/initial",
        json!({"data_types": ["sites"]}),
    )
    .await
    .assert_status_ok();
    let before = state.devices.get("device-1").await.unwrap().cursor;

    post_sync(
        &server,
        "device-1",
        "/api/sync/bulk-upload",
        json!({
            "sites": [{"temp_id": "t1", "idempotency_key": "k1", "payload": {"name": "Camp A"}}]
        }),
    )
    .await
    .assert_status_ok();

    let after = state.devices.get("device-1").await.unwrap().cursor;
    assert_eq!(before, after);

    // The device's own upload arrives through its next delta like any
    // other change.
    let delta: Value = post_sync(
        &server,
        "device-1",
        "/api/sync/incremental",
        json!({"data_types": ["sites"], "since": before.to_string()}),
    )
    .await
    .json();
    assert_eq!(delta["sites"]["created"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn acknowledged_cursor_covers_unrequested_types() {
    let (server, state, _dir) = setup().await;

    post_sync(
        &server,
        "device-1",
        "/api/sync/initial",
        json!({"data_types": ["sites"]}),
    )
    .await
    .assert_status_ok();

    // One change to each type while the device only follows sites; the
    // assessment is the older of the two.
    let assessment = state
        .store
        .create(EntityType::Assessments, json!({"notes": "water survey"}))
        .await
        .unwrap();
    state
        .store
        .create(EntityType::Sites, json!({"name": "Camp A"}))
        .await
        .unwrap();

    let first: Value = post_sync(
        &server,
        "device-1",
        "/api/sync/incremental",
        json!({"data_types": ["sites"], "since": "0-0"}),
    )
    .await
    .json();
    assert_eq!(first["sites"]["created"].as_array().unwrap().len(), 1);
    let next = first["sync_timestamp"].as_str().unwrap().to_string();

    // The device cursor is global: acknowledging the sites delta moves
    // past the assessment change too, so asking for assessments now
    // yields nothing from before the cursor.
    let widened: Value = post_sync(
        &server,
        "device-1",
        "/api/sync/incremental",
        json!({"data_types": ["sites", "assessments"], "since": next}),
    )
    .await
    .json();
    assert!(widened["assessments"]["created"]
        .as_array()
        .unwrap()
        .is_empty());

    // A fresh initial sync is the documented way to pick up the type's
    // earlier history.
    let snapshot: Value = post_sync(
        &server,
        "device-1",
        "/api/sync/initial",
        json!({"data_types": ["assessments"]}),
    )
    .await
    .json();
    let rows = snapshot["assessments"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], assessment.id);
}

#[tokio::test]
async fn compaction_folds_superseded_records_into_a_baseline() {
    let (server, state, _dir) = setup().await;

    let site = state
        .store
        .create(EntityType::Sites, json!({"name": "v1"}))
        .await
        .unwrap();
    state
        .store
        .upsert(EntityType::Sites, site.id, json!({"name": "v2"}), 1)
        .await
        .unwrap();
    state
        .store
        .upsert(EntityType::Sites, site.id, json!({"name": "v3"}), 2)
        .await
        .unwrap();

    // The only active device acknowledges the head cursor.
    post_sync(
        &server,
        "device-1",
        "/api/sync/initial",
        json!({"data_types": ["sites"]}),
    )
    .await
    .assert_status_ok();

    let removed = compaction::run_once(&state).await.unwrap();
    assert_eq!(removed, 2, "v1 and v2 records folded away");

    // Replay from scratch still yields the entity via its baseline record.
    let (records, _) = state
        .ledger
        .delta(&[EntityType::Sites], Cursor::ZERO, 100)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].version, 3);
}

#[tokio::test]
async fn tombstones_survive_exactly_one_compaction_cycle() {
    let (server, state, _dir) = setup().await;

    let site = state
        .store
        .create(EntityType::Sites, json!({"name": "Camp A"}))
        .await
        .unwrap();
    state.store.delete(EntityType::Sites, site.id, 1).await.unwrap();

    post_sync(
        &server,
        "device-1",
        "/api/sync/initial",
        json!({"data_types": ["sites"]}),
    )
    .await
    .assert_status_ok();

    // First cycle: the create record folds, the delete record stays so
    // late devices can still learn about the deletion.
    compaction::run_once(&state).await.unwrap();
    let (records, _) = state
        .ledger
        .delta(&[EntityType::Sites], Cursor::ZERO, 100)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    let tombstone = state.store.get(EntityType::Sites, site.id).await.unwrap();
    assert!(tombstone.deleted);

    // Second cycle: the tombstone has been below the floor for a full
    // cycle and is purged with its entity row.
    compaction::run_once(&state).await.unwrap();
    let (records, _) = state
        .ledger
        .delta(&[EntityType::Sites], Cursor::ZERO, 100)
        .await
        .unwrap();
    assert!(records.is_empty());
    let err = state.store.get(EntityType::Sites, site.id).await.unwrap_err();
    assert!(matches!(err, ApiError::Sync(SyncError::NotFound { .. })));
}

#[tokio::test]
async fn revoked_devices_cannot_sync() {
    let (server, state, _dir) = setup().await;

    post_sync(
        &server,
        "device-1",
        "/api/sync/initial",
        json!({"data_types": ["sites"]}),
    )
    .await
    .assert_status_ok();
    state.devices.revoke("device-1").await.unwrap();

    let response = post_sync(
        &server,
        "device-1",
        "/api/sync/incremental",
        json!({"data_types": ["sites"], "since": "0-0"}),
    )
    .await;
    response.assert_status(axum::http::StatusCode::FORBIDDEN);
    let body: Value = response.json();
    assert_eq!(body["error"]["code"], "device_revoked");
}
