pub mod auth;
pub mod compaction;
pub mod config;
pub mod db;
pub mod devices;
pub mod error;
pub mod ledger;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod sync_log;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use config::{Settings, SyncSettings};
use devices::Devices;
use ledger::Ledger;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use store::EntityStore;
use sync_log::SyncLogs;

/// Shared handles for the sync components. Each sync call is independent;
/// no state is held across requests beyond what these persist.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub store: EntityStore,
    pub ledger: Ledger,
    pub devices: Devices,
    pub sync_logs: SyncLogs,
    pub jwt_secret: Arc<String>,
    pub limits: SyncSettings,
}

impl AppState {
    pub fn new(pool: SqlitePool, jwt_secret: String, limits: SyncSettings) -> Self {
        AppState {
            store: EntityStore::new(pool.clone()),
            ledger: Ledger::new(pool.clone()),
            devices: Devices::new(pool.clone()),
            sync_logs: SyncLogs::new(pool.clone()),
            pool,
            jwt_secret: Arc::new(jwt_secret),
            limits,
        }
    }

    pub async fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let pool = db::connect(&settings.database.path).await?;
        Ok(AppState::new(
            pool,
            settings.auth.jwt_secret.clone(),
            settings.sync.clone(),
        ))
    }
}

/// Build the full API router. Exposed so integration tests can mount it
/// without binding a socket.
pub fn app(state: AppState) -> Router {
    let sync_router = Router::new()
        .route("/sync/initial", post(sync::initial_sync))
        .route("/sync/incremental", post(sync::incremental_sync))
        .route("/sync/bulk-upload", post(sync::bulk_upload))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_device,
        ));

    let api_router = Router::new()
        .route("/health", get(health_handler))
        .merge(sync_router);

    Router::new().nest("/api", api_router).with_state(state)
}

async fn health_handler() -> &'static str {
    "OK"
}
