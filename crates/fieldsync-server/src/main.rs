use clap::Parser;
use fieldsync_server::{app, compaction, config::Settings, AppState};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fieldsync-server", about = "UnityAid mobile data synchronization server")]
struct Args {
    /// Path to server configuration TOML file
    #[arg(long, default_value = "fieldsync.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::from_file(&args.config)?;
    let state = AppState::from_settings(&settings).await?;

    if settings.compaction.enabled {
        compaction::spawn(
            state.clone(),
            Duration::from_secs(settings.compaction.interval_secs),
        );
    }

    let addr = SocketAddr::new(
        settings.server.host.parse::<IpAddr>()?,
        settings.server.port,
    );
    tracing::info!("fieldsync-server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state).into_make_service()).await?;
    Ok(())
}
