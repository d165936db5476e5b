use anyhow::Context;
use serde::Deserialize;
use std::{env, fs, path::Path, path::PathBuf};

/// Server configuration loaded from TOML file
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub auth: AuthSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub compaction: CompactionSettings,
}

/// Network settings for the HTTP server
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// Host/interface to bind to, e.g. "127.0.0.1"
    pub host: String,
    /// Port to listen on, e.g. 3000
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    /// Path to the sqlite database file; created if missing
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    /// HS256 secret for validating device bearer tokens.
    /// Supports ${VAR} expansion from the environment.
    pub jwt_secret: String,
}

/// Payload size caps for mobile responses
#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    /// Max entities returned per type in an initial-sync snapshot
    #[serde(default = "default_snapshot_limit")]
    pub snapshot_limit: i64,
    /// Max change records returned per incremental-sync page
    #[serde(default = "default_delta_page_size")]
    pub delta_page_size: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompactionSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_compaction_interval")]
    pub interval_secs: u64,
}

fn default_snapshot_limit() -> i64 {
    500
}

fn default_delta_page_size() -> i64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_compaction_interval() -> u64 {
    3600
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            snapshot_limit: default_snapshot_limit(),
            delta_page_size: default_delta_page_size(),
        }
    }
}

impl Default for CompactionSettings {
    fn default() -> Self {
        CompactionSettings {
            enabled: true,
            interval_secs: default_compaction_interval(),
        }
    }
}

impl Settings {
    /// Load and parse the configuration from the given TOML file path
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut settings: Settings = toml::from_str(&data)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        // Expand JWT secret from environment variable if in ${VAR} form
        if settings.auth.jwt_secret.starts_with("${") && settings.auth.jwt_secret.ends_with('}') {
            let var = &settings.auth.jwt_secret[2..settings.auth.jwt_secret.len() - 1];
            settings.auth.jwt_secret = env::var(var)
                .with_context(|| format!("missing environment var {} for jwt_secret", var))?;
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 3000

            [database]
            path = "/tmp/fieldsync.db"

            [auth]
            jwt_secret = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.sync.snapshot_limit, 500);
        assert!(settings.compaction.enabled);
        assert_eq!(settings.compaction.interval_secs, 3600);
    }
}
