use std::path::PathBuf;

use ::config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub studies_dir: PathBuf,
    pub log_filter: String,
    pub event_buffer: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/studies.db".into(),
            studies_dir: PathBuf::from("./studies"),
            log_filter: "info".into(),
            event_buffer: 256,
        }
    }
}

/// Plain environment names honoured for older deployments. They override
/// everything else.
const LEGACY_ENV: [(&str, &str); 3] = [
    ("SERVER_BIND", "server_bind"),
    ("DATABASE_URL", "database_url"),
    ("STUDIES_DIR", "studies_dir"),
];

/// Defaults, then `server.toml` (optional), then `APP__*` variables, then the
/// legacy plain names.
pub fn load_settings() -> Result<Settings, ConfigError> {
    build_settings(
        "server",
        Environment::with_prefix("APP").separator("__"),
        |name| std::env::var(name).ok(),
    )
}

fn build_settings(
    file_name: &str,
    env: Environment,
    legacy: impl Fn(&str) -> Option<String>,
) -> Result<Settings, ConfigError> {
    let defaults = Settings::default();
    let mut builder = Config::builder()
        .set_default("server_bind", defaults.server_bind)?
        .set_default("database_url", defaults.database_url)?
        .set_default(
            "studies_dir",
            defaults.studies_dir.to_string_lossy().into_owned(),
        )?
        .set_default("log_filter", defaults.log_filter)?
        .set_default("event_buffer", defaults.event_buffer as u64)?
        .add_source(File::with_name(file_name).required(false))
        .add_source(env);
    for (name, key) in LEGACY_ENV {
        builder = builder.set_override_option(key, legacy(name))?;
    }
    builder.build()?.try_deserialize()
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    storage::ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }
    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }
    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        return sqlite_url_for_path(path);
    }
    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return sqlite_url_for_path(path);
    }
    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    sqlite_url_for_path(raw_database_url)
}

fn sqlite_url_for_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    // sqlx reads `sqlite://C:/..` as host `C`, so drive paths keep one colon.
    if has_drive_prefix(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
