use super::{build_settings, normalize_database_url, prepare_database_url};

use std::{collections::HashMap, fs};

use ::config::Environment;

fn no_env() -> Environment {
    Environment::with_prefix("APP")
        .separator("__")
        .source(Some(HashMap::new()))
}

fn env_of(pairs: &[(&str, &str)]) -> Environment {
    Environment::with_prefix("APP").separator("__").source(Some(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    ))
}

#[test]
fn defaults_apply_without_sources() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("absent");
    let settings =
        build_settings(&missing.to_string_lossy(), no_env(), |_| None).expect("settings");
    assert_eq!(settings.server_bind, "127.0.0.1:8443");
    assert_eq!(settings.log_filter, "info");
    assert_eq!(settings.event_buffer, 256);
}

#[test]
fn file_then_app_env_then_legacy_names() {
    let dir = tempfile::tempdir().expect("tempdir");
    let file = dir.path().join("server.toml");
    fs::write(
        &file,
        "server_bind = \"0.0.0.0:9000\"\nstudies_dir = \"/srv/studies\"\nlog_filter = \"debug\"\n",
    )
    .expect("write");
    let base = dir.path().join("server");

    let from_file = build_settings(&base.to_string_lossy(), no_env(), |_| None).expect("file");
    assert_eq!(from_file.server_bind, "0.0.0.0:9000");
    assert_eq!(from_file.studies_dir.to_string_lossy(), "/srv/studies");
    assert_eq!(from_file.log_filter, "debug");

    let from_env = build_settings(
        &base.to_string_lossy(),
        env_of(&[("APP__SERVER_BIND", "10.0.0.1:80"), ("APP__EVENT_BUFFER", "64")]),
        |_| None,
    )
    .expect("env");
    assert_eq!(from_env.server_bind, "10.0.0.1:80");
    assert_eq!(from_env.event_buffer, 64);

    let legacy = build_settings(
        &base.to_string_lossy(),
        env_of(&[("APP__SERVER_BIND", "10.0.0.1:80")]),
        |name| (name == "SERVER_BIND").then(|| "192.168.1.1:8080".to_string()),
    )
    .expect("legacy");
    assert_eq!(legacy.server_bind, "192.168.1.1:8080");
    assert_eq!(legacy.log_filter, "debug");
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("  "), "sqlite://./data/studies.db");
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
}

#[test]
fn keeps_windows_absolute_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("sqlite:C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
    assert_eq!(
        normalize_database_url("sqlite://C:/Users/alice/test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn creates_parent_dir_for_sqlite_url() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.path().join("data").exists());
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );
}
