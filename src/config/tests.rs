use super::yaml::{parse_config, resolve_config};
use super::*;
use std::io::Write;
use std::path::PathBuf;

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.server.host, DEFAULT_HOST);
    assert_eq!(config.server.port, DEFAULT_PORT);
    assert_eq!(config.storage.upload_root, PathBuf::from(DEFAULT_UPLOAD_ROOT));
    assert!(config.merge.ffmpeg_enabled);
    assert_eq!(config.logging.level, "info");
    assert!(config.validate().is_ok());
}

#[test]
fn test_partial_yaml_keeps_defaults() {
    let yaml = r#"
server:
  port: 8080
merge:
  ffmpeg_enabled: false
"#;
    let config = parse_config(yaml).unwrap();
    assert_eq!(config.server.port, 8080);
    assert_eq!(config.server.host, DEFAULT_HOST);
    assert!(!config.merge.ffmpeg_enabled);
    assert_eq!(config.merge.ffmpeg_path, PathBuf::from("ffmpeg"));
    assert_eq!(config.storage.upload_root, PathBuf::from(DEFAULT_UPLOAD_ROOT));
}

#[test]
fn test_empty_yaml_is_default() {
    let config = parse_config("   \n").unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn test_invalid_port_rejected() {
    let err = parse_config("server:\n  port: 0\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn test_malformed_yaml_rejected() {
    let err = parse_config("server: [not, a, map").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_load_from_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "storage:\n  upload_root: /tmp/sketch-data\nlogging:\n  level: debug").unwrap();

    let config = load_config_from_path(file.path()).unwrap();
    assert_eq!(config.storage.upload_root, PathBuf::from("/tmp/sketch-data"));
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_missing_file_is_io_error() {
    let err = load_config_from_path(std::path::Path::new("/nonexistent/sketchcast.yaml"))
        .unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn test_server_addr_and_limit() {
    let server = ServerConfig {
        host: "0.0.0.0".to_string(),
        port: 9000,
        body_limit_mb: 2,
    };
    assert_eq!(server.addr(), "0.0.0.0:9000");
    assert_eq!(server.body_limit_bytes(), 2 * 1024 * 1024);
}

#[test]
fn test_missing_default_file_uses_defaults() {
    let dir = tempfile::TempDir::new().unwrap();
    let default_path = dir.path().join("config.yaml");

    let config = resolve_config(None, Some(default_path.as_path())).unwrap();
    assert_eq!(config.server.port, DEFAULT_PORT);
    assert_eq!(config.storage.upload_root, PathBuf::from(DEFAULT_UPLOAD_ROOT));

    let config = resolve_config(None, None).unwrap();
    assert_eq!(config.server.host, DEFAULT_HOST);
}

#[test]
fn test_default_file_is_loaded_when_present() {
    let dir = tempfile::TempDir::new().unwrap();
    let default_path = dir.path().join("config.yaml");
    std::fs::write(&default_path, "server:\n  port: 6100\n").unwrap();

    let config = resolve_config(None, Some(default_path.as_path())).unwrap();
    assert_eq!(config.server.port, 6100);
}

#[test]
fn test_explicit_path_must_exist() {
    let dir = tempfile::TempDir::new().unwrap();
    let default_path = dir.path().join("config.yaml");
    std::fs::write(&default_path, "server:\n  port: 6100\n").unwrap();

    let missing = dir.path().join("missing.yaml");
    let err = resolve_config(Some(missing.as_path()), Some(default_path.as_path())).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}
