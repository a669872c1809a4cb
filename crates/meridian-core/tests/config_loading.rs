//! Configuration loading from disk
//!
//! Covers the full layering path: TOML file, environment overrides, validation.

use meridian_core::{ConfigError, MeridianConfig, MeridianError};
use std::io::Write;

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[node]
node_id = "ctl-2"

[maps]
anti_entropy_fanout = 3

[serialization]
pool_size = 4
"#
    )
    .unwrap();

    let config = MeridianConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.node.node_id().as_str(), "ctl-2");
    assert_eq!(config.maps.anti_entropy_fanout, 3);
    assert_eq!(config.serialization.pool_size, 4);
    assert_eq!(config.serialization.default_buffer_size, 4096);
    assert!(config.validate().is_ok());
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = MeridianConfig::load_from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let err = MeridianConfig::from_toml_str("[maps]\nconsensus_timeout_ms = \"soon\"").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_invalid_file_converts_to_unified_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[install]\ninstall_timeout_ms = 0").unwrap();

    let config = MeridianConfig::load_from_file(file.path()).unwrap();
    let err: MeridianError = config.validate().unwrap_err().into();
    assert!(matches!(err, MeridianError::Invalid { .. }));
    assert!(err.to_string().contains("install.install_timeout_ms"));
}

#[test]
fn test_unknown_override_key_rejected() {
    let mut config = MeridianConfig::default();
    let err = config
        .merge_with_vars(vec![("MERIDIAN_MAPS_SHARDS".to_string(), "4".to_string())])
        .unwrap_err();
    assert_eq!(err, ConfigError::UnknownKey("maps.shards".to_string()));
}
