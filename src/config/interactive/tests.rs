use super::load_existing_config as load_existing_config_impl;
use tempfile::TempDir;

#[test]
fn load_existing_config_falls_back_to_defaults() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    std::fs::write(temp_dir.path().join("config.toml"), "not [valid toml")
        .expect("should write config");

    let config = load_existing_config_impl(temp_dir.path()).expect("config loaded successfully");
    assert_eq!(config.base_dir, temp_dir.path());
    assert!(!config.embedding.host.is_empty());
    assert!(config.embedding.port > 0);
    assert!(config.index.nlist > 0);
}

#[test]
fn unreachable_service_is_reported_as_down() {
    let url = url::Url::parse("http://127.0.0.1:9").expect("url should parse");
    assert!(!super::test_connection(&url));
}
