use super::*;
use tempfile::TempDir;

#[test]
fn default_config() {
    let config = Config::default();
    assert_eq!(config.embedding.protocol, "http");
    assert_eq!(config.embedding.host, "localhost");
    assert_eq!(config.embedding.port, 7050);
    assert_eq!(config.embedding.dimension, DEFAULT_EMBEDDING_DIMENSION);
    assert_eq!(config.embedding.encoding, EmbeddingEncoding::Base64F16);
    assert_eq!(config.summarization.min_length, 50);
    assert_eq!(config.summarization.max_length, 250);
    assert!((config.summarization.tokens_per_word - 1.3).abs() < f64::EPSILON);
    assert_eq!(config.index.backend, IndexBackend::Segment);
    assert_eq!(config.index.nlist, 128);
    assert_eq!(config.index.nprobe, 10);
    assert_eq!(config.index.default_limit, 10);
}

#[test]
fn config_validation() {
    let config = Config::default();
    assert!(config.validate().is_ok());

    let mut invalid_config = config.clone();
    invalid_config.embedding.protocol = "ftp".to_string();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.embedding.port = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.embedding.batch_size = 0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.embedding.dimension = 1;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.summarization.min_length = 250;
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::InvalidSummaryBounds(250, 250))
    ));

    let mut invalid_config = config.clone();
    invalid_config.summarization.tokens_per_word = 0.0;
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config.clone();
    invalid_config.index.nprobe = 129;
    assert!(matches!(
        invalid_config.validate(),
        Err(ConfigError::InvalidNprobe(129, 128))
    ));

    let mut invalid_config = config.clone();
    invalid_config.index.collection = "my docs".to_string();
    assert!(invalid_config.validate().is_err());

    let mut invalid_config = config;
    invalid_config.index.default_limit = 0;
    assert!(invalid_config.validate().is_err());
}

#[test]
fn gateway_url_generation() {
    let config = Config::default();
    let url = config
        .embedding
        .url()
        .expect("should generate embedding url successfully");
    assert_eq!(url.as_str(), "http://localhost:7050/");

    let url = config
        .summarization
        .url()
        .expect("should generate summarization url successfully");
    assert_eq!(url.as_str(), "http://localhost:7000/");
}

#[test]
fn toml_serialization() {
    let config = Config::default();
    let toml_str = toml::to_string(&config).expect("should serialize toml correctly");
    let parsed_config: Config = toml::from_str(&toml_str).expect("should parse toml correctly");
    assert_eq!(config, parsed_config);
}

#[test]
fn setter_validation() {
    let mut embedding = EmbeddingConfig::default();

    assert!(embedding.set_protocol("https".to_string()).is_ok());
    assert!(embedding.set_host("example.com".to_string()).is_ok());
    assert!(embedding.set_port(8080).is_ok());
    assert!(embedding.set_batch_size(128).is_ok());
    assert!(embedding.set_dimension(768).is_ok());

    assert!(embedding.set_protocol("ftp".to_string()).is_err());
    assert!(embedding.set_port(0).is_err());
    assert!(embedding.set_batch_size(0).is_err());
    assert!(embedding.set_batch_size(1001).is_err());
    assert!(embedding.set_dimension(0).is_err());

    let mut summarization = SummarizationConfig::default();
    assert!(summarization.set_bounds(10, 100).is_ok());
    assert!(summarization.set_bounds(100, 100).is_err());
    assert_eq!(summarization.min_length, 10);

    let mut index = IndexConfig::default();
    assert!(index.set_nprobe(128).is_ok());
    assert!(index.set_nprobe(0).is_err());
}

#[test]
fn load_missing_file_uses_defaults() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let config = Config::load(temp_dir.path()).expect("should load defaults");

    assert_eq!(config.base_dir, temp_dir.path());
    assert_eq!(config.embedding, EmbeddingConfig::default());
    assert_eq!(
        config.collection_path(),
        temp_dir.path().join("collections").join("documents")
    );
    assert_eq!(config.lance_path(), temp_dir.path().join("vectors"));
}

#[test]
fn save_then_load() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut config = Config::load(temp_dir.path()).expect("should load defaults");
    config.index.backend = IndexBackend::Lance;
    config.embedding.encoding = EmbeddingEncoding::Plain;
    config.summarization.enabled = false;
    config.save().expect("should save config");

    let reloaded = Config::load(temp_dir.path()).expect("should reload config");
    assert_eq!(config, reloaded);
}

#[test]
fn load_rejects_invalid_values() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    std::fs::write(
        temp_dir.path().join("config.toml"),
        "[index]\nnlist = 4\nnprobe = 8\n",
    )
    .expect("should write config");

    assert!(Config::load(temp_dir.path()).is_err());
}
