// Configuration management module
// TOML settings for the gateways and the vector index, plus the interactive editor

pub mod interactive;
pub mod settings;


pub use interactive::{run_interactive_config, show_config};
pub use settings::{
    Config, ConfigError, EmbeddingConfig, EmbeddingEncoding, IndexBackend, IndexConfig,
    SummarizationConfig,
};
