#[cfg(test)]
mod tests;

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, Select};
use url::Url;

use super::{Config, EmbeddingConfig, SummarizationConfig};

#[inline]
pub fn run_interactive_config(config_dir: &Path) -> Result<()> {
    eprintln!("{}", style("🔧 RAG Search Configuration Setup").bold().cyan());
    eprintln!();

    let mut config = load_existing_config(config_dir)?;

    eprintln!("{}", style("Embedding Service").bold().yellow());
    eprintln!("Configure the service that turns text into vectors.");
    eprintln!();

    configure_embedding(&mut config.embedding)?;

    eprintln!();
    eprintln!("{}", style("Summarization Service").bold().yellow());
    eprintln!();

    configure_summarization(&mut config.summarization)?;

    eprintln!();
    eprintln!("{}", style("Testing configuration...").yellow());

    report_connection("Embedding service", config.embedding.url().ok().as_ref());
    if config.summarization.enabled {
        report_connection(
            "Summarization service",
            config.summarization.url().ok().as_ref(),
        );
    }

    eprintln!();
    if Confirm::new()
        .with_prompt("Save configuration?")
        .default(true)
        .interact()?
    {
        config.save().context("Failed to save configuration")?;
        eprintln!("{}", style("✓ Configuration saved successfully!").green());
        eprintln!(
            "Configuration saved to: {}",
            style(config.config_file_path().display()).cyan()
        );
    } else {
        eprintln!("Configuration not saved.");
    }

    Ok(())
}

#[inline]
pub fn show_config(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;

    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Embedding Service:").bold().yellow());
    match config.embedding.url() {
        Ok(url) => eprintln!("  URL: {}", style(url).cyan()),
        Err(e) => eprintln!("  URL: {} ({})", style("Invalid").red(), e),
    }
    eprintln!("  Dimension: {}", style(config.embedding.dimension).cyan());
    eprintln!("  Encoding: {:?}", style(config.embedding.encoding).cyan());
    eprintln!("  Batch Size: {}", style(config.embedding.batch_size).cyan());

    eprintln!();
    eprintln!("{}", style("Summarization Service:").bold().yellow());
    if config.summarization.enabled {
        match config.summarization.url() {
            Ok(url) => eprintln!("  URL: {}", style(url).cyan()),
            Err(e) => eprintln!("  URL: {} ({})", style("Invalid").red(), e),
        }
        eprintln!(
            "  Length Bounds: {}..{} tokens ({} tokens/word)",
            style(config.summarization.min_length).cyan(),
            style(config.summarization.max_length).cyan(),
            style(config.summarization.tokens_per_word).cyan()
        );
    } else {
        eprintln!("  {}", style("Disabled").dim());
    }

    eprintln!();
    eprintln!("{}", style("Vector Index:").bold().yellow());
    eprintln!("  Backend: {:?}", style(config.index.backend).cyan());
    eprintln!("  Collection: {}", style(&config.index.collection).cyan());
    eprintln!(
        "  IVF_FLAT: nlist={} nprobe={}",
        style(config.index.nlist).cyan(),
        style(config.index.nprobe).cyan()
    );
    eprintln!(
        "  Default Limit: {}",
        style(config.index.default_limit).cyan()
    );

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );

    Ok(())
}

fn load_existing_config(config_dir: &Path) -> Result<Config> {
    Config::load(config_dir).map_or_else(
        |_| {
            eprintln!(
                "{}",
                style("No usable configuration found. Using defaults.").yellow()
            );
            Ok(Config {
                base_dir: config_dir.to_path_buf(),
                ..Config::default()
            })
        },
        |config| {
            eprintln!("{}", style("Found existing configuration.").green());
            Ok(config)
        },
    )
}

fn select_protocol(prompt: &str, current: &str) -> Result<String> {
    let protocols = &["http", "https"];
    let default_index = protocols.iter().position(|&p| p == current).unwrap_or(0);

    let protocol_index = Select::new()
        .with_prompt(prompt)
        .default(default_index)
        .items(protocols)
        .interact()?;

    Ok(protocols[protocol_index].to_string())
}

fn configure_embedding(embedding: &mut EmbeddingConfig) -> Result<()> {
    let protocol = select_protocol("Embedding service protocol", &embedding.protocol)?;
    embedding.set_protocol(protocol)?;

    let host: String = Input::new()
        .with_prompt("Embedding service host")
        .default(embedding.host.clone())
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.trim().is_empty() {
                Err("Host cannot be empty")
            } else {
                Ok(())
            }
        })
        .interact_text()?;
    embedding.set_host(host)?;

    let port: u16 = Input::new()
        .with_prompt("Embedding service port")
        .default(embedding.port)
        .interact_text()?;
    embedding.set_port(port)?;

    let dimension: u32 = Input::new()
        .with_prompt("Embedding dimension (fixed once the collection exists)")
        .default(embedding.dimension)
        .interact_text()?;
    embedding.set_dimension(dimension)?;

    let batch_size: u32 = Input::new()
        .with_prompt("Batch size for bulk enrolment")
        .default(embedding.batch_size)
        .validate_with(|input: &u32| -> Result<(), &str> {
            if *input == 0 {
                Err("Batch size must be greater than 0")
            } else if *input > 1000 {
                Err("Batch size must be 1000 or less")
            } else {
                Ok(())
            }
        })
        .interact_text()?;
    embedding.set_batch_size(batch_size)?;

    Ok(())
}

fn configure_summarization(summarization: &mut SummarizationConfig) -> Result<()> {
    summarization.enabled = Confirm::new()
        .with_prompt("Summarize search results?")
        .default(summarization.enabled)
        .interact()?;

    if !summarization.enabled {
        return Ok(());
    }

    summarization.protocol =
        select_protocol("Summarization service protocol", &summarization.protocol)?;

    let host: String = Input::new()
        .with_prompt("Summarization service host")
        .default(summarization.host.clone())
        .interact_text()?;
    summarization.set_host(host)?;

    let port: u16 = Input::new()
        .with_prompt("Summarization service port")
        .default(summarization.port)
        .interact_text()?;
    summarization.set_port(port)?;

    let min_length: u32 = Input::new()
        .with_prompt("Minimum summary length (tokens)")
        .default(summarization.min_length)
        .interact_text()?;
    let max_length: u32 = Input::new()
        .with_prompt("Maximum summary length (tokens)")
        .default(summarization.max_length)
        .interact_text()?;
    summarization.set_bounds(min_length, max_length)?;

    Ok(())
}

fn report_connection(label: &str, base_url: Option<&Url>) {
    if base_url.is_some_and(test_connection) {
        eprintln!("{}", style(format!("✓ {} reachable", label)).green());
    } else {
        eprintln!(
            "{}",
            style(format!("⚠ Warning: could not reach {}", label)).yellow()
        );
        eprintln!("You can continue, but make sure it is running before enrolling documents.");
    }
}

fn test_connection(base_url: &Url) -> bool {
    let Ok(url) = base_url.join("/ready") else {
        return false;
    };

    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(std::time::Duration::from_secs(5)))
        .build()
        .into();

    match agent.get(url.as_str()).call() {
        Ok(_) => true,
        Err(ureq::Error::StatusCode(code)) if (400..500).contains(&code) => true,
        Err(_) => false,
    }
}
