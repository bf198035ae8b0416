use anyhow::Result;
use clap::{Parser, Subcommand};
use rag_search::commands::{drop_collection, enrol, enrol_dir, search, show_status};
use rag_search::config::{Config, run_interactive_config, show_config};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rag-search")]
#[command(about = "Enroll documents into a vector index and answer queries with summaries")]
#[command(version)]
struct Cli {
    /// Configuration directory (defaults to ~/.rag-search)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure the model services and the vector index
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Enroll a single document
    Enrol {
        /// Source identifier stored with the document; defaults to the file path
        #[arg(long)]
        source: Option<String>,
        /// Document text
        #[arg(long, conflicts_with = "file")]
        text: Option<String>,
        /// Read the document text from a file
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Enroll every document in a directory as one batch
    EnrolDir {
        /// Directory to scan recursively
        dir: PathBuf,
        /// File extensions to include, e.g. --extension txt --extension md
        #[arg(long = "extension")]
        extensions: Vec<String>,
    },
    /// Search enrolled documents
    Search {
        /// Natural-language query
        query: String,
        /// Number of matches to return; implies --no-summary
        #[arg(long)]
        limit: Option<usize>,
        /// Return matches without a summary
        #[arg(long)]
        no_summary: bool,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check readiness of the model services and the index
    Status,
    /// Delete the collection and every enrolled document
    DropCollection {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => Config::config_dir()?,
    };

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&config_dir)?;
            } else {
                run_interactive_config(&config_dir)?;
            }
        }
        Commands::Enrol { source, text, file } => {
            enrol(&config_dir, source, text, file).await?;
        }
        Commands::EnrolDir { dir, extensions } => {
            enrol_dir(&config_dir, &dir, extensions).await?;
        }
        Commands::Search {
            query,
            limit,
            no_summary,
            json,
        } => {
            search(&config_dir, &query, limit, no_summary, json).await?;
        }
        Commands::Status => {
            show_status(&config_dir).await?;
        }
        Commands::DropCollection { yes } => {
            drop_collection(&config_dir, yes).await?;
        }
    }

    Ok(())
}
