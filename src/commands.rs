use anyhow::{Context, Result};
use console::style;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

use crate::config::Config;
use crate::index::{EngineOptions, VectorIndexEngine};
use crate::retrieval::{EnrollRequest, Retriever, SearchOutcome, open_backend};

/// File extensions picked up by `enrol-dir` when none are given
pub const DEFAULT_EXTENSIONS: &[&str] = &["txt", "md"];

async fn open_retriever(config_dir: &Path) -> Result<Retriever> {
    let config = Config::load(config_dir)?;
    Retriever::from_config(&config)
        .await
        .context("Failed to initialize retrieval pipeline")
}

/// Enroll a single document, given inline or read from a file
#[inline]
pub async fn enrol(
    config_dir: &Path,
    source: Option<String>,
    text: Option<String>,
    file: Option<PathBuf>,
) -> Result<()> {
    let (text, source) = match (text, file) {
        (Some(text), _) => {
            let source = source.context("--source is required when enrolling inline text")?;
            (text, source)
        }
        (None, Some(file)) => {
            let text = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let source = source.unwrap_or_else(|| file.display().to_string());
            (text, source)
        }
        (None, None) => anyhow::bail!("Provide the document with --text or --file"),
    };

    let retriever = open_retriever(config_dir).await?;
    let id = retriever.enroll_document(&text, &source).await?;

    println!(
        "{} Enrolled {} (record {})",
        style("✓").green(),
        style(&source).bold(),
        id
    );
    Ok(())
}

/// Collect enrollable files under `dir`, sorted by path. Symlinks are not followed.
pub fn collect_documents(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(dir) {
        let entry =
            entry.with_context(|| format!("Failed to read directory {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.into_path();
        if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| extensions.iter().any(|wanted| wanted.eq_ignore_ascii_case(e)))
        {
            files.push(path);
        }
    }

    Ok(files.into_iter().sorted().collect())
}

/// Bulk-enroll every matching file in a directory with one insert and one flush
#[inline]
pub async fn enrol_dir(config_dir: &Path, dir: &Path, extensions: Vec<String>) -> Result<()> {
    let extensions = if extensions.is_empty() {
        DEFAULT_EXTENSIONS.iter().map(|e| (*e).to_string()).collect()
    } else {
        extensions
    };

    let files = collect_documents(dir, &extensions)?;
    if files.is_empty() {
        println!(
            "No documents with extensions [{}] found in {}",
            extensions.join(", "),
            dir.display()
        );
        return Ok(());
    }

    let bar = if console::user_attended_stderr() {
        ProgressBar::new(files.len() as u64).with_style(
            ProgressStyle::with_template("{bar:40} [{pos}/{len}] Reading {msg}")
                .context("Invalid progress bar template")?,
        )
    } else {
        ProgressBar::hidden()
    };

    let mut batch = Vec::with_capacity(files.len());
    let mut empty = Vec::new();
    for path in &files {
        bar.set_message(path.display().to_string());
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        if text.trim().is_empty() {
            empty.push(path.display().to_string());
        } else {
            batch.push(EnrollRequest::new(text, path.display().to_string()));
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    if !empty.is_empty() {
        anyhow::bail!(
            "Nothing was enrolled: {} empty document(s) in {}: {}",
            empty.len(),
            dir.display(),
            empty.join(", ")
        );
    }

    let retriever = open_retriever(config_dir).await?;
    info!("Enrolling {} documents from {}", batch.len(), dir.display());
    let report = retriever.enroll_documents(batch).await?;

    println!(
        "{} Enrolled {} documents from {}",
        style("✓").green(),
        report.inserted,
        dir.display()
    );
    Ok(())
}

/// Search enrolled documents and optionally summarize the matches
#[inline]
pub async fn search(
    config_dir: &Path,
    query: &str,
    limit: Option<usize>,
    no_summary: bool,
    json: bool,
) -> Result<()> {
    let retriever = open_retriever(config_dir).await?;

    let outcome = if no_summary || limit.is_some() {
        let limit = limit.unwrap_or_else(|| retriever.engine().default_limit());
        SearchOutcome::HitsOnly {
            hits: retriever.search(query, limit).await?,
        }
    } else {
        retriever.search_and_summarize(query).await?
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome).context("Failed to serialize results")?
        );
        return Ok(());
    }

    if let Some(summary) = outcome.summary() {
        println!("{}", style("Summary").bold().underlined());
        println!("{}", summary);
        println!();
    }

    let hits = outcome.hits();
    if hits.is_empty() {
        println!("No matching documents.");
        return Ok(());
    }

    println!("{}", style(format!("Matches ({})", hits.len())).bold().underlined());
    for (rank, hit) in hits.iter().enumerate() {
        println!(
            "{:>3}. {} {}",
            rank + 1,
            style(&hit.source_identifier).cyan(),
            style(format!("(distance {:.4})", hit.distance)).dim()
        );
        println!("     {}", hit.preview_text.replace('\n', " "));
    }

    Ok(())
}

fn print_component(label: &str, ready: bool, error: Option<&str>) {
    if ready {
        println!("   {} {}: ready", style("✅").green(), label);
    } else {
        println!(
            "   {} {}: unavailable - {}",
            style("❌").red(),
            label,
            error.unwrap_or("unknown error")
        );
    }
}

/// Show readiness of every collaborator and the index counters
#[inline]
pub async fn show_status(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir)?;

    println!("📊 rag-search Status Report");
    println!("{}", "=".repeat(50));
    println!();

    let retriever = match Retriever::from_config(&config).await {
        Ok(retriever) => retriever,
        Err(e) => {
            println!("   ❌ Failed to open the index: {}", e);
            return Ok(());
        }
    };

    let readiness = retriever.health().await;
    println!("🩺 Readiness:");
    print_component(
        &format!(
            "Embedding service ({}:{})",
            config.embedding.host, config.embedding.port
        ),
        readiness.embedding.ready,
        readiness.embedding.error.as_deref(),
    );
    match &readiness.summarization {
        Some(health) => print_component(
            &format!(
                "Summarization service ({}:{})",
                config.summarization.host, config.summarization.port
            ),
            health.ready,
            health.error.as_deref(),
        ),
        None => println!("   💤 Summarization service: disabled"),
    }
    print_component(
        "Vector index",
        readiness.index.ready,
        readiness.index.error.as_deref(),
    );

    println!();
    println!("🔍 Collection:");
    match retriever.engine().status().await {
        Ok(status) => {
            println!("   📦 Name: {}", status.collection);
            println!("   🗄️  Backend: {}", status.backend);
            println!("   🔢 Dimension: {}", status.dimension);
            println!("   📊 Records: {}", status.rows);
            println!(
                "   🧭 IVF_FLAT: nlist={}, nprobe={}",
                config.index.nlist, config.index.nprobe
            );
        }
        Err(e) => println!("   ❌ Failed to read collection status: {}", e),
    }

    println!();
    if readiness.is_ready() {
        println!("{}", style("READY").green().bold());
    } else {
        println!("{}", style("NOT READY").red().bold());
    }
    Ok(())
}

/// Remove every enrolled document. Needed after changing the embedding dimension.
#[inline]
pub async fn drop_collection(config_dir: &Path, assume_yes: bool) -> Result<()> {
    let config = Config::load(config_dir)?;

    println!(
        "This will delete collection '{}' and every enrolled document.",
        config.index.collection
    );
    if !assume_yes
        && !Confirm::new()
            .with_prompt("Delete the collection? This action cannot be undone")
            .default(false)
            .interact()?
    {
        println!("Aborted.");
        return Ok(());
    }

    // Drop through the backend directly so a dimension mismatch does not block it
    let backend = open_backend(&config).await?;
    backend.drop_collection().await?;

    // Recreate the empty collection with the configured settings
    VectorIndexEngine::open(backend, EngineOptions::from_config(&config)).await?;

    println!(
        "{} Collection '{}' dropped",
        style("✓").green(),
        config.index.collection
    );
    Ok(())
}
