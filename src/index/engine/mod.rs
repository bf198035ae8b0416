//! Query engine guarding a [`CollectionBackend`].
//!
//! The engine tracks whether the backend's serving snapshot reflects every
//! completed write. Writes move it to [`LoadState::Stale`]; the first query
//! that sees a stale engine reloads the backend while other queries wait.

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{CollectionBackend, CollectionSchema, Hit, IndexParams, NewDocument, SearchParams};
use crate::config::Config;
use crate::{RagError, Result};

const NEVER_LOADED: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    /// Writes have completed since the last load
    Stale,
    /// The serving snapshot covers every completed write
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub collection: String,
    pub dimension: usize,
    pub nlist: usize,
    pub nprobe: usize,
    pub default_limit: usize,
    pub operation_timeout: Duration,
}

impl EngineOptions {
    #[inline]
    pub fn from_config(config: &Config) -> Self {
        Self {
            collection: config.index.collection.clone(),
            dimension: config.embedding.dimension as usize,
            nlist: config.index.nlist as usize,
            nprobe: config.index.nprobe as usize,
            default_limit: config.index.default_limit,
            operation_timeout: Duration::from_secs(config.index.operation_timeout_seconds),
        }
    }
}

/// Snapshot of engine counters for operator output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub backend: &'static str,
    pub collection: String,
    pub state: LoadState,
    pub dimension: usize,
    pub rows: u64,
    pub loads: u64,
    pub flushes: u64,
    pub inserts: u64,
}

pub struct VectorIndexEngine {
    backend: Arc<dyn CollectionBackend>,
    options: EngineOptions,
    write_generation: AtomicU64,
    loaded_generation: AtomicU64,
    load_guard: Mutex<()>,
    loads: AtomicU64,
    flushes: AtomicU64,
    inserts: AtomicU64,
}

impl std::fmt::Debug for VectorIndexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndexEngine")
            .field("backend", &self.backend.name())
            .field("options", &self.options)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl VectorIndexEngine {
    /// Open the collection, creating it and its index when absent.
    ///
    /// Fails with [`RagError::DimensionMismatch`] when an existing collection
    /// was created with a different dimension.
    pub async fn open(backend: Arc<dyn CollectionBackend>, options: EngineOptions) -> Result<Self> {
        if options.dimension == 0 {
            return Err(RagError::Validation(
                "collection dimension must be positive".to_string(),
            ));
        }

        let engine = Self {
            backend,
            options,
            write_generation: AtomicU64::new(0),
            loaded_generation: AtomicU64::new(NEVER_LOADED),
            load_guard: Mutex::new(()),
            loads: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        };

        engine.ensure_collection().await?;
        Ok(engine)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let existing = self
            .with_timeout("describe", self.backend.describe())
            .await?;

        match existing {
            Some(schema) if schema.dimension != self.options.dimension => {
                return Err(RagError::DimensionMismatch {
                    expected: self.options.dimension,
                    actual: schema.dimension,
                });
            }
            Some(schema) => {
                debug!(
                    "Using existing collection '{}' ({} dimensions)",
                    schema.name, schema.dimension
                );
            }
            None => {
                let schema = CollectionSchema::new(&self.options.collection, self.options.dimension);
                self.with_timeout("create_collection", self.backend.create_collection(&schema))
                    .await?;
                info!(
                    "Created collection '{}' on {} backend",
                    schema.name,
                    self.backend.name()
                );
            }
        }

        self.with_timeout(
            "create_index",
            self.backend
                .create_index(&IndexParams::ivf_flat(self.options.nlist)),
        )
        .await
    }

    #[inline]
    pub fn state(&self) -> LoadState {
        if self.loaded_generation.load(Ordering::Acquire)
            == self.write_generation.load(Ordering::Acquire)
        {
            LoadState::Ready
        } else {
            LoadState::Stale
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.options.dimension
    }

    #[inline]
    pub fn default_limit(&self) -> usize {
        self.options.default_limit
    }

    #[inline]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        if actual == self.options.dimension {
            Ok(())
        } else {
            Err(RagError::DimensionMismatch {
                expected: self.options.dimension,
                actual,
            })
        }
    }

    fn mark_written(&self) {
        self.write_generation.fetch_add(1, Ordering::AcqRel);
    }

    async fn with_timeout<T, F>(&self, operation: &'static str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.options.operation_timeout, future)
            .await
            .map_err(|_| RagError::Timeout {
                operation,
                seconds: self.options.operation_timeout.as_secs(),
            })?
    }

    /// Append records and return their ids. Marks the engine stale, even on failure.
    pub async fn insert(&self, records: Vec<NewDocument>) -> Result<Vec<u64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        for record in &records {
            self.check_dimension(record.embedding.len())?;
        }

        let count = records.len();
        let result = self
            .with_timeout("insert", self.backend.insert(records))
            .await;

        // A failed or timed out insert may still have reached storage
        self.mark_written();
        let ids = result?;
        self.inserts.fetch_add(count as u64, Ordering::Relaxed);
        debug!("Inserted {} records", count);
        Ok(ids)
    }

    /// Seal open segments so their rows are served from the index.
    pub async fn flush(&self) -> Result<()> {
        let result = self.with_timeout("flush", self.backend.flush()).await;
        self.mark_written();
        result?;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        debug!("Flushed collection");
        Ok(())
    }

    /// Reload the backend if any write completed since the last load.
    async fn ensure_loaded(&self) -> Result<()> {
        if self.state() == LoadState::Ready {
            return Ok(());
        }

        let _guard = self.load_guard.lock().await;

        // Another caller may have loaded while this one waited
        let target = self.write_generation.load(Ordering::Acquire);
        if self.loaded_generation.load(Ordering::Acquire) == target {
            return Ok(());
        }

        self.with_timeout("load", self.backend.load()).await?;
        self.loaded_generation.store(target, Ordering::Release);
        let loads = self.loads.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Loaded collection (generation {}, load #{})", target, loads);
        Ok(())
    }

    /// Up to `limit` nearest records by L2 distance, closest first.
    pub async fn query(&self, embedding: &[f32], limit: usize) -> Result<Vec<Hit>> {
        if limit == 0 {
            return Err(RagError::Validation("limit must be at least 1".to_string()));
        }
        self.check_dimension(embedding.len())?;

        self.ensure_loaded().await?;

        let params = SearchParams {
            nprobe: self.options.nprobe,
        };
        let mut hits = self
            .with_timeout("query", self.backend.search(embedding, &params, limit))
            .await?;

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        hits.truncate(limit);
        Ok(hits)
    }

    #[inline]
    pub async fn query_default(&self, embedding: &[f32]) -> Result<Vec<Hit>> {
        self.query(embedding, self.options.default_limit).await
    }

    pub async fn count(&self) -> Result<u64> {
        self.with_timeout("count", self.backend.count()).await
    }

    pub async fn health_check(&self) -> Result<()> {
        self.with_timeout("ping", self.backend.ping()).await
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        Ok(EngineStatus {
            backend: self.backend.name(),
            collection: self.options.collection.clone(),
            state: self.state(),
            dimension: self.options.dimension,
            rows: self.count().await?,
            loads: self.loads.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
        })
    }

    /// Remove every record and recreate the empty collection.
    pub async fn drop_collection(&self) -> Result<()> {
        self.with_timeout("drop_collection", self.backend.drop_collection())
            .await?;
        self.mark_written();
        info!("Dropped collection '{}'", self.options.collection);
        self.ensure_collection().await
    }
}
