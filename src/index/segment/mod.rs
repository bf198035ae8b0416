//! Built-in segment store.
//!
//! Inserts land in a growing segment. Once it reaches the seal threshold, or
//! when [`flush`](CollectionBackend::flush) is called, the growing rows become
//! an immutable sealed segment with its own IVF_FLAT index. Searches run
//! against the snapshot taken by the last `load`: indexed search inside
//! sealed segments and a linear scan over rows that were still growing.
//!
//! With a storage directory the layout is:
//!
//! ```text
//! manifest.json            schema, index parameters, sealed segment ids
//! growing.jsonl            rows not yet sealed, one JSON record per line
//! segments/<id>.json       sealed segment rows and IVF partitions
//! ```


use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::ivf::{IvfFlatIndex, Scored, TopK, brute_force};
use super::{
    CollectionBackend, CollectionSchema, DocumentRecord, Hit, IndexParams, NewDocument,
    SearchParams,
};
use crate::{RagError, Result};

const MANIFEST_FILE: &str = "manifest.json";
const GROWING_LOG_FILE: &str = "growing.jsonl";
const SEGMENTS_DIR: &str = "segments";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    schema: CollectionSchema,
    index: Option<IndexParams>,
    next_segment_id: u64,
    segments: Vec<u64>,
}

/// An immutable, fully written segment.
#[derive(Debug, Serialize, Deserialize)]
pub struct SealedSegment {
    pub id: u64,
    rows: Vec<DocumentRecord>,
    index: Option<IvfFlatIndex>,
}

impl SealedSegment {
    fn build(id: u64, rows: Vec<DocumentRecord>, params: Option<IndexParams>) -> Self {
        let index = params.map(|params| {
            let vectors: Vec<&[f32]> = rows.iter().map(|r| r.embedding.as_slice()).collect();
            IvfFlatIndex::train(&vectors, params.nlist)
        });
        Self { id, rows, index }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[inline]
    pub fn is_indexed(&self) -> bool {
        self.index.is_some()
    }

    fn search(&self, query: &[f32], nprobe: usize, limit: usize) -> Vec<Scored<u32>> {
        match &self.index {
            Some(index) => index.search(query, nprobe, limit, |offset| {
                self.rows[offset as usize].embedding.as_slice()
            }),
            None => brute_force(query, limit, self.rows.iter().map(|r| r.embedding.as_slice())),
        }
    }
}

#[derive(Debug, Default)]
struct CollectionState {
    manifest: Option<Manifest>,
    next_id: u64,
    growing: Vec<DocumentRecord>,
    sealed: Vec<Arc<SealedSegment>>,
}

impl CollectionState {
    fn manifest(&self) -> Result<&Manifest> {
        self.manifest
            .as_ref()
            .ok_or_else(|| RagError::IndexUnavailable("collection does not exist".to_string()))
    }
}

/// Rows visible to searches, frozen at load time.
#[derive(Debug)]
struct ServingSnapshot {
    sealed: Vec<Arc<SealedSegment>>,
    growing: Vec<DocumentRecord>,
}

/// Segment store with optional on-disk persistence.
#[derive(Debug)]
pub struct SegmentCollection {
    storage: Option<PathBuf>,
    seal_rows: usize,
    state: RwLock<CollectionState>,
    serving: RwLock<Option<Arc<ServingSnapshot>>>,
}

impl SegmentCollection {
    /// A collection that lives only for the life of the process.
    #[inline]
    pub fn in_memory(seal_rows: usize) -> Self {
        Self {
            storage: None,
            seal_rows: seal_rows.max(1),
            state: RwLock::new(CollectionState::default()),
            serving: RwLock::new(None),
        }
    }

    /// Open (or prepare to create) a collection persisted under `dir`.
    pub async fn open(dir: impl AsRef<Path>, seal_rows: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        debug!("Opening segment collection at {:?}", dir);

        fs::create_dir_all(dir.join(SEGMENTS_DIR)).await.map_err(|e| {
            RagError::IndexUnavailable(format!(
                "Failed to create collection directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let state = Self::read_state(&dir).await?;
        if let Some(manifest) = &state.manifest {
            info!(
                "Opened collection '{}' with {} sealed segments and {} growing rows",
                manifest.schema.name,
                state.sealed.len(),
                state.growing.len()
            );
        }

        Ok(Self {
            storage: Some(dir),
            seal_rows: seal_rows.max(1),
            state: RwLock::new(state),
            serving: RwLock::new(None),
        })
    }

    async fn read_state(dir: &Path) -> Result<CollectionState> {
        let manifest_path = dir.join(MANIFEST_FILE);
        if !fs::try_exists(&manifest_path).await? {
            return Ok(CollectionState::default());
        }

        let manifest: Manifest = read_json(&manifest_path).await?;

        let mut sealed = Vec::with_capacity(manifest.segments.len());
        for segment_id in &manifest.segments {
            let segment: SealedSegment = read_json(&segment_path(dir, *segment_id)).await?;
            sealed.push(Arc::new(segment));
        }

        let last_sealed_id = sealed
            .iter()
            .flat_map(|s| s.rows.last())
            .map(|r| r.id)
            .max();

        // Rows already sealed may still be in the log if a seal was interrupted
        let growing: Vec<DocumentRecord> = read_growing_log(&dir.join(GROWING_LOG_FILE))
            .await?
            .into_iter()
            .filter(|r| last_sealed_id.is_none_or(|last| r.id > last))
            .collect();

        let next_id = growing
            .last()
            .map(|r| r.id)
            .or(last_sealed_id)
            .map_or(0, |id| id + 1);

        Ok(CollectionState {
            manifest: Some(manifest),
            next_id,
            growing,
            sealed,
        })
    }

    /// Seal the first `count` growing rows into a new segment.
    ///
    /// The rows stay in the growing set until the segment file and the
    /// manifest are written, so a failed seal leaves the state unchanged.
    async fn seal(&self, state: &mut CollectionState, count: usize) -> Result<()> {
        let mut manifest = state.manifest()?.clone();
        let segment_id = manifest.next_segment_id;
        let rows: Vec<DocumentRecord> = state.growing[..count].to_vec();
        let params = manifest.index;

        debug!("Sealing segment {} with {} rows", segment_id, rows.len());
        let segment = tokio::task::spawn_blocking(move || SealedSegment::build(segment_id, rows, params))
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Segment build failed: {}", e)))?;

        manifest.next_segment_id += 1;
        manifest.segments.push(segment_id);

        if let Some(dir) = &self.storage {
            write_json(&segment_path(dir, segment_id), &segment).await?;
            write_json(&dir.join(MANIFEST_FILE), &manifest).await?;
        }

        // The manifest now owns these rows
        state.growing.drain(..count);
        info!(
            "Sealed segment {} ({} rows, indexed: {})",
            segment_id,
            segment.len(),
            segment.is_indexed()
        );
        state.sealed.push(Arc::new(segment));
        state.manifest = Some(manifest);

        if let Some(dir) = &self.storage {
            // Sealed rows left in the log are skipped on reopen
            if let Err(e) = rewrite_growing_log(&dir.join(GROWING_LOG_FILE), &state.growing).await {
                warn!("Failed to compact growing log after sealing segment {}: {}", segment_id, e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CollectionBackend for SegmentCollection {
    fn name(&self) -> &'static str {
        "segment"
    }

    async fn ping(&self) -> Result<()> {
        if let Some(dir) = &self.storage {
            fs::metadata(dir).await.map_err(|e| {
                RagError::IndexUnavailable(format!(
                    "Collection directory {} is not accessible: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    async fn describe(&self) -> Result<Option<CollectionSchema>> {
        let state = self.state.read().await;
        Ok(state.manifest.as_ref().map(|m| m.schema.clone()))
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<()> {
        let mut state = self.state.write().await;
        if state.manifest.is_some() {
            return Err(RagError::Validation(format!(
                "collection '{}' already exists",
                schema.name
            )));
        }

        let manifest = Manifest {
            schema: schema.clone(),
            index: None,
            next_segment_id: 0,
            segments: Vec::new(),
        };

        if let Some(dir) = &self.storage {
            write_json(&dir.join(MANIFEST_FILE), &manifest).await?;
        }

        info!(
            "Created collection '{}' with dimension {}",
            schema.name, schema.dimension
        );
        *state = CollectionState {
            manifest: Some(manifest),
            ..CollectionState::default()
        };
        Ok(())
    }

    async fn create_index(&self, params: &IndexParams) -> Result<()> {
        let mut state = self.state.write().await;
        let mut manifest = state.manifest()?.clone();

        match manifest.index {
            Some(existing) if existing == *params => return Ok(()),
            Some(existing) => {
                return Err(RagError::Validation(format!(
                    "collection already has an index with nlist={}; recreate the collection to change it",
                    existing.nlist
                )));
            }
            None => {}
        }

        manifest.index = Some(*params);

        // Index segments that were sealed before the index existed
        let mut rebuilt = Vec::with_capacity(state.sealed.len());
        for segment in std::mem::take(&mut state.sealed) {
            if segment.is_indexed() {
                rebuilt.push(segment);
                continue;
            }

            let segment = Arc::try_unwrap(segment).unwrap_or_else(|shared| SealedSegment {
                id: shared.id,
                rows: shared.rows.clone(),
                index: None,
            });
            let params = *params;
            let segment = tokio::task::spawn_blocking(move || {
                SealedSegment::build(segment.id, segment.rows, Some(params))
            })
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Index build failed: {}", e)))?;

            if let Some(dir) = &self.storage {
                write_json(&segment_path(dir, segment.id), &segment).await?;
            }
            rebuilt.push(Arc::new(segment));
        }
        state.sealed = rebuilt;

        if let Some(dir) = &self.storage {
            write_json(&dir.join(MANIFEST_FILE), &manifest).await?;
        }

        info!("Created IVF_FLAT index with nlist={}", params.nlist);
        state.manifest = Some(manifest);
        Ok(())
    }

    async fn insert(&self, rows: Vec<NewDocument>) -> Result<Vec<u64>> {
        let mut state = self.state.write().await;
        state.manifest()?;

        let first_id = state.next_id;
        let records: Vec<DocumentRecord> = (first_id..)
            .zip(rows)
            .map(|(id, row)| DocumentRecord::from_new(id, row))
            .collect();
        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();

        if let Some(dir) = &self.storage {
            append_growing_log(&dir.join(GROWING_LOG_FILE), &records).await?;
        }

        state.next_id = first_id + records.len() as u64;
        state.growing.extend(records);
        debug!("Inserted {} rows into growing segment", ids.len());

        // The rows are durable in the growing log; a failed seal is retried
        // by the next insert or flush.
        while state.growing.len() >= self.seal_rows {
            let seal_rows = self.seal_rows;
            if let Err(e) = self.seal(&mut state, seal_rows).await {
                warn!("Deferring seal of {} growing rows: {}", state.growing.len(), e);
                break;
            }
        }

        Ok(ids)
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.manifest()?;

        if state.growing.is_empty() {
            debug!("Flush requested with no growing rows");
            return Ok(());
        }

        let count = state.growing.len();
        self.seal(&mut state, count).await
    }

    async fn load(&self) -> Result<()> {
        let state = self.state.read().await;
        state.manifest()?;

        let snapshot = ServingSnapshot {
            sealed: state.sealed.clone(),
            growing: state.growing.clone(),
        };
        drop(state);

        debug!(
            "Loaded {} sealed segments and {} growing rows for serving",
            snapshot.sealed.len(),
            snapshot.growing.len()
        );
        *self.serving.write().await = Some(Arc::new(snapshot));
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        params: &SearchParams,
        limit: usize,
    ) -> Result<Vec<Hit>> {
        let snapshot = self.serving.read().await.clone().ok_or_else(|| {
            RagError::IndexUnavailable("collection is not loaded".to_string())
        })?;

        let mut top: TopK<u64> = TopK::new(limit);
        let mut by_id = std::collections::HashMap::new();

        for segment in &snapshot.sealed {
            for scored in segment.search(vector, params.nprobe, limit) {
                let row = &segment.rows[scored.key as usize];
                top.push(scored.distance, row.id);
                by_id.insert(row.id, row);
            }
        }

        let growing = brute_force(
            vector,
            limit,
            snapshot.growing.iter().map(|r| r.embedding.as_slice()),
        );
        for scored in growing {
            let row = &snapshot.growing[scored.key as usize];
            top.push(scored.distance, row.id);
            by_id.insert(row.id, row);
        }

        Ok(top
            .into_sorted_vec()
            .into_iter()
            .filter_map(|scored| by_id.get(&scored.key).map(|row| row.to_hit(scored.distance)))
            .collect())
    }

    async fn count(&self) -> Result<u64> {
        let state = self.state.read().await;
        state.manifest()?;
        let sealed: usize = state.sealed.iter().map(|s| s.len()).sum();
        Ok((sealed + state.growing.len()) as u64)
    }

    async fn drop_collection(&self) -> Result<()> {
        let mut state = self.state.write().await;
        *self.serving.write().await = None;

        if let Some(dir) = &self.storage {
            if fs::try_exists(dir).await? {
                warn!("Removing collection data at {:?}", dir);
                fs::remove_dir_all(dir).await?;
            }
            fs::create_dir_all(dir.join(SEGMENTS_DIR)).await?;
        }

        *state = CollectionState::default();
        info!("Collection dropped");
        Ok(())
    }
}

fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(SEGMENTS_DIR).join(format!("{:08}.json", segment_id))
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read(path).await?;
    serde_json::from_slice(&content).map_err(|e| {
        RagError::IndexUnavailable(format!("Corrupt collection file {}: {}", path.display(), e))
    })
}

/// Write through a temporary file so readers never observe a partial file.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec(value).map_err(anyhow::Error::from)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn read_growing_log(path: &Path) -> Result<Vec<DocumentRecord>> {
    if !fs::try_exists(path).await? {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path).await?;
    let mut rows = Vec::new();
    for (line_number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DocumentRecord>(line) {
            Ok(row) => rows.push(row),
            Err(e) => {
                // A torn final write is the only expected way to get here
                warn!(
                    "Skipping unreadable growing log entry at line {}: {}",
                    line_number + 1,
                    e
                );
            }
        }
    }
    Ok(rows)
}

fn encode_log_lines(rows: &[DocumentRecord]) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut buffer, row).map_err(anyhow::Error::from)?;
        buffer.push(b'\n');
    }
    Ok(buffer)
}

async fn append_growing_log(path: &Path, rows: &[DocumentRecord]) -> Result<()> {
    let buffer = encode_log_lines(rows)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&buffer).await?;
    file.sync_data().await?;
    Ok(())
}

async fn rewrite_growing_log(path: &Path, rows: &[DocumentRecord]) -> Result<()> {
    let buffer = encode_log_lines(rows)?;
    let tmp_path = path.with_extension("jsonl.tmp");
    fs::write(&tmp_path, buffer).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}
