// Vector index module
// Document records, the storage backend contract and the query engine that guards it

pub mod engine;
pub mod ivf;
pub mod lance;
pub mod segment;


use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{RagError, Result};

pub use engine::{EngineOptions, EngineStatus, LoadState, VectorIndexEngine};
pub use lance::LanceCollection;
pub use segment::SegmentCollection;

/// Byte limit for the string columns of a collection.
pub const MAX_VARCHAR_BYTES: usize = 300;

/// A document ready for insertion; the backend assigns its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDocument {
    pub source_identifier: String,
    pub preview_text: String,
    pub embedding: Vec<f32>,
}

impl NewDocument {
    /// Build a record from the full document text.
    ///
    /// The preview keeps at most [`MAX_VARCHAR_BYTES`] of `text`. A source identifier
    /// over the limit is rejected rather than cut.
    #[inline]
    pub fn new(source_identifier: impl Into<String>, text: &str, embedding: Vec<f32>) -> Result<Self> {
        let source_identifier = source_identifier.into();
        validate_source_identifier(&source_identifier)?;

        Ok(Self {
            source_identifier,
            preview_text: truncate_preview(text).to_string(),
            embedding,
        })
    }
}

/// A stored document. Records are never modified after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: u64,
    pub source_identifier: String,
    pub preview_text: String,
    pub embedding: Vec<f32>,
}

impl DocumentRecord {
    #[inline]
    pub fn from_new(id: u64, document: NewDocument) -> Self {
        Self {
            id,
            source_identifier: document.source_identifier,
            preview_text: document.preview_text,
            embedding: document.embedding,
        }
    }

    #[inline]
    pub fn to_hit(&self, distance: f32) -> Hit {
        Hit {
            id: self.id,
            source_identifier: self.source_identifier.clone(),
            preview_text: self.preview_text.clone(),
            distance,
        }
    }
}

/// One search result. Embeddings are never returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub id: u64,
    pub source_identifier: String,
    pub preview_text: String,
    /// Squared L2 distance to the query, lower is closer
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub dimension: usize,
    pub varchar_max_bytes: usize,
}

impl CollectionSchema {
    #[inline]
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            dimension,
            varchar_max_bytes: MAX_VARCHAR_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricType {
    /// Squared Euclidean distance
    #[default]
    L2,
}

/// IVF_FLAT build parameters, fixed for the lifetime of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexParams {
    pub nlist: usize,
    pub metric: MetricType,
}

impl IndexParams {
    #[inline]
    pub fn ivf_flat(nlist: usize) -> Self {
        Self {
            nlist,
            metric: MetricType::L2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchParams {
    pub nprobe: usize,
}

/// Storage behind the [`VectorIndexEngine`].
///
/// Rows are written into segments; a backend only serves searches from the
/// state captured by its most recent [`load`](CollectionBackend::load).
#[async_trait]
pub trait CollectionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Schema of the collection, or `None` if it has not been created.
    async fn describe(&self) -> Result<Option<CollectionSchema>>;

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<()>;

    /// Register the ANN index. Idempotent for identical parameters.
    async fn create_index(&self, params: &IndexParams) -> Result<()>;

    /// Append rows, returning the assigned ids in input order.
    async fn insert(&self, rows: Vec<NewDocument>) -> Result<Vec<u64>>;

    /// Seal every open segment so its rows are indexed instead of scanned.
    async fn flush(&self) -> Result<()>;

    /// Materialize the collection in serving form.
    async fn load(&self) -> Result<()>;

    async fn search(
        &self,
        vector: &[f32],
        params: &SearchParams,
        limit: usize,
    ) -> Result<Vec<Hit>>;

    async fn count(&self) -> Result<u64>;

    /// Remove the collection and all of its rows.
    async fn drop_collection(&self) -> Result<()>;
}

/// Longest prefix of `text` that fits in [`MAX_VARCHAR_BYTES`] without splitting a character.
#[inline]
pub fn truncate_preview(text: &str) -> &str {
    if text.len() <= MAX_VARCHAR_BYTES {
        return text;
    }

    let mut end = MAX_VARCHAR_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.get(..end).unwrap_or_default()
}

pub(crate) fn validate_source_identifier(source_identifier: &str) -> Result<()> {
    if source_identifier.trim().is_empty() {
        return Err(RagError::Validation(
            "source identifier cannot be empty".to_string(),
        ));
    }

    if source_identifier.len() > MAX_VARCHAR_BYTES {
        return Err(RagError::Validation(format!(
            "source identifier is {} bytes, limit is {}",
            source_identifier.len(),
            MAX_VARCHAR_BYTES
        )));
    }

    Ok(())
}
