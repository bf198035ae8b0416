#[cfg(test)]
mod tests;

use super::{
    CollectionBackend, CollectionSchema, Hit, IndexParams, MAX_VARCHAR_BYTES, NewDocument,
    SearchParams,
};
use crate::{RagError, Result};
use arrow::array::{Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::index::Index;
use lancedb::index::vector::IvfFlatIndexBuilder;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::table::OptimizeAction;
use lancedb::{Connection, DistanceType, Table};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const VECTOR_COLUMN: &str = "embedding";

/// Collection stored in a LanceDB table.
///
/// LanceDB writes every insert as a new data fragment; `flush` compacts the
/// fragments and folds them into the IVF_FLAT index, building the index once
/// the table holds enough rows to train `nlist` partitions.
pub struct LanceCollection {
    connection: Connection,
    table_name: String,
    index_params: Mutex<Option<IndexParams>>,
    next_id: Mutex<Option<u64>>,
    serving: RwLock<Option<Table>>,
}

impl LanceCollection {
    /// Connect to the LanceDB database at `path`.
    #[inline]
    pub async fn connect(path: &Path, table_name: &str) -> Result<Self> {
        debug!("Initializing LanceDB at path: {:?}", path);

        std::fs::create_dir_all(path).map_err(|e| {
            RagError::IndexUnavailable(format!("Failed to create vector database directory: {}", e))
        })?;

        let uri = format!("file://{}", path.display());
        let connection = lancedb::connect(&uri).execute().await.map_err(|e| {
            RagError::IndexUnavailable(format!("Failed to connect to LanceDB: {}", e))
        })?;

        Ok(Self {
            connection,
            table_name: table_name.to_string(),
            index_params: Mutex::new(None),
            next_id: Mutex::new(None),
            serving: RwLock::new(None),
        })
    }

    fn create_schema(vector_dim: usize) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::UInt64, false),
            Field::new("source_identifier", DataType::Utf8, false),
            Field::new("preview_text", DataType::Utf8, false),
            Field::new(
                VECTOR_COLUMN,
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    vector_dim as i32,
                ),
                false,
            ),
        ]))
    }

    async fn table_exists(&self) -> Result<bool> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to list tables: {}", e)))?;
        Ok(table_names.contains(&self.table_name))
    }

    async fn open_table(&self) -> Result<Table> {
        self.connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to open table: {}", e)))
    }

    /// Detect vector dimension from existing table schema
    async fn detect_vector_dimension(table: &Table) -> Result<usize> {
        let schema = table
            .schema()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to get table schema: {}", e)))?;

        for field in schema.fields() {
            if field.name() == VECTOR_COLUMN {
                if let DataType::FixedSizeList(_, size) = field.data_type() {
                    return Ok(*size as usize);
                }
            }
        }

        Err(RagError::IndexUnavailable(
            "Could not find vector column or determine dimension".to_string(),
        ))
    }

    async fn has_vector_index(table: &Table) -> Result<bool> {
        let indices = table
            .list_indices()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to list indices: {}", e)))?;
        Ok(indices
            .iter()
            .any(|index| index.columns.iter().any(|c| c == VECTOR_COLUMN)))
    }

    /// Create a RecordBatch from documents and their assigned ids
    fn create_record_batch(
        ids: &[u64],
        rows: &[NewDocument],
        vector_dim: usize,
    ) -> Result<RecordBatch> {
        let mut flat_values = Vec::with_capacity(rows.len() * vector_dim);
        for row in rows {
            flat_values.extend_from_slice(&row.embedding);
        }

        let values_array = Float32Array::from(flat_values);
        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array =
            FixedSizeListArray::try_new(field, vector_dim as i32, Arc::new(values_array), None)
                .map_err(|e| {
                    RagError::IndexUnavailable(format!("Failed to create vector array: {}", e))
                })?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(UInt64Array::from(ids.to_vec())),
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|r| r.source_identifier.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                rows.iter().map(|r| r.preview_text.as_str()),
            )),
            Arc::new(vector_array),
        ];

        RecordBatch::try_new(Self::create_schema(vector_dim), arrays).map_err(|e| {
            RagError::IndexUnavailable(format!("Failed to create record batch: {}", e))
        })
    }

    /// Parse a single record batch from search results
    fn parse_search_batch(batch: &RecordBatch) -> Result<Vec<Hit>> {
        let ids = batch
            .column_by_name("id")
            .ok_or_else(|| RagError::IndexUnavailable("Missing id column".to_string()))?
            .as_any()
            .downcast_ref::<UInt64Array>()
            .ok_or_else(|| RagError::IndexUnavailable("Invalid id column type".to_string()))?;

        let sources = batch
            .column_by_name("source_identifier")
            .ok_or_else(|| {
                RagError::IndexUnavailable("Missing source_identifier column".to_string())
            })?
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| {
                RagError::IndexUnavailable("Invalid source_identifier column type".to_string())
            })?;

        let previews = batch
            .column_by_name("preview_text")
            .ok_or_else(|| RagError::IndexUnavailable("Missing preview_text column".to_string()))?
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| {
                RagError::IndexUnavailable("Invalid preview_text column type".to_string())
            })?;

        let distances = batch
            .column_by_name("_distance")
            .ok_or_else(|| RagError::IndexUnavailable("Missing _distance column".to_string()))?
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| {
                RagError::IndexUnavailable("Invalid _distance column type".to_string())
            })?;

        (0..batch.num_rows())
            .map(|row| {
                if distances.is_null(row) {
                    return Err(RagError::IndexUnavailable(format!(
                        "Search result for id {} has no distance",
                        ids.value(row)
                    )));
                }
                Ok(Hit {
                    id: ids.value(row),
                    source_identifier: sources.value(row).to_string(),
                    preview_text: previews.value(row).to_string(),
                    distance: distances.value(row),
                })
            })
            .collect()
    }
}

#[async_trait]
impl CollectionBackend for LanceCollection {
    fn name(&self) -> &'static str {
        "lance"
    }

    async fn ping(&self) -> Result<()> {
        self.table_exists().await.map(|_| ())
    }

    async fn describe(&self) -> Result<Option<CollectionSchema>> {
        if !self.table_exists().await? {
            return Ok(None);
        }

        let table = self.open_table().await?;
        let dimension = Self::detect_vector_dimension(&table).await?;
        Ok(Some(CollectionSchema {
            name: self.table_name.clone(),
            dimension,
            varchar_max_bytes: MAX_VARCHAR_BYTES,
        }))
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<()> {
        if self.table_exists().await? {
            return Err(RagError::Validation(format!(
                "collection '{}' already exists",
                self.table_name
            )));
        }

        self.connection
            .create_empty_table(&self.table_name, Self::create_schema(schema.dimension))
            .execute()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to create table: {}", e)))?;

        *self.next_id.lock().await = Some(0);
        info!(
            "Created table '{}' with {} dimensions",
            self.table_name, schema.dimension
        );
        Ok(())
    }

    async fn create_index(&self, params: &IndexParams) -> Result<()> {
        // Training needs data, so the index itself is built by the first flush
        // that has at least `nlist` rows available
        *self.index_params.lock().await = Some(*params);
        debug!("Registered IVF_FLAT parameters nlist={}", params.nlist);
        Ok(())
    }

    async fn insert(&self, rows: Vec<NewDocument>) -> Result<Vec<u64>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let table = self.open_table().await?;
        let vector_dim = Self::detect_vector_dimension(&table).await?;

        // Holding the id lock across the write keeps ids dense and ordered
        let mut next_id = self.next_id.lock().await;
        // Cleared until the write is known to have landed, so an interrupted
        // insert recounts the table instead of reusing ids
        let first_id = match next_id.take() {
            Some(id) => id,
            None => table
                .count_rows(None)
                .await
                .map_err(|e| RagError::IndexUnavailable(format!("Failed to count rows: {}", e)))?
                as u64,
        };
        let ids: Vec<u64> = (first_id..first_id + rows.len() as u64).collect();

        let record_batch = Self::create_record_batch(&ids, &rows, vector_dim)?;
        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to insert rows: {}", e)))?;

        *next_id = Some(first_id + ids.len() as u64);
        debug!("Inserted {} rows into '{}'", ids.len(), self.table_name);
        Ok(ids)
    }

    async fn flush(&self) -> Result<()> {
        let table = self.open_table().await?;

        table
            .optimize(OptimizeAction::All)
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to optimize table: {}", e)))?;

        let Some(params) = *self.index_params.lock().await else {
            return Ok(());
        };

        if Self::has_vector_index(&table).await? {
            return Ok(());
        }

        let rows = table
            .count_rows(None)
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to count rows: {}", e)))?;
        if rows < params.nlist {
            debug!(
                "Deferring IVF_FLAT build: {} rows, nlist={}",
                rows, params.nlist
            );
            return Ok(());
        }

        table
            .create_index(
                &[VECTOR_COLUMN],
                Index::IvfFlat(
                    IvfFlatIndexBuilder::default()
                        .distance_type(DistanceType::L2)
                        .num_partitions(params.nlist as u32),
                ),
            )
            .execute()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to create vector index: {}", e)))?;

        info!("Built IVF_FLAT index over {} rows", rows);
        Ok(())
    }

    async fn load(&self) -> Result<()> {
        let table = self.open_table().await?;
        *self.serving.write().await = Some(table);
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        params: &SearchParams,
        limit: usize,
    ) -> Result<Vec<Hit>> {
        let table = self.serving.read().await.clone().ok_or_else(|| {
            RagError::IndexUnavailable("collection is not loaded".to_string())
        })?;

        let mut results = table
            .vector_search(vector)
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to create vector search: {}", e)))?
            .column(VECTOR_COLUMN)
            .distance_type(DistanceType::L2)
            .nprobes(params.nprobe)
            .select(Select::columns(&["id", "source_identifier", "preview_text"]))
            .limit(limit)
            .execute()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to execute search: {}", e)))?;

        let mut hits = Vec::new();
        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to read result stream: {}", e)))?
        {
            hits.extend(Self::parse_search_batch(&batch)?);
        }

        debug!("Parsed {} search results from stream", hits.len());
        Ok(hits)
    }

    async fn count(&self) -> Result<u64> {
        let table = self.open_table().await?;
        let count = table
            .count_rows(None)
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("Failed to count rows: {}", e)))?;
        Ok(count as u64)
    }

    async fn drop_collection(&self) -> Result<()> {
        *self.serving.write().await = None;
        *self.next_id.lock().await = None;

        if self.table_exists().await? {
            warn!("Dropping table '{}'", self.table_name);
            self.connection
                .drop_table(&self.table_name)
                .await
                .map_err(|e| RagError::IndexUnavailable(format!("Failed to drop table: {}", e)))?;
        }
        Ok(())
    }
}
