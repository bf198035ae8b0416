use super::*;
use crate::index::SegmentCollection;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize};

const DIM: usize = 4;

/// Segment store that counts calls reaching it.
struct CountingBackend {
    inner: SegmentCollection,
    loads: AtomicUsize,
    flushes: AtomicUsize,
    searches: AtomicUsize,
    load_delay: Duration,
    /// Store the rows, then report the insert as failed
    fail_after_insert: AtomicBool,
}

impl CountingBackend {
    fn new() -> Self {
        Self::with_load_delay(Duration::ZERO)
    }

    fn with_load_delay(load_delay: Duration) -> Self {
        Self {
            inner: SegmentCollection::in_memory(1024),
            loads: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            searches: AtomicUsize::new(0),
            load_delay,
            fail_after_insert: AtomicBool::new(false),
        }
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CollectionBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn describe(&self) -> Result<Option<CollectionSchema>> {
        self.inner.describe().await
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<()> {
        self.inner.create_collection(schema).await
    }

    async fn create_index(&self, params: &IndexParams) -> Result<()> {
        self.inner.create_index(params).await
    }

    async fn insert(&self, rows: Vec<NewDocument>) -> Result<Vec<u64>> {
        let ids = self.inner.insert(rows).await?;
        if self.fail_after_insert.load(Ordering::SeqCst) {
            return Err(RagError::IndexUnavailable("seal failed".to_string()));
        }
        Ok(ids)
    }

    async fn flush(&self) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.inner.flush().await
    }

    async fn load(&self) -> Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        self.inner.load().await
    }

    async fn search(
        &self,
        vector: &[f32],
        params: &SearchParams,
        limit: usize,
    ) -> Result<Vec<Hit>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.inner.search(vector, params, limit).await
    }

    async fn count(&self) -> Result<u64> {
        self.inner.count().await
    }

    async fn drop_collection(&self) -> Result<()> {
        self.inner.drop_collection().await
    }
}

/// Backend whose loads never finish in time.
struct HangingBackend(SegmentCollection);

#[async_trait]
impl CollectionBackend for HangingBackend {
    fn name(&self) -> &'static str {
        "hanging"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn describe(&self) -> Result<Option<CollectionSchema>> {
        self.0.describe().await
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<()> {
        self.0.create_collection(schema).await
    }

    async fn create_index(&self, params: &IndexParams) -> Result<()> {
        self.0.create_index(params).await
    }

    async fn insert(&self, rows: Vec<NewDocument>) -> Result<Vec<u64>> {
        self.0.insert(rows).await
    }

    async fn flush(&self) -> Result<()> {
        self.0.flush().await
    }

    async fn load(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    async fn search(&self, _: &[f32], _: &SearchParams, _: usize) -> Result<Vec<Hit>> {
        Ok(Vec::new())
    }

    async fn count(&self) -> Result<u64> {
        self.0.count().await
    }

    async fn drop_collection(&self) -> Result<()> {
        self.0.drop_collection().await
    }
}

fn options() -> EngineOptions {
    EngineOptions {
        collection: "documents".to_string(),
        dimension: DIM,
        nlist: 4,
        nprobe: 4,
        default_limit: 3,
        operation_timeout: Duration::from_secs(5),
    }
}

fn doc(source: &str, embedding: [f32; DIM]) -> NewDocument {
    NewDocument {
        source_identifier: source.to_string(),
        preview_text: format!("text of {}", source),
        embedding: embedding.to_vec(),
    }
}

async fn open_counting() -> (Arc<CountingBackend>, VectorIndexEngine) {
    let backend = Arc::new(CountingBackend::new());
    let engine = VectorIndexEngine::open(backend.clone(), options())
        .await
        .expect("engine should open");
    (backend, engine)
}

#[tokio::test]
async fn open_creates_collection_with_configured_dimension() {
    let (backend, engine) = open_counting().await;

    let schema = backend
        .describe()
        .await
        .expect("describe")
        .expect("collection should exist");
    assert_eq!(schema.dimension, DIM);
    assert_eq!(schema.name, "documents");
    assert_eq!(engine.state(), LoadState::Stale);
}

#[tokio::test]
async fn open_rejects_existing_collection_with_other_dimension() {
    let backend = Arc::new(CountingBackend::new());
    backend
        .create_collection(&CollectionSchema::new("documents", 8))
        .await
        .expect("create");

    let result = VectorIndexEngine::open(backend, options()).await;
    assert!(matches!(
        result,
        Err(RagError::DimensionMismatch {
            expected: DIM,
            actual: 8
        })
    ));
}

#[tokio::test]
async fn open_reuses_existing_collection() {
    let backend = Arc::new(CountingBackend::new());
    {
        let engine = VectorIndexEngine::open(backend.clone(), options())
            .await
            .expect("open");
        engine
            .insert(vec![doc("a", [1.0, 0.0, 0.0, 0.0])])
            .await
            .expect("insert");
    }

    let engine = VectorIndexEngine::open(backend, options())
        .await
        .expect("reopen");
    assert_eq!(engine.count().await.expect("count"), 1);
}

#[tokio::test]
async fn insert_rejects_wrong_dimension() {
    let (_backend, engine) = open_counting().await;

    let result = engine
        .insert(vec![
            doc("ok", [1.0, 0.0, 0.0, 0.0]),
            NewDocument {
                source_identifier: "short".to_string(),
                preview_text: String::new(),
                embedding: vec![1.0, 2.0],
            },
        ])
        .await;

    assert!(matches!(
        result,
        Err(RagError::DimensionMismatch {
            expected: DIM,
            actual: 2
        })
    ));
    // Nothing from the rejected batch is stored
    assert_eq!(engine.count().await.expect("count"), 0);
}

#[tokio::test]
async fn empty_insert_is_a_no_op() {
    let (_backend, engine) = open_counting().await;
    engine.query(&[0.0; DIM], 1).await.expect("query");
    assert_eq!(engine.state(), LoadState::Ready);

    let ids = engine.insert(Vec::new()).await.expect("insert");
    assert!(ids.is_empty());
    assert_eq!(engine.state(), LoadState::Ready);
}

#[tokio::test]
async fn flushed_record_is_its_own_nearest_neighbour() {
    let (_backend, engine) = open_counting().await;
    let record = doc("target", [0.3, -1.2, 4.0, 0.5]);

    engine.insert(vec![record.clone()]).await.expect("insert");
    engine.flush().await.expect("flush");

    let hits = engine.query(&record.embedding, 1).await.expect("query");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].source_identifier, "target");
    assert!(hits[0].distance.abs() < f32::EPSILON);
}

#[tokio::test]
async fn query_respects_limit_and_ordering() {
    let (_backend, engine) = open_counting().await;
    let records: Vec<NewDocument> = (0..20)
        .map(|i| doc(&format!("doc_{}", i), [i as f32, (i % 3) as f32, 0.0, 1.0]))
        .collect();
    engine.insert(records).await.expect("insert");
    engine.flush().await.expect("flush");

    let hits = engine
        .query(&[7.2, 1.0, 0.0, 1.0], 5)
        .await
        .expect("query");

    assert!(hits.len() <= 5);
    assert!(!hits.is_empty());
    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
}

#[tokio::test]
async fn query_validates_before_touching_backend() {
    let (backend, engine) = open_counting().await;

    assert!(matches!(
        engine.query(&[0.0; DIM], 0).await,
        Err(RagError::Validation(_))
    ));
    assert!(matches!(
        engine.query(&[0.0; 3], 1).await,
        Err(RagError::DimensionMismatch { .. })
    ));
    assert_eq!(backend.loads(), 0);
    assert_eq!(backend.searches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn repeated_queries_load_once() {
    let (backend, engine) = open_counting().await;
    engine
        .insert(vec![doc("a", [1.0, 0.0, 0.0, 0.0])])
        .await
        .expect("insert");

    engine.query(&[1.0, 0.0, 0.0, 0.0], 1).await.expect("query");
    engine.query(&[0.0, 1.0, 0.0, 0.0], 1).await.expect("query");

    assert_eq!(backend.loads(), 1);
    assert_eq!(engine.state(), LoadState::Ready);
}

#[tokio::test]
async fn insert_makes_engine_stale_and_next_query_reloads() {
    let (backend, engine) = open_counting().await;
    engine
        .insert(vec![doc("first", [1.0, 0.0, 0.0, 0.0])])
        .await
        .expect("insert");
    engine.query(&[1.0, 0.0, 0.0, 0.0], 1).await.expect("query");
    assert_eq!(engine.state(), LoadState::Ready);

    engine
        .insert(vec![doc("second", [0.0, 5.0, 0.0, 0.0])])
        .await
        .expect("insert");
    assert_eq!(engine.state(), LoadState::Stale);

    let hits = engine.query(&[0.0, 5.0, 0.0, 0.0], 1).await.expect("query");
    assert_eq!(hits[0].source_identifier, "second");
    assert_eq!(backend.loads(), 2);
}

#[tokio::test]
async fn failed_insert_still_makes_engine_stale() {
    let (backend, engine) = open_counting().await;
    engine.query(&[1.0, 0.0, 0.0, 0.0], 1).await.expect("query");
    assert_eq!(engine.state(), LoadState::Ready);

    backend.fail_after_insert.store(true, Ordering::SeqCst);
    let result = engine
        .insert(vec![doc("stored", [0.0, 7.0, 0.0, 0.0])])
        .await;
    assert!(matches!(result, Err(RagError::IndexUnavailable(_))));
    assert_eq!(engine.state(), LoadState::Stale);

    let hits = engine.query(&[0.0, 7.0, 0.0, 0.0], 1).await.expect("query");
    assert_eq!(hits[0].source_identifier, "stored");
    assert_eq!(backend.loads(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_queries_share_one_load() {
    let backend = Arc::new(CountingBackend::with_load_delay(Duration::from_millis(50)));
    let engine = Arc::new(
        VectorIndexEngine::open(backend.clone(), options())
            .await
            .expect("open"),
    );
    engine
        .insert(vec![doc("a", [1.0, 0.0, 0.0, 0.0])])
        .await
        .expect("insert");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.query(&[1.0, 0.0, 0.0, 0.0], 1).await })
        })
        .collect();

    for handle in handles {
        let hits = handle
            .await
            .expect("task should not panic")
            .expect("query");
        assert_eq!(hits[0].source_identifier, "a");
    }

    assert_eq!(backend.loads(), 1);
}

#[tokio::test]
async fn slow_load_times_out_as_retryable() {
    let backend = Arc::new(HangingBackend(SegmentCollection::in_memory(16)));
    let engine = VectorIndexEngine::open(
        backend,
        EngineOptions {
            operation_timeout: Duration::from_millis(20),
            ..options()
        },
    )
    .await
    .expect("open");

    let error = engine
        .query(&[0.0; DIM], 1)
        .await
        .expect_err("load should time out");
    assert!(matches!(error, RagError::Timeout { operation: "load", .. }));
    assert!(error.is_retryable());
    assert_eq!(engine.state(), LoadState::Stale);
}

#[tokio::test]
async fn status_reports_counters() {
    let (_backend, engine) = open_counting().await;
    engine
        .insert(vec![
            doc("a", [1.0, 0.0, 0.0, 0.0]),
            doc("b", [2.0, 0.0, 0.0, 0.0]),
        ])
        .await
        .expect("insert");
    engine.flush().await.expect("flush");
    engine.query(&[1.0, 0.0, 0.0, 0.0], 1).await.expect("query");

    let status = engine.status().await.expect("status");
    assert_eq!(status.backend, "counting");
    assert_eq!(status.rows, 2);
    assert_eq!(status.inserts, 2);
    assert_eq!(status.flushes, 1);
    assert_eq!(status.loads, 1);
    assert_eq!(status.state, LoadState::Ready);
}

#[tokio::test]
async fn drop_collection_leaves_empty_collection() {
    let (_backend, engine) = open_counting().await;
    engine
        .insert(vec![doc("a", [1.0, 0.0, 0.0, 0.0])])
        .await
        .expect("insert");
    engine.query(&[1.0, 0.0, 0.0, 0.0], 1).await.expect("query");

    engine.drop_collection().await.expect("drop");

    assert_eq!(engine.state(), LoadState::Stale);
    assert_eq!(engine.count().await.expect("count"), 0);
    assert!(engine.query(&[1.0, 0.0, 0.0, 0.0], 1).await.expect("query").is_empty());
}
