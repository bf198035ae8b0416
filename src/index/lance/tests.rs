use super::*;
use tempfile::TempDir;

const DIM: usize = 5;

async fn create_test_collection() -> (LanceCollection, TempDir) {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let collection = LanceCollection::connect(temp_dir.path(), "documents")
        .await
        .expect("should connect to lancedb");
    (collection, temp_dir)
}

fn create_test_document(index: usize) -> NewDocument {
    // Consistent 5-dimensional vectors, spaced out along the first axis
    let mut vector = vec![0.1, 0.2, 0.3, 0.4, 0.5];
    vector[0] += index as f32;

    NewDocument {
        source_identifier: format!("doc_{}.txt", index),
        preview_text: format!("This is test content for document {}", index),
        embedding: vector,
    }
}

#[tokio::test]
async fn describe_missing_table_is_none() {
    let (collection, _temp_dir) = create_test_collection().await;
    assert!(collection.describe().await.expect("describe").is_none());
    assert!(collection.ping().await.is_ok());
}

#[tokio::test]
async fn create_collection_records_dimension() {
    let (collection, _temp_dir) = create_test_collection().await;
    collection
        .create_collection(&CollectionSchema::new("documents", DIM))
        .await
        .expect("should create table");

    let schema = collection
        .describe()
        .await
        .expect("describe")
        .expect("table should exist");
    assert_eq!(schema.dimension, DIM);
    assert_eq!(schema.varchar_max_bytes, MAX_VARCHAR_BYTES);

    assert!(matches!(
        collection
            .create_collection(&CollectionSchema::new("documents", DIM))
            .await,
        Err(RagError::Validation(_))
    ));
}

#[tokio::test]
async fn insert_assigns_sequential_ids() {
    let (collection, _temp_dir) = create_test_collection().await;
    collection
        .create_collection(&CollectionSchema::new("documents", DIM))
        .await
        .expect("should create table");

    let first = collection
        .insert((0..3).map(create_test_document).collect())
        .await
        .expect("should insert");
    let second = collection
        .insert(vec![create_test_document(3)])
        .await
        .expect("should insert");

    assert_eq!(first, vec![0, 1, 2]);
    assert_eq!(second, vec![3]);
    assert_eq!(collection.count().await.expect("count"), 4);
}

#[tokio::test]
async fn search_requires_load() {
    let (collection, _temp_dir) = create_test_collection().await;
    collection
        .create_collection(&CollectionSchema::new("documents", DIM))
        .await
        .expect("should create table");
    collection
        .insert(vec![create_test_document(0)])
        .await
        .expect("should insert");

    let result = collection
        .search(&[0.1, 0.2, 0.3, 0.4, 0.5], &SearchParams { nprobe: 10 }, 1)
        .await;
    assert!(matches!(result, Err(RagError::IndexUnavailable(_))));
}

#[tokio::test]
async fn search_returns_nearest_rows() {
    let (collection, _temp_dir) = create_test_collection().await;
    collection
        .create_collection(&CollectionSchema::new("documents", DIM))
        .await
        .expect("should create table");
    collection
        .create_index(&IndexParams::ivf_flat(128))
        .await
        .expect("should register index");
    collection
        .insert((0..5).map(create_test_document).collect())
        .await
        .expect("should insert");

    // Fewer rows than nlist, so the flush only compacts
    collection.flush().await.expect("should flush");
    collection.load().await.expect("should load");

    let query = create_test_document(2).embedding;
    let hits = collection
        .search(&query, &SearchParams { nprobe: 10 }, 3)
        .await
        .expect("should search");

    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].source_identifier, "doc_2.txt");
    assert!(hits[0].distance.abs() < 1e-5);
    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
}

#[tokio::test]
async fn drop_collection_removes_table() {
    let (collection, _temp_dir) = create_test_collection().await;
    collection
        .create_collection(&CollectionSchema::new("documents", DIM))
        .await
        .expect("should create table");
    collection
        .insert(vec![create_test_document(0)])
        .await
        .expect("should insert");
    collection.load().await.expect("should load");

    collection.drop_collection().await.expect("should drop");

    assert!(collection.describe().await.expect("describe").is_none());
    assert!(
        collection
            .search(&[0.0; DIM], &SearchParams { nprobe: 10 }, 1)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn interrupted_insert_recounts_ids() {
    let (collection, _temp_dir) = create_test_collection().await;
    collection
        .create_collection(&CollectionSchema::new("documents", DIM))
        .await
        .expect("should create table");
    collection
        .insert((0..3).map(create_test_document).collect())
        .await
        .expect("should insert");

    // As left behind by an insert cancelled mid-write
    *collection.next_id.lock().await = None;

    let ids = collection
        .insert(vec![create_test_document(3)])
        .await
        .expect("should insert");
    assert_eq!(ids, vec![3]);
}

fn result_batch(distances: Option<Vec<Option<f32>>>) -> RecordBatch {
    let mut fields = vec![
        Field::new("id", DataType::UInt64, false),
        Field::new("source_identifier", DataType::Utf8, false),
        Field::new("preview_text", DataType::Utf8, false),
    ];
    let mut columns: Vec<Arc<dyn Array>> = vec![
        Arc::new(UInt64Array::from(vec![7u64])),
        Arc::new(StringArray::from(vec!["doc_7.txt"])),
        Arc::new(StringArray::from(vec!["preview"])),
    ];
    if let Some(distances) = distances {
        fields.push(Field::new("_distance", DataType::Float32, true));
        columns.push(Arc::new(Float32Array::from(distances)));
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).expect("valid batch")
}

#[test]
fn search_results_need_distances() {
    let hits = LanceCollection::parse_search_batch(&result_batch(Some(vec![Some(2.5)])))
        .expect("should parse");
    assert_eq!(hits[0].id, 7);
    assert!((hits[0].distance - 2.5).abs() < f32::EPSILON);

    assert!(matches!(
        LanceCollection::parse_search_batch(&result_batch(None)),
        Err(RagError::IndexUnavailable(_))
    ));
    assert!(matches!(
        LanceCollection::parse_search_batch(&result_batch(Some(vec![None]))),
        Err(RagError::IndexUnavailable(_))
    ));
}
