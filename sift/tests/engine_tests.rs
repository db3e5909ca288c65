//! Integration tests for the full engine behind the broker.
//!
//! These cover end-to-end behavior through the `Database` handle:
//! - multilingual lexical search through the Unicode tokenizer
//! - atomic batch ingest and rollback
//! - hybrid fusion over both branches
//! - embedding cache tier promotion
//! - provider timeouts falling back to the queue
//! - query latency while a batch embed runs

use serde_json::json;
use sift::embed::EmbeddingSource;
use sift::{
    BrokerConfig, CollectionConfig, Database, DocumentInput, ErrorKind, FusionKind,
    InsertOptions, PragmaConfig, SearchRequest,
};
use sift_embed::MockProvider;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DIMS: usize = 8;

fn pragmas() -> PragmaConfig {
    let mut pragmas = PragmaConfig::default();
    pragmas.vector_dimensions = DIMS;
    pragmas
}

fn collection_config(name: &str, auto_generate: bool) -> CollectionConfig {
    CollectionConfig {
        name: name.to_string(),
        provider_id: "mock".to_string(),
        model_id: "mock-v1".to_string(),
        dimensions: DIMS,
        auto_generate,
        batch_size: 4,
        description: None,
    }
}

fn doc(id: &str, title: Option<&str>, content: &str) -> DocumentInput {
    DocumentInput {
        id: id.to_string(),
        title: title.map(str::to_string),
        content: content.to_string(),
        metadata: None,
    }
}

async fn launch(provider: MockProvider) -> Database {
    let db = Database::launch(BrokerConfig::default(), vec![Arc::new(provider)]);
    db.open(":memory:", Some(pragmas())).await.unwrap();
    db
}

async fn table_counts(db: &Database) -> (i64, i64, i64) {
    let docs = db
        .exec("SELECT COUNT(*) FROM documents", vec![])
        .await
        .unwrap();
    let fts = db
        .exec("SELECT COUNT(*) FROM documents_fts", vec![])
        .await
        .unwrap();
    let vectors = db
        .exec("SELECT COUNT(*) FROM doc_vectors", vec![])
        .await
        .unwrap();
    (
        docs.rows[0][0].as_i64().unwrap(),
        fts.rows[0][0].as_i64().unwrap(),
        vectors.rows[0][0].as_i64().unwrap(),
    )
}

#[tokio::test]
async fn test_multilingual_lexical_search() {
    let db = launch(MockProvider::new(DIMS)).await;
    db.create_collection(collection_config("library", false))
        .await
        .unwrap();

    db.bulk_insert(
        "library",
        vec![
            doc("en", Some("Russian Literature"), "Essays on Tolstoy in English"),
            doc("ru", Some("Русская литература"), "Толстой и Достоевский"),
            doc("jp", Some("日本文学"), "川端康成と三島由紀夫"),
        ],
        None,
    )
    .await
    .unwrap();

    // Parameter-bound Cyrillic query must hit exactly the Russian document.
    let response = db
        .search(SearchRequest {
            text: Some("Русская".to_string()),
            collection: "library".to_string(),
            limit: 10,
            ..SearchRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].id, "ru");
    assert_eq!(response.results[0].sources, vec!["fts"]);
}

#[tokio::test]
async fn test_atomic_rollback_on_duplicate_in_batch() {
    let db = launch(MockProvider::new(DIMS)).await;
    db.create_collection(collection_config("notes", false))
        .await
        .unwrap();

    // Seed one document so pre-call counts are non-zero.
    db.bulk_insert("notes", vec![doc("seed", None, "seed content")], None)
        .await
        .unwrap();
    let before = table_counts(&db).await;

    let mut batch: Vec<DocumentInput> = (0..10)
        .map(|i| doc(&format!("doc-{}", i), None, "batch content"))
        .collect();
    batch[7].id = "doc-3".to_string();

    let err = db.bulk_insert("notes", batch, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    assert_eq!(err.details(), Some(json!({ "document_index": 7 })));

    // Post-state row counts equal pre-call state across all three tables.
    assert_eq!(table_counts(&db).await, before);
}

#[tokio::test]
async fn test_atomic_rollback_on_existing_duplicate() {
    let db = launch(MockProvider::new(DIMS)).await;
    db.create_collection(collection_config("notes", true))
        .await
        .unwrap();

    db.bulk_insert("notes", vec![doc("taken", None, "original")], None)
        .await
        .unwrap();
    let before = table_counts(&db).await;

    let batch = vec![
        doc("new-1", None, "x"),
        doc("new-2", None, "y"),
        doc("taken", None, "z"),
    ];
    let err = db.bulk_insert("notes", batch, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    assert_eq!(err.details(), Some(json!({ "document_index": 2 })));
    assert_eq!(table_counts(&db).await, before);
}

#[tokio::test]
async fn test_hybrid_fusion_rrf() {
    let db = launch(MockProvider::new(DIMS)).await;
    db.create_collection(collection_config("ai", true))
        .await
        .unwrap();

    let corpus = vec![
        doc(
            "deep",
            Some("Deep learning"),
            "Deep learning with machine learning foundations and neural networks",
        ),
        doc(
            "svm",
            Some("Support vector machines"),
            "Classic machine learning with kernel methods",
        ),
        doc("rl", Some("Reinforcement learning"), "Agents learning from reward signals"),
        doc("nlp", Some("Language models"), "Transformers for natural language"),
        doc("cv", Some("Computer vision"), "Convolutional networks for images"),
    ];
    db.bulk_insert("ai", corpus, None).await.unwrap();

    // Pre-computed embedding of the "deep" document's exact embedding text,
    // so the vector branch's top-1 is unambiguous.
    let query_vector = MockProvider::vector_for(
        "Deep learning\n\nDeep learning with machine learning foundations and neural networks",
        DIMS,
    );

    let response = db
        .search(SearchRequest {
            text: Some("machine learning".to_string()),
            vector: Some(query_vector),
            collection: "ai".to_string(),
            limit: 3,
            fusion: FusionKind::Rrf,
            ..SearchRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(response.results.len(), 3);
    for result in &response.results {
        assert!(!result.sources.is_empty());
    }
    for pair in response.results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    // The document strong in both branches wins.
    assert_eq!(response.results[0].id, "deep");
    assert!(response.results[0].fts_rank.is_some());
    assert!(response.results[0].vec_rank.is_some());
    assert!(response.results[0].score > response.results[2].score);
}

#[tokio::test]
async fn test_weighted_fusion_through_broker() {
    let db = launch(MockProvider::new(DIMS)).await;
    db.create_collection(collection_config("ai", true))
        .await
        .unwrap();
    db.bulk_insert(
        "ai",
        vec![
            doc("a", None, "gradient descent optimization"),
            doc("b", None, "stochastic gradient methods"),
        ],
        None,
    )
    .await
    .unwrap();

    let response = db
        .search(SearchRequest {
            text: Some("gradient".to_string()),
            collection: "ai".to_string(),
            limit: 5,
            fusion: FusionKind::Weighted,
            weights: Some(sift::FusionWeights { fts: 0.7, vec: 0.3 }),
            ..SearchRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(response.results.len(), 2);

    // Weights that do not sum to 1 are rejected up front.
    let err = db
        .search(SearchRequest {
            text: Some("gradient".to_string()),
            collection: "ai".to_string(),
            limit: 5,
            fusion: FusionKind::Weighted,
            weights: Some(sift::FusionWeights { fts: 0.9, vec: 0.9 }),
            ..SearchRequest::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn test_cache_tier_promotion() {
    let db = launch(MockProvider::new(DIMS)).await;
    db.create_collection(collection_config("notes", true))
        .await
        .unwrap();

    let first = db.generate_embedding("notes", "test").await.unwrap();
    assert_eq!(first.source, EmbeddingSource::Provider);
    assert_eq!(first.dimensions, DIMS);

    let second = db.generate_embedding("notes", "test").await.unwrap();
    assert_eq!(second.source, EmbeddingSource::CacheMemory);

    // Byte-identical across the provider call and the cache hit.
    assert_eq!(first.vector, second.vector);
}

#[tokio::test]
async fn test_provider_timeout_during_batch_queues_documents() {
    let db = launch(MockProvider::new(DIMS).with_delay(Duration::from_secs(10))).await;
    db.create_collection(collection_config("slow", true))
        .await
        .unwrap();

    let batch: Vec<DocumentInput> = (0..5)
        .map(|i| doc(&format!("slow-{}", i), None, "body text"))
        .collect();
    let outcomes = db
        .bulk_insert(
            "slow",
            batch,
            Some(InsertOptions {
                generate_embedding: Some(true),
                embed_budget_ms: Some(100),
            }),
        )
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 5);
    assert!(outcomes.iter().all(|o| !o.embedding_generated));

    // All five persisted, no vectors, queue holds them in insertion order.
    assert_eq!(table_counts(&db).await, (5, 5, 0));
    let queue = db
        .exec(
            "SELECT document_id FROM embedding_queue ORDER BY id",
            vec![],
        )
        .await
        .unwrap();
    let ids: Vec<&str> = queue
        .rows
        .iter()
        .map(|row| row[0].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["slow-0", "slow-1", "slow-2", "slow-3", "slow-4"]);
}

#[tokio::test]
async fn test_queue_drains_after_provider_recovers() {
    let db = launch(MockProvider::new(DIMS).with_delay(Duration::from_millis(500))).await;
    db.create_collection(collection_config("notes", true))
        .await
        .unwrap();

    db.bulk_insert(
        "notes",
        vec![doc("later", None, "embed me eventually")],
        Some(InsertOptions {
            generate_embedding: Some(true),
            embed_budget_ms: Some(50),
        }),
    )
    .await
    .unwrap();
    assert_eq!(table_counts(&db).await, (1, 1, 0));

    // The queue consumer runs under the pipeline's own (longer) timeout.
    let outcome = db.process_queue(None).await.unwrap();
    assert_eq!(outcome.processed, 1);
    assert_eq!(outcome.remaining, 0);
    assert_eq!(table_counts(&db).await, (1, 1, 1));

    let status = db.collection_status("notes").await.unwrap();
    assert_eq!(status.documents_total, 1);
    assert_eq!(status.documents_embedded, 1);
    assert!(status.ready);
}

#[tokio::test]
async fn test_queries_interleave_with_batch_generate() {
    let db = launch(MockProvider::new(DIMS).with_delay(Duration::from_millis(20))).await;
    db.create_collection(collection_config("bulk", false))
        .await
        .unwrap();

    let batch: Vec<DocumentInput> = (0..50)
        .map(|i| doc(&format!("bulk-{}", i), None, &format!("document body {}", i)))
        .collect();
    db.bulk_insert("bulk", batch, None).await.unwrap();

    let ids: Vec<String> = (0..50).map(|i| format!("bulk-{}", i)).collect();
    let generate = {
        let db = db.clone();
        tokio::spawn(async move { db.batch_generate("bulk", ids).await })
    };

    // While the batch embeds (13 chunks x 20 ms provider delay), point
    // queries keep flowing between chunks.
    tokio::time::sleep(Duration::from_millis(30)).await;
    for _ in 0..3 {
        let started = Instant::now();
        let result = db.exec("SELECT 1", vec![]).await.unwrap();
        assert_eq!(result.rows[0][0], json!(1));
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "query stalled behind batch embed: {:?}",
            started.elapsed()
        );
    }

    let outcome = generate.await.unwrap().unwrap();
    assert_eq!(outcome.success_count, 50);
    assert_eq!(table_counts(&db).await, (50, 50, 50));
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("source.db");
    let target_path = dir.path().join("target.db");

    let db = Database::launch(
        BrokerConfig::default(),
        vec![Arc::new(MockProvider::new(DIMS))],
    );
    db.open(source_path.to_str().unwrap(), Some(pragmas()))
        .await
        .unwrap();
    db.create_collection(collection_config("notes", true))
        .await
        .unwrap();
    db.bulk_insert(
        "notes",
        vec![
            doc("one", Some("First"), "exported content alpha"),
            doc("two", Some("Second"), "exported content beta"),
        ],
        None,
    )
    .await
    .unwrap();

    let bytes = db.export().await.unwrap();
    assert!(!bytes.is_empty());

    let restored = Database::launch(
        BrokerConfig::default(),
        vec![Arc::new(MockProvider::new(DIMS))],
    );
    restored
        .open(target_path.to_str().unwrap(), Some(pragmas()))
        .await
        .unwrap();
    restored.import(bytes, true).await.unwrap();

    // The observable query surface matches the source.
    assert_eq!(table_counts(&restored).await, (2, 2, 2));
    let response = restored
        .search(SearchRequest {
            text: Some("alpha".to_string()),
            collection: "notes".to_string(),
            limit: 10,
            ..SearchRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].id, "one");

    // Garbage bytes are rejected with a typed error, state untouched.
    let err = restored.import(b"not a database".to_vec(), true).await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::SqlError | ErrorKind::SchemaMismatch | ErrorKind::StorageError
    ));
    assert_eq!(table_counts(&restored).await, (2, 2, 2));
}

#[tokio::test]
async fn test_vector_dimension_invariant_via_broker() {
    let db = launch(MockProvider::new(DIMS)).await;

    // Collections must declare the database's vector dimensionality.
    let err = db
        .create_collection(CollectionConfig {
            dimensions: DIMS * 2,
            ..collection_config("wide", false)
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DimensionMismatch);

    db.create_collection(collection_config("ok", false))
        .await
        .unwrap();
    let err = db
        .search(SearchRequest {
            vector: Some(vec![0.0; DIMS + 3]),
            collection: "ok".to_string(),
            limit: 5,
            ..SearchRequest::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
}

#[tokio::test]
async fn test_update_and_delete_keep_row_parity() {
    let db = launch(MockProvider::new(DIMS)).await;
    db.create_collection(collection_config("notes", true))
        .await
        .unwrap();

    db.bulk_insert(
        "notes",
        vec![doc("a", None, "alpha"), doc("b", None, "beta")],
        None,
    )
    .await
    .unwrap();
    assert_eq!(table_counts(&db).await, (2, 2, 2));

    db.update_document("notes", doc("a", Some("Updated"), "alpha rewritten"), None)
        .await
        .unwrap();
    assert_eq!(table_counts(&db).await, (2, 2, 2));

    let response = db
        .search(SearchRequest {
            text: Some("rewritten".to_string()),
            collection: "notes".to_string(),
            limit: 10,
            ..SearchRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].id, "a");

    db.delete_document("notes", "a").await.unwrap();
    assert_eq!(table_counts(&db).await, (1, 1, 1));

    db.delete_document("notes", "b").await.unwrap();
    assert_eq!(table_counts(&db).await, (0, 0, 0));
}

#[tokio::test]
async fn test_stats_and_version_surface() {
    let db = launch(MockProvider::new(DIMS)).await;
    db.create_collection(collection_config("notes", true))
        .await
        .unwrap();
    db.bulk_insert("notes", vec![doc("d", None, "content")], None)
        .await
        .unwrap();
    db.generate_embedding("notes", "warm the cache").await.unwrap();
    db.generate_embedding("notes", "warm the cache").await.unwrap();

    let version = db.version().await.unwrap();
    assert_eq!(version.schema_version, 4);
    assert!(!version.engine_version.is_empty());

    let stats = db.stats().await.unwrap();
    assert!(stats.db_size_bytes > 0);
    assert!(stats.operation_counts.get("bulk_insert").copied().unwrap_or(0) >= 1);
    assert!(stats.pipeline.requests >= 2);
    assert!(stats.cache_hit_rates.memory > 0.0);
}
