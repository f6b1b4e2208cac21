use super::models::*;
use super::queries::*;
use super::*;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;
use uuid::Uuid;

async fn create_test_pool() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("test.db");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(&db_path)
                .create_if_missing(true)
                .foreign_keys(true),
        )
        .await
        .expect("Failed to create test pool");

    sqlx::raw_sql(include_str!("migrations/001_initial_schema.sql"))
        .execute(&pool)
        .await
        .expect("Failed to run migrations");

    (temp_dir, pool)
}

fn test_embedding(content: &str, source: Option<&str>) -> NewEmbedding {
    NewEmbedding {
        vector: vec![0.1; 384],
        content: content.to_string(),
        source: source.map(str::to_string),
        chapter: None,
        page: None,
        metadata: None,
    }
}

fn test_query(query: &str, priority: QueryPriority, timestamp: i64) -> OfflineQuery {
    OfflineQuery {
        id: Uuid::new_v4().to_string(),
        query: query.to_string(),
        response: String::new(),
        timestamp,
        status: QueryStatus::Pending,
        priority,
        retry_count: 0,
        error_message: None,
        response_source: ResponseSource::Local,
        conversation_id: None,
        device_id: "test-device".to_string(),
        app_version: "0.1.0".to_string(),
    }
}

#[tokio::test]
async fn embedding_batch_insert_and_usage() {
    let (_temp_dir, pool) = create_test_pool().await;

    let batch = vec![
        test_embedding("first passage", Some("book-a")),
        test_embedding("second passage", Some("book-a")),
        test_embedding("third passage", Some("book-b")),
    ];

    let ids = EmbeddingQueries::create_batch(&pool, batch)
        .await
        .expect("Failed to insert batch");
    assert_eq!(ids.len(), 3);

    let count = EmbeddingQueries::count(&pool).await.expect("count failed");
    assert_eq!(count, 3);

    let (n, used, oldest, newest) = EmbeddingQueries::usage(&pool).await.expect("usage failed");
    assert_eq!(n, 3);
    assert!(used > 0);
    assert!(oldest.is_some());
    assert!(newest.is_some());

    let filtered = EmbeddingQueries::list_filtered(&pool, Some("book-a"), None)
        .await
        .expect("filter failed");
    assert_eq!(filtered.len(), 2);

    let row = EmbeddingQueries::get_by_id(&pool, &ids[0])
        .await
        .expect("get failed")
        .expect("row should exist");
    let vector = row.vector().expect("vector should decode");
    assert_eq!(vector.len(), 384);
}

#[tokio::test]
async fn embedding_deletion_reduces_usage() {
    let (_temp_dir, pool) = create_test_pool().await;

    let ids = EmbeddingQueries::create_batch(
        &pool,
        vec![
            test_embedding("one", None),
            test_embedding("two", None),
        ],
    )
    .await
    .expect("insert failed");

    let (_, used_before, _, _) = EmbeddingQueries::usage(&pool).await.expect("usage failed");

    let deleted = EmbeddingQueries::delete_by_ids(&pool, &ids[..1])
        .await
        .expect("delete failed");
    assert_eq!(deleted, 1);

    let (n, used_after, _, _) = EmbeddingQueries::usage(&pool).await.expect("usage failed");
    assert_eq!(n, 1);
    assert!(used_after < used_before);
}

#[tokio::test]
async fn query_lifecycle_and_retry_cap() {
    let (_temp_dir, pool) = create_test_pool().await;

    let record = test_query("how to teach fractions", QueryPriority::Normal, now_ms());
    OfflineQueryQueries::create(&pool, &record)
        .await
        .expect("create failed");

    let ids = vec![record.id.clone()];

    // Two failed attempts below the cap keep the record pending.
    for _ in 0..2 {
        OfflineQueryQueries::mark_batch_attempt_failed(&pool, &ids, "HTTP 500", 3)
            .await
            .expect("failure update failed");
    }
    let row = OfflineQueryQueries::get_by_id(&pool, &record.id)
        .await
        .expect("get failed")
        .expect("row should exist");
    assert_eq!(row.status, QueryStatus::Pending);
    assert_eq!(row.retry_count, 2);

    // Third attempt reaches the cap.
    OfflineQueryQueries::mark_batch_attempt_failed(&pool, &ids, "HTTP 500", 3)
        .await
        .expect("failure update failed");
    let row = OfflineQueryQueries::get_by_id(&pool, &record.id)
        .await
        .expect("get failed")
        .expect("row should exist");
    assert_eq!(row.status, QueryStatus::Failed);
    assert_eq!(row.retry_count, 3);

    // Failed records are excluded from the pending pass until reset.
    let pending = OfflineQueryQueries::pending_ordered(&pool)
        .await
        .expect("pending failed");
    assert!(pending.is_empty());

    let reset = OfflineQueryQueries::reset_failed(&pool)
        .await
        .expect("reset failed");
    assert_eq!(reset, 1);

    let row = OfflineQueryQueries::get_by_id(&pool, &record.id)
        .await
        .expect("get failed")
        .expect("row should exist");
    assert_eq!(row.status, QueryStatus::Pending);
    assert_eq!(row.retry_count, 0);
    assert_eq!(row.error_message, None);
}

#[tokio::test]
async fn pending_order_is_priority_then_fifo() {
    let (_temp_dir, pool) = create_test_pool().await;

    let low = test_query("low", QueryPriority::Low, 100);
    let high_late = test_query("high-late", QueryPriority::High, 300);
    let high_early = test_query("high-early", QueryPriority::High, 200);
    let normal = test_query("normal", QueryPriority::Normal, 50);

    for record in [&low, &high_late, &high_early, &normal] {
        OfflineQueryQueries::create(&pool, record)
            .await
            .expect("create failed");
    }

    let pending = OfflineQueryQueries::pending_ordered(&pool)
        .await
        .expect("pending failed");

    let order: Vec<&str> = pending.iter().map(|q| q.query.as_str()).collect();
    assert_eq!(order, vec!["high-early", "high-late", "normal", "low"]);
}

#[tokio::test]
async fn queue_stats_and_cleanup() {
    let (_temp_dir, pool) = create_test_pool().await;

    let now = now_ms();
    let old = test_query("old", QueryPriority::Normal, now - 40 * 24 * 60 * 60 * 1000);
    let recent = test_query("recent", QueryPriority::High, now);

    OfflineQueryQueries::create(&pool, &old)
        .await
        .expect("create failed");
    OfflineQueryQueries::create(&pool, &recent)
        .await
        .expect("create failed");

    let stats = OfflineQueryQueries::stats(&pool).await.expect("stats failed");
    assert_eq!(stats.total, 2);
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.by_priority.high, 1);
    assert_eq!(stats.by_priority.normal, 1);

    let threshold = now - 30 * 24 * 60 * 60 * 1000;
    let removed = OfflineQueryQueries::delete_older_than(&pool, threshold)
        .await
        .expect("cleanup failed");
    assert_eq!(removed, 1);

    let stats = OfflineQueryQueries::stats(&pool).await.expect("stats failed");
    assert_eq!(stats.total, 1);
}

#[tokio::test]
async fn sync_metadata_upsert() {
    let (_temp_dir, pool) = create_test_pool().await;

    SyncMetadataQueries::set(&pool, "dataset_version", "1.2.0")
        .await
        .expect("set failed");
    SyncMetadataQueries::set(&pool, "dataset_version", "1.3.0")
        .await
        .expect("set failed");

    let entry = SyncMetadataQueries::get(&pool, "dataset_version")
        .await
        .expect("get failed")
        .expect("entry should exist");
    assert_eq!(entry.value, "1.3.0");

    SyncMetadataQueries::delete(&pool, "dataset_version")
        .await
        .expect("delete failed");
    let entry = SyncMetadataQueries::get(&pool, "dataset_version")
        .await
        .expect("get failed");
    assert!(entry.is_none());
}

#[tokio::test]
async fn embedding_cache_eviction() {
    let (_temp_dir, pool) = create_test_pool().await;

    for i in 0..5 {
        let query = format!("query {i}");
        EmbeddingCacheQueries::upsert(&pool, &query, "[0.0]", "1.0.0")
            .await
            .expect("upsert failed");
        // Distinct timestamps so eviction order is deterministic.
        sqlx::query("UPDATE embedding_cache SET timestamp = ? WHERE query = ?")
            .bind(i as i64)
            .bind(&query)
            .execute(&pool)
            .await
            .expect("timestamp update failed");
    }

    let evicted = EmbeddingCacheQueries::evict_oldest(&pool, 2)
        .await
        .expect("evict failed");
    assert_eq!(evicted, 2);

    assert!(
        EmbeddingCacheQueries::get(&pool, "query 0")
            .await
            .expect("get failed")
            .is_none()
    );
    assert!(
        EmbeddingCacheQueries::get(&pool, "query 4")
            .await
            .expect("get failed")
            .is_some()
    );
}

#[tokio::test]
async fn cache_metadata_prefix_invalidation() {
    let (_temp_dir, pool) = create_test_pool().await;

    CacheMetadataQueries::touch(&pool, "embeddings:page:1", "1", None)
        .await
        .expect("touch failed");
    CacheMetadataQueries::touch(&pool, "embeddings:page:2", "1", None)
        .await
        .expect("touch failed");
    CacheMetadataQueries::touch(&pool, "queries:latest", "1", None)
        .await
        .expect("touch failed");

    let removed = CacheMetadataQueries::delete_prefix(&pool, "embeddings:")
        .await
        .expect("prefix delete failed");
    assert_eq!(removed, 2);

    assert!(
        CacheMetadataQueries::get(&pool, "queries:latest")
            .await
            .expect("get failed")
            .is_some()
    );
}

#[tokio::test]
async fn database_wrapper_initializes_schema() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let database = Database::initialize_from_data_dir(temp_dir.path())
        .await
        .expect("Failed to initialize database");

    database
        .set_metadata("device_id", "abc")
        .await
        .expect("set failed");
    let value = database
        .get_metadata("device_id")
        .await
        .expect("get failed");
    assert_eq!(value.as_deref(), Some("abc"));
}
