use super::*;
use crate::connectivity::{LinkType, ManualTelemetry, NetworkSnapshot};
use crate::database::sqlite::queries::EmbeddingQueries;
use crate::quota::{FixedStorage, QuotaConfig};
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PLENTY_OF_DISK: u64 = 10 * 1024 * 1024 * 1024;

struct Harness {
    _temp_dir: TempDir,
    database: Database,
    telemetry: Arc<ManualTelemetry>,
    manager: DownloadManager,
    events: Arc<Mutex<Vec<DownloadEvent>>>,
}

async fn create_harness(server: &MockServer, quota_config: QuotaConfig) -> Harness {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let database = Database::initialize_from_data_dir(temp_dir.path())
        .await
        .expect("Failed to initialize database");

    let telemetry = Arc::new(ManualTelemetry::new());
    let connectivity = Arc::new(ConnectivityService::new(telemetry.clone()));
    let quota = Arc::new(StorageQuotaManager::new(
        database.clone(),
        quota_config,
        Arc::new(FixedStorage {
            free_bytes: Some(PLENTY_OF_DISK),
        }),
    ));

    let config = DownloadConfig {
        batch_size: 2,
        max_retries: 3,
        retry_delay_ms: 10,
        ..DownloadConfig::default()
    };
    let manager = DownloadManager::new(
        database.clone(),
        quota,
        connectivity,
        server.uri(),
        config,
    )
    .expect("Failed to build manager");

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    manager.on_event(move |event| {
        sink.lock().expect("event sink poisoned").push(event.clone());
    });

    Harness {
        _temp_dir: temp_dir,
        database,
        telemetry,
        manager,
        events,
    }
}

fn remote_embedding(hot_index: usize, content: &str) -> serde_json::Value {
    let mut vector = vec![0.0f32; 384];
    vector[hot_index] = 1.0;
    serde_json::json!({ "vector": vector, "content": content })
}

/// Pages are bare JSON arrays; an empty array ends the corpus.
async fn mount_page(server: &MockServer, offset: u64, embeddings: Vec<serde_json::Value>) {
    Mock::given(method("GET"))
        .and(path("/api/export/embeddings"))
        .and(query_param("offset", offset.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::Value::Array(embeddings)))
        .mount(server)
        .await;
}

fn recorded(events: &Arc<Mutex<Vec<DownloadEvent>>>) -> Vec<DownloadEvent> {
    events.lock().expect("event sink poisoned").clone()
}

#[tokio::test]
async fn download_runs_to_completion() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        0,
        vec![remote_embedding(0, "one"), remote_embedding(1, "two")],
    )
    .await;
    mount_page(&server, 2, vec![remote_embedding(2, "three")]).await;
    mount_page(&server, 3, vec![]).await;

    let harness = create_harness(&server, QuotaConfig::default()).await;
    harness
        .manager
        .start_download(None)
        .await
        .expect("download failed");

    let count = EmbeddingQueries::count(harness.database.pool())
        .await
        .expect("count failed");
    assert_eq!(count, 3);

    let events = recorded(&harness.events);
    assert!(matches!(events.first(), Some(DownloadEvent::Started)));
    assert!(matches!(
        events.last(),
        Some(DownloadEvent::Completed { total_items: 3 })
    ));

    let progress = harness.manager.get_progress().expect("progress missing");
    assert_eq!(progress.downloaded_items, 3);
    // The total is a running high-water mark; there is no upfront manifest.
    assert_eq!(progress.total_items, 3);
    assert_eq!(progress.total_batches, 2);
    assert_eq!(progress.percent, 100.0);

    // Offset bookkeeping is cleared once the run finishes.
    let pending = harness
        .database
        .get_metadata("pending_download")
        .await
        .expect("metadata failed");
    assert!(pending.is_none());
    assert!(!harness.manager.is_downloading());
}

#[tokio::test]
async fn download_is_blocked_when_ineligible() {
    let server = MockServer::start().await;
    let harness = create_harness(&server, QuotaConfig::default()).await;

    harness.telemetry.set_battery(10);

    let result = harness.manager.start_download(None).await;
    assert!(result.is_err());

    let events = recorded(&harness.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, DownloadEvent::Error(msg) if msg.contains("Battery too low"))));
}

#[tokio::test]
async fn default_rules_allow_cellular_downloads() {
    let server = MockServer::start().await;
    mount_page(&server, 0, vec![remote_embedding(0, "one")]).await;
    mount_page(&server, 1, vec![]).await;

    let harness = create_harness(&server, QuotaConfig::default()).await;
    harness.telemetry.set_network(NetworkSnapshot {
        is_connected: true,
        link: LinkType::Cellular,
        internet_reachable: Some(true),
    });

    harness
        .manager
        .start_download(None)
        .await
        .expect("cellular download should be allowed by default");

    let events = recorded(&harness.events);
    assert!(matches!(
        events.last(),
        Some(DownloadEvent::Completed { total_items: 1 })
    ));
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/export/embeddings"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_page(&server, 0, vec![remote_embedding(0, "one")]).await;
    mount_page(&server, 1, vec![]).await;

    let harness = create_harness(&server, QuotaConfig::default()).await;
    harness
        .manager
        .start_download(None)
        .await
        .expect("download failed");

    let events = recorded(&harness.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, DownloadEvent::BatchFailed { attempt: 1, .. })));
    assert!(matches!(
        events.last(),
        Some(DownloadEvent::Completed { total_items: 1 })
    ));
}

#[tokio::test]
async fn exhausted_retries_fail_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/export/embeddings"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let harness = create_harness(&server, QuotaConfig::default()).await;
    let result = harness.manager.start_download(None).await;
    assert!(result.is_err());

    let events = recorded(&harness.events);
    assert!(events.iter().any(|e| matches!(e, DownloadEvent::Error(_))));
    assert!(!harness.manager.is_downloading());
}

#[tokio::test]
async fn invalid_dimension_rows_are_rejected() {
    let server = MockServer::start().await;
    let short = serde_json::json!({ "vector": vec![0.1f32; 100], "content": "bad" });
    mount_page(&server, 0, vec![remote_embedding(0, "good"), short]).await;
    mount_page(&server, 2, vec![]).await;

    let harness = create_harness(&server, QuotaConfig::default()).await;
    harness
        .manager
        .start_download(None)
        .await
        .expect("download failed");

    let count = EmbeddingQueries::count(harness.database.pool())
        .await
        .expect("count failed");
    assert_eq!(count, 1);

    let events = recorded(&harness.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, DownloadEvent::Error(msg) if msg.contains("invalid dimensions"))));
}

#[tokio::test]
async fn cancel_interrupts_between_batches() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        0,
        vec![remote_embedding(0, "one"), remote_embedding(1, "two")],
    )
    .await;
    // Second page is slow enough for cancel to land mid-fetch.
    Mock::given(method("GET"))
        .and(path("/api/export/embeddings"))
        .and(query_param("offset", "2"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!([remote_embedding(2, "three")]))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let harness = create_harness(&server, QuotaConfig::default()).await;
    let manager = harness.manager.clone();
    let run = tokio::spawn(async move { manager.start_download(None).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.manager.cancel();

    run.await.expect("task panicked").expect("download failed");

    let events = recorded(&harness.events);
    assert!(matches!(events.last(), Some(DownloadEvent::Cancelled)));

    // Cancel clears the resume bookkeeping.
    let pending = harness
        .database
        .get_metadata("pending_download")
        .await
        .expect("metadata failed");
    assert!(pending.is_none());
}

#[tokio::test]
async fn pause_stalls_and_resume_continues() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/export/embeddings"))
        .and(query_param("offset", "0"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!([
                    remote_embedding(0, "one"),
                    remote_embedding(1, "two"),
                ]))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;
    mount_page(&server, 2, vec![remote_embedding(2, "three")]).await;
    mount_page(&server, 3, vec![]).await;

    let harness = create_harness(&server, QuotaConfig::default()).await;
    let manager = harness.manager.clone();
    let run = tokio::spawn(async move { manager.start_download(None).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.manager.pause();

    // First batch lands, then the loop idles at the pause gate.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(harness.manager.is_downloading());
    let count = EmbeddingQueries::count(harness.database.pool())
        .await
        .expect("count failed");
    assert_eq!(count, 2);

    harness.manager.resume();
    run.await.expect("task panicked").expect("download failed");

    let count = EmbeddingQueries::count(harness.database.pool())
        .await
        .expect("count failed");
    assert_eq!(count, 3);
}

#[tokio::test]
async fn resume_offset_skips_downloaded_pages() {
    let server = MockServer::start().await;
    // An earlier run already covered offsets 0 and 1.
    Mock::given(method("GET"))
        .and(path("/api/export/embeddings"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    mount_page(&server, 2, vec![]).await;

    let harness = create_harness(&server, QuotaConfig::default()).await;
    harness
        .database
        .set_metadata(
            "pending_download",
            "{\"version\":null,\"offset\":2}",
        )
        .await
        .expect("metadata failed");

    harness
        .manager
        .start_download(None)
        .await
        .expect("download failed");

    let events = recorded(&harness.events);
    assert!(matches!(
        events.last(),
        Some(DownloadEvent::Completed { total_items: 2 })
    ));
}

#[tokio::test]
async fn stale_version_restarts_from_zero() {
    let server = MockServer::start().await;
    mount_page(&server, 0, vec![]).await;

    let harness = create_harness(&server, QuotaConfig::default()).await;
    harness
        .database
        .set_metadata(
            "pending_download",
            "{\"version\":\"1.0.0\",\"offset\":50}",
        )
        .await
        .expect("metadata failed");

    harness
        .manager
        .start_download(Some("2.0.0".to_string()))
        .await
        .expect("download failed");

    let events = recorded(&harness.events);
    assert!(matches!(
        events.last(),
        Some(DownloadEvent::Completed { total_items: 0 })
    ));
}

#[tokio::test]
async fn quota_pressure_triggers_cleanup_before_fetch() {
    let server = MockServer::start().await;
    mount_page(&server, 0, vec![remote_embedding(0, "new")]).await;
    mount_page(&server, 1, vec![]).await;

    // Batch admission needs 2 * 1500 bytes against a 5000-byte budget.
    let quota_config = QuotaConfig {
        max_size_bytes: 5000,
        ..QuotaConfig::default()
    };
    let harness = create_harness(&server, quota_config).await;

    let ids = EmbeddingQueries::create_batch(
        harness.database.pool(),
        vec![NewEmbedding {
            vector: vec![0.1; 384],
            content: "old bulk".to_string(),
            source: None,
            chapter: None,
            page: None,
            metadata: None,
        }],
    )
    .await
    .expect("seed failed");
    sqlx::query("UPDATE embeddings SET size_bytes = 4000 WHERE id = ?")
        .bind(&ids[0])
        .execute(harness.database.pool())
        .await
        .expect("size update failed");

    harness
        .manager
        .start_download(None)
        .await
        .expect("download failed");

    // The seeded row was evicted to admit the new batch.
    let remaining = EmbeddingQueries::eviction_candidates(harness.database.pool())
        .await
        .expect("candidates failed");
    assert!(!remaining.iter().any(|(id, _, _)| id == &ids[0]));

    let events = recorded(&harness.events);
    assert!(matches!(
        events.last(),
        Some(DownloadEvent::Completed { total_items: 1 })
    ));
}
