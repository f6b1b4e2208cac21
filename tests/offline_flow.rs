// End-to-end flow over the public API: download the corpus, pin its
// version, answer a query locally, queue it, and sync it once consent and
// connectivity allow.

use std::sync::Arc;

use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tutor_sync::connectivity::{ConnectivityService, LinkType, ManualTelemetry, NetworkSnapshot};
use tutor_sync::database::Database;
use tutor_sync::database::sqlite::QueryMetadata;
use tutor_sync::download::{DownloadConfig, DownloadManager};
use tutor_sync::embeddings::{EmbeddingClient, VectorService};
use tutor_sync::invalidation::CacheInvalidationService;
use tutor_sync::queue::OfflineQueryQueue;
use tutor_sync::quota::{FixedStorage, QuotaConfig, StorageQuotaManager};

fn unit_vector(hot_index: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; 384];
    v[hot_index] = 1.0;
    v
}

struct App {
    _temp_dir: TempDir,
    telemetry: Arc<ManualTelemetry>,
    downloads: DownloadManager,
    queue: OfflineQueryQueue,
    vectors: VectorService,
    invalidation: CacheInvalidationService,
}

async fn build_app(base_url: &str) -> App {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let database = Database::initialize_from_data_dir(temp_dir.path())
        .await
        .expect("Failed to initialize database");

    let telemetry = Arc::new(ManualTelemetry::new());
    let connectivity = Arc::new(ConnectivityService::new(telemetry.clone()));
    let quota = Arc::new(StorageQuotaManager::new(
        database.clone(),
        QuotaConfig::default(),
        Arc::new(FixedStorage {
            free_bytes: Some(10 * 1024 * 1024 * 1024),
        }),
    ));

    let downloads = DownloadManager::new(
        database.clone(),
        quota,
        Arc::clone(&connectivity),
        base_url,
        DownloadConfig {
            batch_size: 10,
            retry_delay_ms: 10,
            ..DownloadConfig::default()
        },
    )
    .expect("Failed to build download manager");

    let queue = OfflineQueryQueue::new(database.clone(), connectivity, base_url)
        .expect("Failed to build queue");
    let vectors = VectorService::new(
        EmbeddingClient::new(base_url).expect("Failed to build client"),
        database.clone(),
    );
    let invalidation =
        CacheInvalidationService::new(database, base_url).expect("Failed to build invalidation");

    App {
        _temp_dir: temp_dir,
        telemetry,
        downloads,
        queue,
        vectors,
        invalidation,
    }
}

#[tokio::test]
async fn download_then_search_then_sync() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/sync/version"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "version": "1.4.0",
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/export/embeddings"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {
                "vector": unit_vector(0),
                "content": "Photosynthesis converts light into chemical energy.",
                "source": "biology-book",
            },
            {
                "vector": unit_vector(1),
                "content": "Fractions represent parts of a whole.",
                "source": "math-book",
            },
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/export/embeddings"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/embeddings/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "embedding": unit_vector(1),
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/sync/queries"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let app = build_app(&server.uri()).await;

    // Fetch the corpus and pin the server's dataset version.
    let version = app
        .invalidation
        .get_latest_version()
        .await
        .expect("version failed");
    app.downloads
        .start_download(Some(version.clone()))
        .await
        .expect("download failed");
    app.invalidation
        .update_local_version(&version)
        .await
        .expect("pin failed");

    let status = app
        .invalidation
        .check_cache_status()
        .await
        .expect("status failed");
    assert!(status.valid);

    // Semantic search finds the fractions passage, not the biology one.
    let results = app.vectors.search("what is a fraction", Some(3)).await;
    assert_eq!(results.len(), 1);
    assert!(results[0].content.contains("Fractions"));

    // The answered query is recorded locally and synced with consent.
    app.queue
        .add_query(
            "what is a fraction",
            &results[0].content,
            QueryMetadata::default(),
        )
        .await
        .expect("add failed");
    app.queue.set_user_consent(true).await.expect("consent failed");

    let outcome = app.queue.sync_pending_queries().await.expect("sync failed");
    assert_eq!(outcome.synced, 1);
    assert_eq!(outcome.failed, 0);
}

#[tokio::test]
async fn everything_degrades_gracefully_offline() {
    // Point at a closed port: every network call fails fast.
    let app = build_app("http://127.0.0.1:1").await;
    app.telemetry.set_network(NetworkSnapshot {
        is_connected: false,
        link: LinkType::None,
        internet_reachable: Some(false),
    });

    // Search returns no results instead of erroring.
    let results = app.vectors.search("anything", None).await;
    assert!(results.is_empty());

    // Queries still queue locally.
    let id = app
        .queue
        .add_query("offline question", "offline answer", QueryMetadata::default())
        .await
        .expect("add failed");
    assert!(!id.is_empty());

    // Sync is skipped with a reason rather than failing.
    app.queue.set_user_consent(true).await.expect("consent failed");
    let outcome = app.queue.sync_pending_queries().await.expect("sync failed");
    assert_eq!(
        outcome.skipped.as_deref(),
        Some("No internet connection available")
    );

    // Downloads are refused up front.
    assert!(app.downloads.start_download(None).await.is_err());

    // A previously pinned dataset stays valid while unexpired.
    app.invalidation
        .update_local_version("1.0.0")
        .await
        .expect("pin failed");
    let status = app
        .invalidation
        .check_cache_status()
        .await
        .expect("status failed");
    assert!(status.valid);
}
