// CLI command implementations over the service layer.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::config::Config;
use crate::connectivity::{ConnectivityService, ManualTelemetry};
use crate::database::Database;
use crate::download::{DownloadEvent, DownloadManager};
use crate::embeddings::{EmbeddingClient, VectorService};
use crate::invalidation::CacheInvalidationService;
use crate::queue::OfflineQueryQueue;
use crate::quota::{CleanupStrategy, StorageQuotaManager, SystemStorage};

/// All services wired together over one database handle.
pub struct AppContext {
    pub config: Config,
    pub database: Database,
    pub connectivity: Arc<ConnectivityService>,
    pub quota: Arc<StorageQuotaManager>,
    pub downloads: DownloadManager,
    pub queue: OfflineQueryQueue,
    pub vectors: VectorService,
    pub invalidation: CacheInvalidationService,
}

impl AppContext {
    /// Build every service against `data_dir`. The CLI has no OS telemetry
    /// feed, so connectivity defaults to a connected WiFi link; eligibility
    /// gates still apply their battery and transport rules.
    pub async fn initialize(config: Config, data_dir: &Path) -> Result<Self> {
        let database = Database::initialize_from_data_dir(data_dir).await?;
        info!("Database ready at {}", data_dir.display());

        let connectivity = Arc::new(ConnectivityService::new(Arc::new(ManualTelemetry::new())));
        let quota = Arc::new(StorageQuotaManager::new(
            database.clone(),
            config.quota.clone(),
            Arc::new(SystemStorage::new(data_dir)),
        ));
        let downloads = DownloadManager::new(
            database.clone(),
            Arc::clone(&quota),
            Arc::clone(&connectivity),
            config.api.base_url.clone(),
            config.download.clone(),
        )?;
        let queue = OfflineQueryQueue::new(
            database.clone(),
            Arc::clone(&connectivity),
            config.api.base_url.clone(),
        )?;
        let vectors = VectorService::new(
            EmbeddingClient::new(config.api.base_url.clone())?,
            database.clone(),
        );
        let invalidation =
            CacheInvalidationService::new(database.clone(), config.api.base_url.clone())?;

        Ok(Self {
            config,
            database,
            connectivity,
            quota,
            downloads,
            queue,
            vectors,
            invalidation,
        })
    }
}

pub async fn status(ctx: &AppContext) -> Result<()> {
    let usage = ctx.quota.get_usage().await?;
    println!("{}", style("Storage").bold().underlined());
    println!(
        "  {} / {} MB used ({:.1}%)",
        usage.used_bytes / (1024 * 1024),
        usage.max_bytes / (1024 * 1024),
        usage.usage_fraction * 100.0
    );
    println!(
        "  {} / {} embeddings",
        usage.embedding_count, usage.max_embeddings
    );
    println!(
        "  {} MB free on disk",
        usage.free_disk_bytes / (1024 * 1024)
    );

    let stats = ctx.queue.stats().await?;
    println!("\n{}", style("Query queue").bold().underlined());
    println!(
        "  {} total ({} pending, {} failed, {} synced)",
        stats.total, stats.pending, stats.failed, stats.synced
    );

    let cache = ctx.invalidation.check_cache_status().await?;
    println!("\n{}", style("Dataset").bold().underlined());
    println!(
        "  local version: {}",
        cache.local_version.as_deref().unwrap_or("none")
    );
    if let Some(remote) = &cache.remote_version {
        println!("  server version: {remote}");
    }
    if cache.valid {
        println!("  {}", style("up to date").green());
    } else {
        println!("  {} ({:?})", style("stale").yellow(), cache.reason);
    }

    let quality = ctx
        .connectivity
        .test_connection_quality(&ctx.config.api.base_url)
        .await;
    println!("\n{}", style("Connection").bold().underlined());
    if quality.latency_ms >= 0 {
        println!("  {} ms ({:?})", quality.latency_ms, quality.quality);
    } else {
        println!("  {}", style("server unreachable").red());
    }

    Ok(())
}

pub async fn download(ctx: &AppContext, version: Option<String>) -> Result<()> {
    let version = match version {
        Some(v) => Some(v),
        None => match ctx.invalidation.get_latest_version().await {
            Ok(v) => {
                println!("Server dataset version: {v}");
                Some(v)
            }
            Err(e) => {
                println!("{} {}", style("warning:").yellow(), e);
                None
            }
        },
    };

    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg} [{bar:40}] {percent}%")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let progress_bar = bar.clone();
    let subscription = ctx.downloads.on_event(move |event| match event {
        DownloadEvent::Progress(p) => {
            progress_bar.set_length(p.total_items);
            progress_bar.set_position(p.downloaded_items);
            progress_bar.set_message(format!("{} embeddings", p.downloaded_items));
        }
        DownloadEvent::BatchFailed { batch, attempt, .. } => {
            progress_bar.set_message(format!("batch {batch} retry {attempt}"));
        }
        _ => {}
    });

    let result = ctx.downloads.start_download(version.clone()).await;
    ctx.downloads.unsubscribe(subscription);
    bar.finish_and_clear();
    result?;

    if let Some(version) = version {
        ctx.invalidation.update_local_version(&version).await?;
    }

    let progress = ctx.downloads.get_progress();
    let total = progress.map_or(0, |p| p.downloaded_items);
    println!("{} {} embeddings stored", style("Done:").green(), total);
    Ok(())
}

pub async fn search(ctx: &AppContext, query: &str, limit: Option<usize>) -> Result<()> {
    let results = ctx.vectors.search(query, limit).await;
    if results.is_empty() {
        println!("No matching passages.");
        return Ok(());
    }

    for (rank, result) in results.iter().enumerate() {
        println!(
            "{} {} {}",
            style(format!("{}.", rank + 1)).bold(),
            style(format!("[{:.2}]", result.score)).dim(),
            result.content
        );
    }
    Ok(())
}

pub async fn sync(ctx: &AppContext, retry_failed: bool) -> Result<()> {
    let outcome = if retry_failed {
        ctx.queue.retry_failed().await?
    } else {
        ctx.queue.sync_pending_queries().await?
    };

    if let Some(reason) = outcome.skipped {
        println!("{} {}", style("Skipped:").yellow(), reason);
    } else {
        println!(
            "{} {} synced, {} failed",
            style("Sync:").green(),
            outcome.synced,
            outcome.failed
        );
    }
    Ok(())
}

pub async fn cleanup(ctx: &AppContext, strategy: Option<CleanupStrategy>) -> Result<()> {
    let strategy = match strategy {
        Some(s) => s,
        None => ctx.quota.recommend_strategy().await?,
    };

    let result = ctx.quota.execute_cleanup(strategy, None).await;
    if result.success {
        println!(
            "{} removed {} embeddings, freed {} KB ({})",
            style("Cleanup:").green(),
            result.items_removed,
            result.bytes_freed / 1024,
            result.strategy
        );
    } else {
        println!("{} cleanup did not complete", style("error:").red());
    }

    let removed = ctx
        .queue
        .cleanup_old_queries(Some(ctx.config.sync.retention_days))
        .await?;
    if removed > 0 {
        println!("Removed {removed} old queued queries");
    }
    Ok(())
}

pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
