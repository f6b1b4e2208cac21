// Batch download of the embedding corpus. The loop is resumable (offset
// bookkeeping survives restarts), interruptible (pause/cancel flags), and
// quota-aware (admission check plus one eviction attempt per batch).

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::connectivity::{ConnectivityService, SyncRules};
use crate::database::Database;
use crate::database::sqlite::{NewEmbedding, now_ms};
use crate::quota::StorageQuotaManager;
use crate::vector::{VectorStore, validate_dimensions};

const PENDING_DOWNLOAD_KEY: &str = "pending_download";
const PAUSE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_ms: u64,
    /// Rough on-disk cost per embedding, used for admission checks before a
    /// batch is fetched.
    pub estimated_bytes_per_embedding: u64,
    pub require_wifi: bool,
    pub min_battery_level: u8,
    pub allow_cellular: bool,
}

impl Default for DownloadConfig {
    #[inline]
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_retries: 3,
            retry_delay_ms: 5000,
            request_timeout_ms: 30_000,
            estimated_bytes_per_embedding: 1500,
            require_wifi: false,
            min_battery_level: 20,
            allow_cellular: true,
        }
    }
}

impl DownloadConfig {
    #[inline]
    fn sync_rules(&self) -> SyncRules {
        SyncRules {
            require_wifi: self.require_wifi,
            min_battery_level: self.min_battery_level,
            allow_cellular: self.allow_cellular,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DownloadProgress {
    /// Running high-water mark; the export endpoint sends no upfront
    /// manifest, so the total only grows as pages arrive.
    pub total_items: u64,
    pub downloaded_items: u64,
    pub current_batch: u64,
    pub total_batches: u64,
    pub bytes_downloaded: u64,
    /// 0-100 against the running total.
    pub percent: f64,
    /// Observed throughput since the run started.
    pub speed_kbps: f64,
    /// Transport-based estimate for the items not yet downloaded.
    pub eta_seconds: f64,
    pub started_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Started,
    Progress(DownloadProgress),
    BatchCompleted { batch: u64, items: usize },
    BatchFailed { batch: u64, attempt: u32, error: String },
    Completed { total_items: u64 },
    Cancelled,
    Error(String),
}

/// Embedding record as served by the export endpoint. The endpoint returns a
/// bare JSON array per page; an empty array marks the end of the corpus.
#[derive(Debug, Deserialize)]
struct RemoteEmbedding {
    vector: Vec<f32>,
    content: String,
    source: Option<String>,
    chapter: Option<String>,
    page: Option<i64>,
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingDownload {
    version: Option<String>,
    offset: u64,
}

type EventCallback = Box<dyn Fn(&DownloadEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadSubscription(u64);

struct Inner {
    database: Database,
    store: VectorStore,
    quota: Arc<StorageQuotaManager>,
    connectivity: Arc<ConnectivityService>,
    http: reqwest::Client,
    base_url: String,
    config: DownloadConfig,
    running: AtomicBool,
    paused: AtomicBool,
    cancelled: AtomicBool,
    progress: Mutex<Option<DownloadProgress>>,
    listeners: Mutex<Vec<(u64, EventCallback)>>,
    next_handle: AtomicU64,
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(
        database: Database,
        quota: Arc<StorageQuotaManager>,
        connectivity: Arc<ConnectivityService>,
        base_url: impl Into<String>,
        config: DownloadConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;
        let base_url: String = base_url.into();
        let store = VectorStore::new(database.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                database,
                store,
                quota,
                connectivity,
                http,
                base_url: base_url.trim_end_matches('/').to_string(),
                config,
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                progress: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                next_handle: AtomicU64::new(1),
            }),
        })
    }

    #[inline]
    pub fn is_downloading(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn get_progress(&self) -> Option<DownloadProgress> {
        self.inner.progress.lock().ok().and_then(|p| *p)
    }

    #[inline]
    pub fn pause(&self) {
        if self.is_downloading() {
            info!("Download paused");
            self.inner.paused.store(true, Ordering::SeqCst);
        }
    }

    #[inline]
    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!("Download resumed");
        }
    }

    #[inline]
    pub fn cancel(&self) {
        if self.is_downloading() {
            info!("Download cancel requested");
            self.inner.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[inline]
    pub fn on_event<F>(&self, callback: F) -> DownloadSubscription
    where
        F: Fn(&DownloadEvent) + Send + 'static,
    {
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push((handle, Box::new(callback)));
        }
        DownloadSubscription(handle)
    }

    /// Remove an event subscriber; repeat removals are no-ops.
    #[inline]
    pub fn unsubscribe(&self, handle: DownloadSubscription) {
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.retain(|(id, _)| *id != handle.0);
        }
    }

    fn emit(&self, event: &DownloadEvent) {
        if let Ok(listeners) = self.inner.listeners.lock() {
            for (id, callback) in listeners.iter() {
                let call = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(event)
                }));
                if call.is_err() {
                    error!("Download listener {} panicked", id);
                }
            }
        }
    }

    /// Run the download loop to completion. Concurrent calls are no-ops
    /// while a run is in flight; pause, resume, and cancel act on the
    /// running loop from other tasks.
    pub async fn start_download(&self, version: Option<String>) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Download already in progress, ignoring start request");
            return Ok(());
        }
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.cancelled.store(false, Ordering::SeqCst);

        let result = self.run(version).await;

        self.inner.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run(&self, version: Option<String>) -> Result<()> {
        let eligibility = self
            .inner
            .connectivity
            .check_sync_eligibility(&self.inner.config.sync_rules());
        if !eligibility.eligible {
            let reason = eligibility
                .reason
                .unwrap_or_else(|| "Download not currently possible".to_string());
            self.emit(&DownloadEvent::Error(reason.clone()));
            anyhow::bail!("Download blocked: {}", reason);
        }

        let mut offset = self.resume_offset(version.as_deref()).await?;
        if offset > 0 {
            info!("Resuming download at offset {}", offset);
        }

        let mut progress = DownloadProgress {
            total_items: offset,
            downloaded_items: offset,
            current_batch: 0,
            total_batches: 0,
            bytes_downloaded: 0,
            percent: 0.0,
            speed_kbps: 0.0,
            eta_seconds: 0.0,
            started_at: now_ms(),
        };
        self.set_progress(Some(progress));
        self.emit(&DownloadEvent::Started);

        loop {
            if self.inner.cancelled.load(Ordering::SeqCst) {
                info!("Download cancelled at offset {}", offset);
                self.clear_pending().await;
                self.emit(&DownloadEvent::Cancelled);
                return Ok(());
            }

            if self.inner.paused.load(Ordering::SeqCst) {
                tokio::time::sleep(PAUSE_POLL).await;
                continue;
            }

            if !self.ensure_capacity().await? {
                self.emit(&DownloadEvent::Error(
                    "Insufficient storage for next batch".to_string(),
                ));
                anyhow::bail!("Insufficient storage for next batch");
            }

            progress.current_batch += 1;
            let page = match self
                .fetch_with_retries(offset, version.as_deref(), progress.current_batch)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    self.emit(&DownloadEvent::Error(e.to_string()));
                    return Err(e);
                }
            };

            if page.is_empty() {
                info!("Download complete: {} items", progress.downloaded_items);
                self.clear_pending().await;
                progress.percent = 100.0;
                self.set_progress(Some(progress));
                self.emit(&DownloadEvent::Completed {
                    total_items: progress.downloaded_items,
                });
                return Ok(());
            }

            let page_len = page.len();
            let batch = self.validate_page(page);
            let accepted = batch.len();

            if accepted > 0 {
                match self.inner.store.insert_batch(batch).await {
                    Ok(ids) => {
                        progress.downloaded_items += ids.len() as u64;
                        self.emit(&DownloadEvent::BatchCompleted {
                            batch: progress.current_batch,
                            items: ids.len(),
                        });
                    }
                    // Storage hiccups skip the batch but keep the loop alive;
                    // the rows are fetched again on the next full pass.
                    Err(e) => {
                        error!("Failed to persist batch {}: {}", progress.current_batch, e);
                        self.emit(&DownloadEvent::Error(format!(
                            "Failed to persist batch {}: {}",
                            progress.current_batch, e
                        )));
                    }
                }
            }

            offset += page_len as u64;
            progress.bytes_downloaded +=
                accepted as u64 * self.inner.config.estimated_bytes_per_embedding;
            // No upfront manifest: the total is a running high-water mark.
            progress.total_items = progress.total_items.max(progress.downloaded_items);
            progress.percent = if progress.total_items == 0 {
                100.0
            } else {
                (progress.downloaded_items as f64 / progress.total_items as f64 * 100.0).min(100.0)
            };
            progress.total_batches = progress
                .total_items
                .div_ceil(self.inner.config.batch_size as u64);
            let elapsed_secs = ((now_ms() - progress.started_at) as f64 / 1000.0).max(0.001);
            progress.speed_kbps = progress.bytes_downloaded as f64 / elapsed_secs / 1024.0;
            let remaining_bytes = progress.total_items.saturating_sub(progress.downloaded_items)
                * self.inner.config.estimated_bytes_per_embedding;
            progress.eta_seconds = self.inner.connectivity.estimate_download_time(remaining_bytes);
            self.set_progress(Some(progress));
            self.emit(&DownloadEvent::Progress(progress));
            self.save_pending(version.as_deref(), offset).await;
        }
    }

    /// Drop rows that violate the dimension invariant before storage sees
    /// them. An entirely invalid page is reported but not fatal.
    fn validate_page(&self, page: Vec<RemoteEmbedding>) -> Vec<NewEmbedding> {
        let total = page.len();
        let batch: Vec<NewEmbedding> = page
            .into_iter()
            .filter(|remote| validate_dimensions(&remote.vector))
            .map(|remote| NewEmbedding {
                vector: remote.vector,
                content: remote.content,
                source: remote.source,
                chapter: remote.chapter,
                page: remote.page,
                metadata: remote.metadata,
            })
            .collect();

        let rejected = total - batch.len();
        if rejected > 0 {
            warn!("Rejected {} embeddings with invalid dimensions", rejected);
            self.emit(&DownloadEvent::Error(format!(
                "Rejected {rejected} embeddings with invalid dimensions"
            )));
        }
        batch
    }

    /// Admission check for the next batch, with a single eviction attempt
    /// when the first answer is no.
    async fn ensure_capacity(&self) -> Result<bool> {
        let required = self.inner.config.batch_size as u64
            * self.inner.config.estimated_bytes_per_embedding;

        if self.inner.quota.has_sufficient_storage(required).await? {
            return Ok(true);
        }

        warn!("Quota exceeded mid-download, attempting cleanup");
        let strategy = self.inner.quota.recommend_strategy().await?;
        let result = self.inner.quota.execute_cleanup(strategy, None).await;
        if !result.success {
            return Ok(false);
        }

        self.inner.quota.has_sufficient_storage(required).await
    }

    async fn fetch_with_retries(
        &self,
        offset: u64,
        version: Option<&str>,
        batch: u64,
    ) -> Result<Vec<RemoteEmbedding>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_page(offset, version).await {
                Ok(page) => return Ok(page),
                Err(e) if attempt < self.inner.config.max_retries => {
                    warn!("Batch {} attempt {} failed: {}", batch, attempt, e);
                    self.emit(&DownloadEvent::BatchFailed {
                        batch,
                        attempt,
                        error: e.to_string(),
                    });
                    tokio::time::sleep(Duration::from_millis(self.inner.config.retry_delay_ms))
                        .await;
                }
                Err(e) => {
                    self.emit(&DownloadEvent::BatchFailed {
                        batch,
                        attempt,
                        error: e.to_string(),
                    });
                    return Err(e.context(format!(
                        "Batch {batch} failed after {attempt} attempts"
                    )));
                }
            }
        }
    }

    async fn fetch_page(&self, offset: u64, version: Option<&str>) -> Result<Vec<RemoteEmbedding>> {
        let url = format!("{}/api/export/embeddings", self.inner.base_url);
        let mut request = self.inner.http.get(&url).query(&[
            ("offset", offset.to_string()),
            ("limit", self.inner.config.batch_size.to_string()),
        ]);
        if let Some(version) = version {
            request = request.query(&[("version", version)]);
        }

        let response = request.send().await.context("Export request failed")?;
        if !response.status().is_success() {
            anyhow::bail!(
                "Export endpoint returned HTTP {}",
                response.status().as_u16()
            );
        }

        response
            .json::<Vec<RemoteEmbedding>>()
            .await
            .context("Failed to decode export page")
    }

    fn set_progress(&self, progress: Option<DownloadProgress>) {
        if let Ok(mut guard) = self.inner.progress.lock() {
            *guard = progress;
        }
    }

    async fn resume_offset(&self, version: Option<&str>) -> Result<u64> {
        let Some(raw) = self.inner.database.get_metadata(PENDING_DOWNLOAD_KEY).await? else {
            return Ok(0);
        };
        let pending: PendingDownload = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(e) => {
                warn!("Discarding unreadable pending-download record: {}", e);
                return Ok(0);
            }
        };
        if pending.version.as_deref() == version {
            Ok(pending.offset)
        } else {
            debug!("Pending download is for another version, starting over");
            Ok(0)
        }
    }

    async fn save_pending(&self, version: Option<&str>, offset: u64) {
        let record = PendingDownload {
            version: version.map(str::to_string),
            offset,
        };
        let encoded = match serde_json::to_string(&record) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to encode pending-download record: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .inner
            .database
            .set_metadata(PENDING_DOWNLOAD_KEY, &encoded)
            .await
        {
            warn!("Failed to persist download offset: {}", e);
        }
    }

    async fn clear_pending(&self) {
        if let Err(e) = self.inner.database.delete_metadata(PENDING_DOWNLOAD_KEY).await {
            warn!("Failed to clear pending-download record: {}", e);
        }
    }
}

impl std::fmt::Debug for DownloadManager {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("running", &self.is_downloading())
            .field("progress", &self.get_progress())
            .finish_non_exhaustive()
    }
}
