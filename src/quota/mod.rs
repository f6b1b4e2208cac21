// Storage quota manager: tracks how much of the local embedding budget is
// used, answers admission checks before downloads, and evicts rows when the
// budget is crossed.


use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::database::Database;
use crate::database::sqlite::queries::EmbeddingQueries;

/// Fraction of used bytes a cleanup pass tries to free when the caller does
/// not pick one.
const DEFAULT_CLEANUP_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStrategy {
    /// Remove the longest-untouched rows first.
    OldestFirst,
    /// Alias ordering for recency: the store tracks `updated_at` only, so
    /// this matches [`CleanupStrategy::OldestFirst`] until per-read touch
    /// tracking lands.
    Lru,
    /// Remove the smallest rows first, trading many deletions for minimal
    /// corpus loss.
    LowUsage,
    /// Remove the largest rows first to free space in few deletions.
    Partial,
}

impl std::fmt::Display for CleanupStrategy {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            CleanupStrategy::OldestFirst => write!(f, "oldest_first"),
            CleanupStrategy::Lru => write!(f, "lru"),
            CleanupStrategy::LowUsage => write!(f, "low_usage"),
            CleanupStrategy::Partial => write!(f, "partial"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    /// Cross the cleanup threshold and eviction runs unprompted.
    Auto,
    /// Only warn; the host decides when to clean.
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub max_size_bytes: u64,
    pub max_embeddings: u64,
    pub warning_threshold: f64,
    pub cleanup_threshold: f64,
    /// Device free space the quota never eats into.
    pub min_free_disk_bytes: u64,
    pub cleanup_mode: CleanupMode,
    pub cleanup_strategy: CleanupStrategy,
}

impl Default for QuotaConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_size_bytes: 100 * 1024 * 1024,
            max_embeddings: 10_000,
            warning_threshold: 0.8,
            cleanup_threshold: 0.9,
            min_free_disk_bytes: 50 * 1024 * 1024,
            cleanup_mode: CleanupMode::Auto,
            cleanup_strategy: CleanupStrategy::OldestFirst,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub max_bytes: u64,
    /// Quota headroom left, zero once over budget.
    pub available_bytes: u64,
    pub embedding_count: u64,
    pub max_embeddings: u64,
    /// used_bytes / max_bytes, in [0, 1] plus overshoot.
    pub usage_fraction: f64,
    /// Rounded percentage of the byte quota, capped at 100.
    pub quota_percentage: u8,
    /// Either cap breached: byte budget or record count.
    pub quota_exceeded: bool,
    pub oldest_embedding_ms: Option<i64>,
    pub newest_embedding_ms: Option<i64>,
    pub free_disk_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupResult {
    pub items_removed: u64,
    pub bytes_freed: u64,
    pub strategy: CleanupStrategy,
    pub duration_ms: u64,
    pub success: bool,
}

/// Device-level storage probe. Production uses [`SystemStorage`]; tests
/// inject fixed values.
pub trait DeviceStorage: Send + Sync {
    fn free_disk_bytes(&self) -> Result<u64>;
}

/// Free-space probe over the disk holding the data directory.
pub struct SystemStorage {
    data_dir: std::path::PathBuf,
}

impl SystemStorage {
    #[inline]
    pub fn new(data_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

impl DeviceStorage for SystemStorage {
    fn free_disk_bytes(&self) -> Result<u64> {
        let disks = sysinfo::Disks::new_with_refreshed_list();

        // Deepest mount point containing the data directory wins.
        let best = disks
            .list()
            .iter()
            .filter(|disk| self.data_dir.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len());

        best.map(sysinfo::Disk::available_space)
            .ok_or_else(|| anyhow::anyhow!("no disk found for {}", self.data_dir.display()))
    }
}

/// Fixed-value probe for tests.
#[derive(Debug)]
pub struct FixedStorage {
    pub free_bytes: Option<u64>,
}

impl DeviceStorage for FixedStorage {
    #[inline]
    fn free_disk_bytes(&self) -> Result<u64> {
        self.free_bytes
            .ok_or_else(|| anyhow::anyhow!("storage probe unavailable"))
    }
}

type WarningCallback = Box<dyn Fn(&StorageUsage) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarningHandle(u64);

pub struct StorageQuotaManager {
    database: Database,
    config: QuotaConfig,
    storage: std::sync::Arc<dyn DeviceStorage>,
    warning_listeners: Mutex<Vec<(u64, WarningCallback)>>,
    next_handle: AtomicU64,
}

impl StorageQuotaManager {
    #[inline]
    pub fn new(
        database: Database,
        config: QuotaConfig,
        storage: std::sync::Arc<dyn DeviceStorage>,
    ) -> Self {
        Self {
            database,
            config,
            storage,
            warning_listeners: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Current usage snapshot. A failed disk probe degrades to zero free
    /// bytes here so status reporting keeps working; admission checks treat
    /// the same failure as fatal.
    pub async fn get_usage(&self) -> Result<StorageUsage> {
        let (count, used, oldest, newest) = EmbeddingQueries::usage(self.database.pool()).await?;
        let used_bytes = u64::try_from(used).unwrap_or(0);
        let embedding_count = u64::try_from(count).unwrap_or(0);

        let free_disk_bytes = match self.storage.free_disk_bytes() {
            Ok(free) => free,
            Err(e) => {
                warn!("Disk probe failed, reporting zero free space: {}", e);
                0
            }
        };

        let usage_fraction = used_bytes as f64 / self.config.max_size_bytes as f64;
        Ok(StorageUsage {
            used_bytes,
            max_bytes: self.config.max_size_bytes,
            available_bytes: self.config.max_size_bytes.saturating_sub(used_bytes),
            embedding_count,
            max_embeddings: self.config.max_embeddings,
            usage_fraction,
            quota_percentage: (usage_fraction * 100.0).round().min(100.0) as u8,
            quota_exceeded: used_bytes > self.config.max_size_bytes
                || embedding_count > self.config.max_embeddings,
            oldest_embedding_ms: oldest,
            newest_embedding_ms: newest,
            free_disk_bytes,
        })
    }

    /// Admission check for `required_bytes` of new data. Fails closed: an
    /// unreadable disk probe means "no room".
    pub async fn has_sufficient_storage(&self, required_bytes: u64) -> Result<bool> {
        let free = match self.storage.free_disk_bytes() {
            Ok(free) => free,
            Err(e) => {
                error!("Disk probe failed during admission check: {}", e);
                return Ok(false);
            }
        };

        if free < required_bytes.saturating_add(self.config.min_free_disk_bytes) {
            debug!(
                "Admission denied: {} free, {} required plus {} floor",
                free, required_bytes, self.config.min_free_disk_bytes
            );
            return Ok(false);
        }

        let usage = self.get_usage().await?;
        if usage.used_bytes.saturating_add(required_bytes) > self.config.max_size_bytes {
            debug!(
                "Admission denied: {} used + {} required exceeds {} quota",
                usage.used_bytes, required_bytes, self.config.max_size_bytes
            );
            return Ok(false);
        }

        if usage.embedding_count >= self.config.max_embeddings {
            return Ok(false);
        }

        Ok(true)
    }

    /// Strategy to use when eviction is needed right now: deep overshoot
    /// favors freeing the most bytes per deletion.
    pub async fn recommend_strategy(&self) -> Result<CleanupStrategy> {
        let usage = self.get_usage().await?;
        if usage.usage_fraction >= 0.95 {
            Ok(CleanupStrategy::Partial)
        } else {
            Ok(self.config.cleanup_strategy)
        }
    }

    /// Evict rows per `strategy` until roughly `target_free_fraction` of
    /// used bytes is freed (a fifth when unset). Never reports a hard
    /// failure: an errored pass yields a result with `success: false` so
    /// callers can proceed degraded.
    pub async fn execute_cleanup(
        &self,
        strategy: CleanupStrategy,
        target_free_fraction: Option<f64>,
    ) -> CleanupResult {
        let fraction = target_free_fraction.unwrap_or(DEFAULT_CLEANUP_FRACTION);
        let start = Instant::now();
        match self.cleanup_pass(strategy, fraction).await {
            Ok((items_removed, bytes_freed)) => {
                info!(
                    "Cleanup ({}) removed {} rows, freed {} bytes",
                    strategy, items_removed, bytes_freed
                );
                CleanupResult {
                    items_removed,
                    bytes_freed,
                    strategy,
                    duration_ms: start.elapsed().as_millis() as u64,
                    success: true,
                }
            }
            Err(e) => {
                error!("Cleanup ({}) failed: {}", strategy, e);
                CleanupResult {
                    items_removed: 0,
                    bytes_freed: 0,
                    strategy,
                    duration_ms: start.elapsed().as_millis() as u64,
                    success: false,
                }
            }
        }
    }

    async fn cleanup_pass(&self, strategy: CleanupStrategy, fraction: f64) -> Result<(u64, u64)> {
        let (_, used, _, _) = EmbeddingQueries::usage(self.database.pool()).await?;
        let target_bytes = (used as f64 * fraction.clamp(0.0, 1.0)) as i64;
        if target_bytes <= 0 {
            return Ok((0, 0));
        }

        let mut candidates = EmbeddingQueries::eviction_candidates(self.database.pool()).await?;
        match strategy {
            CleanupStrategy::OldestFirst | CleanupStrategy::Lru => {
                candidates.sort_by_key(|&(_, _, updated_at)| updated_at);
            }
            CleanupStrategy::LowUsage => {
                candidates.sort_by_key(|&(_, size, _)| size);
            }
            CleanupStrategy::Partial => {
                candidates.sort_by_key(|&(_, size, _)| std::cmp::Reverse(size));
            }
        }

        let mut to_delete = Vec::new();
        let mut bytes_freed = 0i64;
        for (id, size, _) in candidates {
            if bytes_freed >= target_bytes {
                break;
            }
            bytes_freed += size;
            to_delete.push(id);
        }

        if to_delete.is_empty() {
            return Ok((0, 0));
        }

        let removed = EmbeddingQueries::delete_by_ids(self.database.pool(), &to_delete).await?;
        Ok((removed, u64::try_from(bytes_freed).unwrap_or(0)))
    }

    /// Periodic check: warn listeners past the warning threshold and, in
    /// auto mode, evict past the cleanup threshold. Returns the cleanup
    /// result when one ran.
    pub async fn monitor_and_cleanup(&self) -> Result<Option<CleanupResult>> {
        let usage = self.get_usage().await?;

        if usage.usage_fraction >= self.config.warning_threshold {
            warn!(
                "Storage usage at {:.0}% of quota",
                usage.usage_fraction * 100.0
            );
            self.notify_warning(&usage);
        }

        if usage.usage_fraction >= self.config.cleanup_threshold
            && self.config.cleanup_mode == CleanupMode::Auto
        {
            let strategy = self.recommend_strategy().await?;
            return Ok(Some(self.execute_cleanup(strategy, None).await));
        }

        Ok(None)
    }

    /// Register a callback for quota warnings.
    #[inline]
    pub fn on_warning<F>(&self, callback: F) -> WarningHandle
    where
        F: Fn(&StorageUsage) + Send + 'static,
    {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.warning_listeners.lock() {
            listeners.push((handle, Box::new(callback)));
        }
        WarningHandle(handle)
    }

    /// Remove a warning subscriber; repeat removals are no-ops.
    #[inline]
    pub fn remove_warning_listener(&self, handle: WarningHandle) {
        if let Ok(mut listeners) = self.warning_listeners.lock() {
            listeners.retain(|(id, _)| *id != handle.0);
        }
    }

    fn notify_warning(&self, usage: &StorageUsage) {
        if let Ok(listeners) = self.warning_listeners.lock() {
            for (id, callback) in listeners.iter() {
                if catch_unwind(AssertUnwindSafe(|| callback(usage))).is_err() {
                    error!("Storage warning listener {} panicked", id);
                }
            }
        }
    }
}

impl std::fmt::Debug for StorageQuotaManager {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageQuotaManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
