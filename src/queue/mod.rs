// Offline query queue: every student question is answered locally and
// recorded here; pending records are shipped to the analytics endpoint in
// priority order once connectivity and consent allow.


use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connectivity::{ConnectivityService, SyncRules};
use crate::database::Database;
use crate::database::sqlite::queries::OfflineQueryQueries;
use crate::database::sqlite::{
    OfflineQuery, QueryMetadata, QueryStatus, QueueStats, now_ms,
};

const BATCH_SIZE: usize = 50;
const MAX_RETRIES: i64 = 3;
const SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETENTION_DAYS: i64 = 30;

const CONSENT_KEY: &str = "analytics_consent";
const DEVICE_ID_KEY: &str = "device_id";

/// Sync rules for background query upload: cellular is fine, WiFi is not
/// required, but a low battery blocks it.
const SYNC_RULES: SyncRules = SyncRules {
    require_wifi: false,
    min_battery_level: 20,
    allow_cellular: true,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub synced: u64,
    pub failed: u64,
    /// Set when the pass did not run at all (no consent, ineligible).
    pub skipped: Option<String>,
}

impl SyncOutcome {
    #[inline]
    fn skipped(reason: String) -> Self {
        Self {
            synced: 0,
            failed: 0,
            skipped: Some(reason),
        }
    }
}

#[derive(Debug, Serialize)]
struct SyncPayload<'a> {
    queries: &'a [OfflineQuery],
}

pub struct OfflineQueryQueue {
    database: Database,
    connectivity: Arc<ConnectivityService>,
    http: reqwest::Client,
    base_url: String,
    app_version: String,
}

impl OfflineQueryQueue {
    pub fn new(
        database: Database,
        connectivity: Arc<ConnectivityService>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(SYNC_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        let base_url: String = base_url.into();
        Ok(Self {
            database,
            connectivity,
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Stable per-install identifier, generated once and persisted. Contains
    /// nothing derived from the device or the user.
    pub async fn device_id(&self) -> Result<String> {
        if let Some(existing) = self.database.get_metadata(DEVICE_ID_KEY).await? {
            return Ok(existing);
        }
        let id = Uuid::new_v4().to_string();
        self.database.set_metadata(DEVICE_ID_KEY, &id).await?;
        info!("Generated new device id");
        Ok(id)
    }

    /// Record a locally answered query. Always succeeds offline; sync
    /// happens later.
    pub async fn add_query(
        &self,
        query: &str,
        response: &str,
        metadata: QueryMetadata,
    ) -> Result<String> {
        let record = OfflineQuery {
            id: Uuid::new_v4().to_string(),
            query: query.to_string(),
            response: response.to_string(),
            timestamp: now_ms(),
            status: QueryStatus::Pending,
            priority: metadata.priority.unwrap_or_default(),
            retry_count: 0,
            error_message: None,
            response_source: metadata.response_source.unwrap_or_default(),
            conversation_id: metadata.conversation_id,
            device_id: self.device_id().await?,
            app_version: self.app_version.clone(),
        };

        OfflineQueryQueries::create(self.database.pool(), &record).await?;
        debug!("Queued query {} ({})", record.id, record.priority);
        Ok(record.id)
    }

    pub async fn set_user_consent(&self, granted: bool) -> Result<()> {
        self.database
            .set_metadata(CONSENT_KEY, if granted { "true" } else { "false" })
            .await
    }

    /// Whether the user has opted in to analytics upload. Absent means no.
    pub async fn has_user_consent(&self) -> Result<bool> {
        Ok(self
            .database
            .get_metadata(CONSENT_KEY)
            .await?
            .is_some_and(|v| v == "true"))
    }

    /// Upload pending queries in priority order, batch by batch. A failed
    /// batch records the attempt on its members and does not block later
    /// batches.
    pub async fn sync_pending_queries(&self) -> Result<SyncOutcome> {
        if !self.has_user_consent().await? {
            debug!("Sync skipped: no analytics consent");
            return Ok(SyncOutcome::skipped(
                "User has not consented to analytics sync".to_string(),
            ));
        }

        let eligibility = self.connectivity.check_sync_eligibility(&SYNC_RULES);
        if !eligibility.eligible {
            let reason = eligibility
                .reason
                .unwrap_or_else(|| "Sync not currently possible".to_string());
            debug!("Sync skipped: {}", reason);
            return Ok(SyncOutcome::skipped(reason));
        }

        let pending = OfflineQueryQueries::pending_ordered(self.database.pool()).await?;
        if pending.is_empty() {
            return Ok(SyncOutcome {
                synced: 0,
                failed: 0,
                skipped: None,
            });
        }

        info!("Syncing {} pending queries", pending.len());
        let mut synced = 0u64;
        let mut failed = 0u64;

        for batch in pending.chunks(BATCH_SIZE) {
            let ids: Vec<String> = batch.iter().map(|q| q.id.clone()).collect();
            match self.upload_batch(batch).await {
                Ok(()) => {
                    OfflineQueryQueries::mark_batch_synced(self.database.pool(), &ids).await?;
                    synced += ids.len() as u64;
                }
                Err(e) => {
                    warn!("Batch of {} failed to sync: {}", ids.len(), e);
                    OfflineQueryQueries::mark_batch_attempt_failed(
                        self.database.pool(),
                        &ids,
                        &e.to_string(),
                        MAX_RETRIES,
                    )
                    .await?;
                    failed += ids.len() as u64;
                }
            }
        }

        info!("Sync finished: {} synced, {} failed", synced, failed);
        Ok(SyncOutcome {
            synced,
            failed,
            skipped: None,
        })
    }

    async fn upload_batch(&self, batch: &[OfflineQuery]) -> Result<()> {
        let url = format!("{}/api/sync/queries", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&SyncPayload { queries: batch })
            .send()
            .await
            .context("Sync request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Sync endpoint returned HTTP {}", response.status().as_u16());
        }
        Ok(())
    }

    /// Put records that exhausted their retries back into rotation and run
    /// a sync pass.
    pub async fn retry_failed(&self) -> Result<SyncOutcome> {
        let reset = OfflineQueryQueries::reset_failed(self.database.pool()).await?;
        if reset > 0 {
            info!("Reset {} failed queries for retry", reset);
        }
        self.sync_pending_queries().await
    }

    #[inline]
    pub async fn stats(&self) -> Result<QueueStats> {
        OfflineQueryQueries::stats(self.database.pool()).await
    }

    /// Drop records older than `days` (default 30) regardless of status.
    pub async fn cleanup_old_queries(&self, days: Option<i64>) -> Result<u64> {
        let days = days.unwrap_or(DEFAULT_RETENTION_DAYS);
        let threshold = now_ms() - days * 24 * 60 * 60 * 1000;
        let removed =
            OfflineQueryQueries::delete_older_than(self.database.pool(), threshold).await?;
        if removed > 0 {
            info!("Removed {} queries older than {} days", removed, days);
        }
        Ok(removed)
    }

    #[inline]
    pub async fn clear_synced(&self) -> Result<u64> {
        OfflineQueryQueries::delete_synced(self.database.pool()).await
    }

    #[inline]
    pub async fn queries_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<OfflineQuery>> {
        OfflineQueryQueries::list_by_conversation(self.database.pool(), conversation_id).await
    }

    /// Full queue dump plus stats, for support bundles.
    pub async fn export(&self) -> Result<serde_json::Value> {
        let queries = OfflineQueryQueries::list_recent(self.database.pool(), i64::MAX).await?;
        let stats = self.stats().await?;
        Ok(serde_json::json!({
            "exported_at": now_ms(),
            "stats": stats,
            "queries": queries,
        }))
    }
}

impl std::fmt::Debug for OfflineQueryQueue {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueryQueue")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
