// Cache invalidation: decides when the local corpus and derived caches are
// stale, based on dataset version pinning and per-key TTLs.


use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::database::sqlite::now_ms;
use crate::database::sqlite::queries::{CacheMetadataQueries, EmbeddingCacheQueries};

const VERSION_KEY: &str = "dataset_version";
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Corpus older than this is stale even if the version still matches.
const DATASET_TTL_MS: i64 = 30 * 24 * 60 * 60 * 1000;
/// Default freshness window for per-key cache records.
const DEFAULT_KEY_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Major-version distance beyond which an incremental update is not worth
/// attempting.
const FULL_REFRESH_MAJOR_GAP: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatusReason {
    MissingVersion,
    Expired,
    VersionMismatch,
    Valid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub valid: bool,
    pub reason: CacheStatusReason,
    pub local_version: Option<String>,
    pub remote_version: Option<String>,
}

/// Verdict for a single cached artifact. The reason distinguishes a key
/// that needs re-downloading from one that only needs a version re-pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyStatus {
    pub valid: bool,
    pub reason: CacheStatusReason,
}

pub struct CacheInvalidationService {
    database: Database,
    http: reqwest::Client,
    base_url: String,
}

impl CacheInvalidationService {
    pub fn new(database: Database, base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(VERSION_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        let base_url: String = base_url.into();
        Ok(Self {
            database,
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Dataset version currently served by the API. The endpoint returns
    /// either a bare JSON string or an object with a `version` field.
    pub async fn get_latest_version(&self) -> Result<String> {
        let url = format!("{}/api/sync/version", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("Version request failed")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Version endpoint returned HTTP {}",
                response.status().as_u16()
            );
        }

        let body: serde_json::Value = response
            .json()
            .await
            .context("Failed to decode version response")?;

        match body {
            serde_json::Value::String(version) => Ok(version),
            serde_json::Value::Object(map) => map
                .get("version")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("Version response missing 'version' field")),
            other => anyhow::bail!("Unexpected version response shape: {}", other),
        }
    }

    pub async fn get_local_version(&self) -> Result<Option<String>> {
        self.database.get_metadata(VERSION_KEY).await
    }

    pub async fn update_local_version(&self, version: &str) -> Result<()> {
        info!("Pinning dataset version {}", version);
        self.database.set_metadata(VERSION_KEY, version).await
    }

    /// Whether the pinned version has aged past the dataset TTL. A missing
    /// pin counts as expired.
    pub async fn is_cache_expired(&self) -> Result<bool> {
        let Some(entry) = self.database.get_metadata_entry(VERSION_KEY).await? else {
            return Ok(true);
        };
        Ok(now_ms() - entry.updated_at > DATASET_TTL_MS)
    }

    /// Whether `local` and `remote` disagree. A major-version gap beyond
    /// [`FULL_REFRESH_MAJOR_GAP`] is logged as needing a full re-download
    /// rather than an incremental one.
    pub fn is_outdated(local: &str, remote: &str) -> bool {
        if local == remote {
            return false;
        }
        if let (Some(local_major), Some(remote_major)) = (major_of(local), major_of(remote))
            && remote_major.abs_diff(local_major) > FULL_REFRESH_MAJOR_GAP
        {
            warn!(
                "Local dataset {} is {} major versions behind {}; full refresh recommended",
                local,
                remote_major.abs_diff(local_major),
                remote
            );
        }
        true
    }

    /// Overall corpus verdict, checked in order: no pinned version, pin past
    /// its TTL, pin differs from the server. An unreachable server downgrades
    /// the version comparison, not the whole verdict.
    pub async fn check_cache_status(&self) -> Result<CacheStatus> {
        let local_version = self.get_local_version().await?;

        let Some(local) = local_version else {
            return Ok(CacheStatus {
                valid: false,
                reason: CacheStatusReason::MissingVersion,
                local_version: None,
                remote_version: None,
            });
        };

        if self.is_cache_expired().await? {
            return Ok(CacheStatus {
                valid: false,
                reason: CacheStatusReason::Expired,
                local_version: Some(local),
                remote_version: None,
            });
        }

        match self.get_latest_version().await {
            Ok(remote) => {
                if Self::is_outdated(&local, &remote) {
                    Ok(CacheStatus {
                        valid: false,
                        reason: CacheStatusReason::VersionMismatch,
                        local_version: Some(local),
                        remote_version: Some(remote),
                    })
                } else {
                    Ok(CacheStatus {
                        valid: true,
                        reason: CacheStatusReason::Valid,
                        local_version: Some(local),
                        remote_version: Some(remote),
                    })
                }
            }
            Err(e) => {
                // Offline is normal here; a fresh unexpired pin stays valid.
                warn!("Could not check remote dataset version: {}", e);
                Ok(CacheStatus {
                    valid: true,
                    reason: CacheStatusReason::Valid,
                    local_version: Some(local),
                    remote_version: None,
                })
            }
        }
    }

    /// Record that a cached artifact was refreshed now.
    pub async fn touch(&self, key: &str, version: &str, ttl_ms: Option<i64>) -> Result<()> {
        CacheMetadataQueries::touch(self.database.pool(), key, version, ttl_ms).await
    }

    /// Verdict for a per-key record, checked in order: no record, record
    /// past its TTL, version differs from the expected one.
    pub async fn check_key_status(
        &self,
        key: &str,
        expected_version: Option<&str>,
    ) -> Result<KeyStatus> {
        let Some(entry) = CacheMetadataQueries::get(self.database.pool(), key).await? else {
            return Ok(KeyStatus {
                valid: false,
                reason: CacheStatusReason::MissingVersion,
            });
        };
        let ttl = entry.ttl_ms.unwrap_or(DEFAULT_KEY_TTL_MS);
        if now_ms() - entry.timestamp > ttl {
            return Ok(KeyStatus {
                valid: false,
                reason: CacheStatusReason::Expired,
            });
        }
        if let Some(expected) = expected_version
            && entry.version != expected
        {
            return Ok(KeyStatus {
                valid: false,
                reason: CacheStatusReason::VersionMismatch,
            });
        }
        Ok(KeyStatus {
            valid: true,
            reason: CacheStatusReason::Valid,
        })
    }

    pub async fn invalidate(&self, key: &str) -> Result<()> {
        debug!("Invalidating cache key {}", key);
        CacheMetadataQueries::delete(self.database.pool(), key).await
    }

    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<u64> {
        let removed = CacheMetadataQueries::delete_prefix(self.database.pool(), prefix).await?;
        debug!("Invalidated {} keys under prefix {}", removed, prefix);
        Ok(removed)
    }

    /// Full cache reset: drops every per-key record, the persisted query
    /// embeddings, and the version pin. The embedding corpus itself is left
    /// to the download manager to replace.
    pub async fn invalidate_all(&self) -> Result<()> {
        info!("Invalidating all cached data");
        CacheMetadataQueries::clear(self.database.pool()).await?;
        EmbeddingCacheQueries::clear(self.database.pool()).await?;
        self.database.delete_metadata(VERSION_KEY).await?;
        Ok(())
    }
}

fn major_of(version: &str) -> Option<u32> {
    version.split('.').next()?.trim().parse().ok()
}

impl std::fmt::Debug for CacheInvalidationService {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheInvalidationService")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
