use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};

/// Current epoch-millisecond timestamp. All persisted timestamps use this unit.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A stored semantic unit: one passage of source material plus its vector.
///
/// The vector is persisted as a JSON array of f32; rows are never mutated
/// after creation in normal operation, only deleted by eviction or an
/// explicit cache clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct EmbeddingRow {
    pub id: String,
    pub vector: String,
    pub content: String,
    pub source: Option<String>,
    pub chapter: Option<String>,
    pub page: Option<i64>,
    pub metadata: Option<String>,
    pub size_bytes: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl EmbeddingRow {
    #[inline]
    pub fn vector(&self) -> Result<Vec<f32>> {
        serde_json::from_str(&self.vector)
            .with_context(|| format!("Failed to decode stored vector for embedding {}", self.id))
    }

    #[inline]
    pub fn metadata_map(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        self.metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEmbedding {
    pub vector: Vec<f32>,
    pub content: String,
    pub source: Option<String>,
    pub chapter: Option<String>,
    pub page: Option<i64>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl NewEmbedding {
    /// Approximate on-disk footprint, used for quota accounting.
    #[inline]
    pub fn estimated_size_bytes(&self) -> i64 {
        let vector_bytes = self.vector.len() * size_of::<f32>();
        let metadata_bytes = self
            .metadata
            .as_ref()
            .and_then(|m| serde_json::to_string(m).ok())
            .map_or(0, |s| s.len());
        (vector_bytes + self.content.len() + metadata_bytes) as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Pending,
    Synced,
    Failed,
}

impl std::fmt::Display for QueryStatus {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            QueryStatus::Pending => write!(f, "pending"),
            QueryStatus::Synced => write!(f, "synced"),
            QueryStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type, Default)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueryPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl std::fmt::Display for QueryPriority {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            QueryPriority::Low => write!(f, "low"),
            QueryPriority::Normal => write!(f, "normal"),
            QueryPriority::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type, Default)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    #[default]
    Local,
    Cache,
    Fallback,
}

impl std::fmt::Display for ResponseSource {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            ResponseSource::Local => write!(f, "local"),
            ResponseSource::Cache => write!(f, "cache"),
            ResponseSource::Fallback => write!(f, "fallback"),
        }
    }
}

/// One logged question/answer interaction, queued for upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct OfflineQuery {
    pub id: String,
    pub query: String,
    pub response: String,
    pub timestamp: i64,
    pub status: QueryStatus,
    pub priority: QueryPriority,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub response_source: ResponseSource,
    pub conversation_id: Option<String>,
    pub device_id: String,
    pub app_version: String,
}

impl OfflineQuery {
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    #[inline]
    pub fn is_synced(&self) -> bool {
        self.status == QueryStatus::Synced
    }
}

/// Caller-supplied metadata attached when logging a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub priority: Option<QueryPriority>,
    pub response_source: Option<ResponseSource>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PriorityCounts {
    pub high: i64,
    pub normal: i64,
    pub low: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueStats {
    pub total: i64,
    pub pending: i64,
    pub failed: i64,
    pub synced: i64,
    pub by_priority: PriorityCounts,
}

/// Generic key/value/timestamp triple tracking last-known dataset version,
/// last sync time, consent flags, and similar single-value state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SyncMetadata {
    pub key: String,
    pub value: String,
    pub updated_at: i64,
}

/// Out-of-band validity record for a cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CacheMetadata {
    pub key: String,
    pub timestamp: i64,
    pub version: String,
    pub ttl_ms: Option<i64>,
}

/// Persistent tier of the query-embedding cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CachedEmbedding {
    pub query: String,
    pub embedding: String,
    pub timestamp: i64,
    pub usage_count: i64,
    pub version: String,
}

impl CachedEmbedding {
    #[inline]
    pub fn vector(&self) -> Result<Vec<f32>> {
        serde_json::from_str(&self.embedding)
            .with_context(|| format!("Failed to decode cached embedding for '{}'", self.query))
    }
}
