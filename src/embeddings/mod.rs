// Embedding generation with a three-tier cache: in-memory map, SQLite cache
// table, then the remote embedding endpoint. Search degrades to empty results
// rather than surfacing transport errors to the caller.


use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::SyncError;
use crate::database::Database;
use crate::database::sqlite::queries::EmbeddingCacheQueries;
use crate::vector::{EMBEDDING_DIMENSION, SearchOptions, VectorStore, validate_dimensions};

/// Bump when the embedding model changes; cached vectors from other versions
/// are treated as misses.
pub const CACHE_VERSION: &str = "1.0.0";

const CACHE_TTL_MS: i64 = 30 * 24 * 60 * 60 * 1000;
const MAX_CACHED_QUERIES: i64 = 1000;
const EVICTION_BATCH: i64 = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_TOP_K: usize = 3;
const MIN_SEARCH_SCORE: f32 = 0.5;

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    embedding: Vec<f32>,
}

/// Client for the remote embedding endpoint.
#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
}

impl EmbeddingClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        let base_url: String = base_url.into();
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Generate an embedding for `text`. A response with the wrong dimension
    /// is a protocol error, not a usable vector.
    pub async fn generate(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings/generate", self.base_url);

        let response = self
            .http
            .post(&url)
            .json(&GenerateRequest { text })
            .send()
            .await
            .context("Embedding request failed")?;

        if !response.status().is_success() {
            return Err(SyncError::Embedding(format!(
                "Embedding endpoint returned HTTP {}",
                response.status().as_u16()
            ))
            .into());
        }

        let body: GenerateResponse = response
            .json()
            .await
            .context("Failed to decode embedding response")?;

        if !validate_dimensions(&body.embedding) {
            return Err(SyncError::Embedding(format!(
                "Embedding endpoint returned {} dimensions, expected {}",
                body.embedding.len(),
                EMBEDDING_DIMENSION
            ))
            .into());
        }

        Ok(body.embedding)
    }
}

/// One hit from semantic search, shaped for the chat pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub content: String,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub persisted_entries: i64,
    pub oldest_entry_ms: Option<i64>,
    pub most_used_query: Option<String>,
}

pub struct VectorService {
    client: EmbeddingClient,
    database: Database,
    store: VectorStore,
    memory_cache: Mutex<HashMap<String, Vec<f32>>>,
}

impl VectorService {
    #[inline]
    pub fn new(client: EmbeddingClient, database: Database) -> Self {
        let store = VectorStore::new(database.clone());
        Self {
            client,
            database,
            store,
            memory_cache: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    fn normalize(query: &str) -> String {
        query.trim().to_lowercase()
    }

    /// Resolve a query embedding through the cache tiers. Only a miss in all
    /// three reaches the network.
    pub async fn get_embedding(&self, query: &str) -> Result<Vec<f32>> {
        let key = Self::normalize(query);

        if let Ok(cache) = self.memory_cache.lock()
            && let Some(vector) = cache.get(&key)
        {
            return Ok(vector.clone());
        }

        if let Some(vector) = self.lookup_persisted(&key).await? {
            return Ok(vector);
        }

        debug!("Embedding cache miss, calling endpoint: {}", key);
        let vector = self.client.generate(&key).await?;
        self.persist(&key, &vector).await;

        Ok(vector)
    }

    async fn lookup_persisted(&self, key: &str) -> Result<Option<Vec<f32>>> {
        let Some(cached) = EmbeddingCacheQueries::get(self.database.pool(), key).await? else {
            return Ok(None);
        };

        if cached.version != CACHE_VERSION {
            return Ok(None);
        }
        let age = crate::database::sqlite::now_ms() - cached.timestamp;
        if age > CACHE_TTL_MS {
            return Ok(None);
        }

        let vector = match cached.vector() {
            Ok(v) => v,
            Err(e) => {
                warn!("Discarding undecodable cached embedding for '{}': {}", key, e);
                return Ok(None);
            }
        };

        if let Ok(mut cache) = self.memory_cache.lock() {
            cache.insert(key.to_string(), vector.clone());
        }

        // Usage bump is bookkeeping only; do not block the lookup on it.
        let pool = self.database.pool().clone();
        let owned_key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = EmbeddingCacheQueries::increment_usage(&pool, &owned_key).await {
                warn!("Failed to bump cache usage for '{}': {}", owned_key, e);
            }
        });

        Ok(Some(vector))
    }

    /// Store a fresh embedding in both cache tiers and trim the persisted
    /// tier when it outgrows its bound. Cache write failures are logged, not
    /// propagated: the caller already has the vector.
    async fn persist(&self, key: &str, vector: &[f32]) {
        if let Ok(mut cache) = self.memory_cache.lock() {
            cache.insert(key.to_string(), vector.to_vec());
        }

        let encoded = match serde_json::to_string(vector) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to encode embedding for cache: {}", e);
                return;
            }
        };

        if let Err(e) =
            EmbeddingCacheQueries::upsert(self.database.pool(), key, &encoded, CACHE_VERSION).await
        {
            warn!("Failed to persist embedding cache entry: {}", e);
            return;
        }

        match EmbeddingCacheQueries::count(self.database.pool()).await {
            Ok(count) if count > MAX_CACHED_QUERIES => {
                match EmbeddingCacheQueries::evict_oldest(self.database.pool(), EVICTION_BATCH)
                    .await
                {
                    Ok(evicted) => info!("Evicted {} old cached query embeddings", evicted),
                    Err(e) => warn!("Embedding cache eviction failed: {}", e),
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to size embedding cache: {}", e),
        }
    }

    /// Semantic search over the local corpus. Failures (no embedding, no
    /// endpoint, corrupt rows) degrade to an empty result list so the chat
    /// pipeline can fall back to non-semantic answers.
    pub async fn search(&self, query: &str, limit: Option<usize>) -> Vec<SearchResult> {
        let embedding = match self.get_embedding(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Semantic search unavailable: {}", e);
                return Vec::new();
            }
        };

        let options = SearchOptions {
            top_k: limit.unwrap_or(DEFAULT_TOP_K),
            min_score: MIN_SEARCH_SCORE,
            filter: None,
        };

        match self.store.search(&embedding, &options).await {
            Ok(matches) => matches
                .into_iter()
                .map(|m| SearchResult {
                    content: m.content,
                    metadata: m.metadata,
                    score: m.score,
                })
                .collect(),
            Err(e) => {
                warn!("Vector search failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Warm the cache for queries the app expects to see. Individual
    /// failures are skipped.
    pub async fn preload_queries(&self, queries: &[String]) -> usize {
        let mut loaded = 0;
        for query in queries {
            match self.get_embedding(query).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!("Preload failed for '{}': {}", query, e),
            }
        }
        info!("Preloaded {}/{} query embeddings", loaded, queries.len());
        loaded
    }

    pub async fn clear_cache(&self) -> Result<()> {
        if let Ok(mut cache) = self.memory_cache.lock() {
            cache.clear();
        }
        EmbeddingCacheQueries::clear(self.database.pool()).await?;
        Ok(())
    }

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        let memory_entries = self.memory_cache.lock().map(|c| c.len()).unwrap_or(0);
        let (persisted_entries, oldest_entry_ms, most_used_query) =
            EmbeddingCacheQueries::stats(self.database.pool()).await?;
        Ok(CacheStats {
            memory_entries,
            persisted_entries,
            oldest_entry_ms,
            most_used_query,
        })
    }
}

impl std::fmt::Debug for VectorService {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorService").finish_non_exhaustive()
    }
}
