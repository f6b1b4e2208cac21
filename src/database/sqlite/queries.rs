use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use super::models::{
    CacheMetadata, CachedEmbedding, EmbeddingRow, NewEmbedding, OfflineQuery, PriorityCounts,
    QueryStatus, QueueStats, SyncMetadata, now_ms,
};

/// Ranks priority text for ordering: high before normal before low.
const PRIORITY_RANK: &str =
    "CASE priority WHEN 'high' THEN 2 WHEN 'normal' THEN 1 ELSE 0 END";

pub struct EmbeddingQueries;

impl EmbeddingQueries {
    /// Insert a batch of embeddings as a single transaction (all-or-nothing).
    /// Dimension validation happens in the vector store before this is called.
    #[inline]
    pub async fn create_batch(pool: &SqlitePool, batch: Vec<NewEmbedding>) -> Result<Vec<String>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut transaction = pool
            .begin()
            .await
            .context("Failed to begin transaction for embedding batch insert")?;

        let now = now_ms();
        let mut ids = Vec::with_capacity(batch.len());

        for embedding in batch {
            let id = Uuid::new_v4().to_string();
            let vector_json = serde_json::to_string(&embedding.vector)
                .context("Failed to encode embedding vector")?;
            let metadata_json = embedding
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("Failed to encode embedding metadata")?;
            let size_bytes = embedding.estimated_size_bytes();

            sqlx::query(
                r#"
                INSERT INTO embeddings (id, vector, content, source, chapter, page, metadata, size_bytes, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(&vector_json)
            .bind(&embedding.content)
            .bind(&embedding.source)
            .bind(&embedding.chapter)
            .bind(embedding.page)
            .bind(&metadata_json)
            .bind(size_bytes)
            .bind(now)
            .bind(now)
            .execute(&mut *transaction)
            .await
            .context("Failed to insert embedding in batch")?;

            ids.push(id);
        }

        transaction
            .commit()
            .await
            .context("Failed to commit embedding batch insert")?;

        debug!("Inserted {} embeddings", ids.len());
        Ok(ids)
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: &str) -> Result<Option<EmbeddingRow>> {
        sqlx::query_as::<_, EmbeddingRow>("SELECT * FROM embeddings WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("Failed to get embedding by id")
    }

    /// All embeddings matching the optional exact-match filters.
    #[inline]
    pub async fn list_filtered(
        pool: &SqlitePool,
        source: Option<&str>,
        chapter: Option<&str>,
    ) -> Result<Vec<EmbeddingRow>> {
        let mut sql = String::from("SELECT * FROM embeddings WHERE 1 = 1");
        if source.is_some() {
            sql.push_str(" AND source = ?");
        }
        if chapter.is_some() {
            sql.push_str(" AND chapter = ?");
        }

        let mut query = sqlx::query_as::<_, EmbeddingRow>(&sql);
        if let Some(source) = source {
            query = query.bind(source);
        }
        if let Some(chapter) = chapter {
            query = query.bind(chapter);
        }

        query
            .fetch_all(pool)
            .await
            .context("Failed to list embeddings")
    }

    #[inline]
    pub async fn count(pool: &SqlitePool) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM embeddings")
            .fetch_one(pool)
            .await
            .context("Failed to count embeddings")
    }

    /// Aggregate usage: (count, used bytes, oldest created_at, newest created_at).
    #[inline]
    pub async fn usage(pool: &SqlitePool) -> Result<(i64, i64, Option<i64>, Option<i64>)> {
        let (count, used, oldest, newest) =
            sqlx::query_as::<_, (i64, Option<i64>, Option<i64>, Option<i64>)>(
                "SELECT COUNT(*), SUM(size_bytes), MIN(created_at), MAX(created_at) FROM embeddings",
            )
            .fetch_one(pool)
            .await
            .context("Failed to aggregate embedding usage")?;

        Ok((count, used.unwrap_or(0), oldest, newest))
    }

    /// Candidate rows for eviction: (id, size_bytes, updated_at).
    #[inline]
    pub async fn eviction_candidates(pool: &SqlitePool) -> Result<Vec<(String, i64, i64)>> {
        sqlx::query_as::<_, (String, i64, i64)>(
            "SELECT id, size_bytes, updated_at FROM embeddings",
        )
        .fetch_all(pool)
        .await
        .context("Failed to load eviction candidates")
    }

    #[inline]
    pub async fn delete_by_ids(pool: &SqlitePool, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut transaction = pool
            .begin()
            .await
            .context("Failed to begin transaction for embedding deletion")?;

        let mut deleted = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM embeddings WHERE id = ?")
                .bind(id)
                .execute(&mut *transaction)
                .await
                .context("Failed to delete embedding")?;
            deleted += result.rows_affected();
        }

        transaction
            .commit()
            .await
            .context("Failed to commit embedding deletion")?;

        Ok(deleted)
    }

    #[inline]
    pub async fn delete_all(pool: &SqlitePool) -> Result<u64> {
        let result = sqlx::query("DELETE FROM embeddings")
            .execute(pool)
            .await
            .context("Failed to clear embeddings")?;
        Ok(result.rows_affected())
    }
}

pub struct OfflineQueryQueries;

impl OfflineQueryQueries {
    #[inline]
    pub async fn create(pool: &SqlitePool, record: &OfflineQuery) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO offline_queries
                (id, query, response, timestamp, status, priority, retry_count,
                 error_message, response_source, conversation_id, device_id, app_version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.query)
        .bind(&record.response)
        .bind(record.timestamp)
        .bind(record.status)
        .bind(record.priority)
        .bind(record.retry_count)
        .bind(&record.error_message)
        .bind(record.response_source)
        .bind(&record.conversation_id)
        .bind(&record.device_id)
        .bind(&record.app_version)
        .execute(pool)
        .await
        .context("Failed to create offline query")?;

        Ok(())
    }

    #[inline]
    pub async fn get_by_id(pool: &SqlitePool, id: &str) -> Result<Option<OfflineQuery>> {
        sqlx::query_as::<_, OfflineQuery>("SELECT * FROM offline_queries WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("Failed to get offline query by id")
    }

    #[inline]
    pub async fn list_by_status(pool: &SqlitePool, status: QueryStatus) -> Result<Vec<OfflineQuery>> {
        sqlx::query_as::<_, OfflineQuery>(
            "SELECT * FROM offline_queries WHERE status = ? ORDER BY timestamp ASC",
        )
        .bind(status)
        .fetch_all(pool)
        .await
        .context("Failed to list offline queries by status")
    }

    /// Pending records in upload order: priority descending, then oldest first.
    #[inline]
    pub async fn pending_ordered(pool: &SqlitePool) -> Result<Vec<OfflineQuery>> {
        let sql = format!(
            "SELECT * FROM offline_queries WHERE status = 'pending' \
             ORDER BY {PRIORITY_RANK} DESC, timestamp ASC",
        );
        sqlx::query_as::<_, OfflineQuery>(&sql)
            .fetch_all(pool)
            .await
            .context("Failed to list pending offline queries")
    }

    #[inline]
    pub async fn mark_batch_synced(pool: &SqlitePool, ids: &[String]) -> Result<()> {
        let mut transaction = pool
            .begin()
            .await
            .context("Failed to begin transaction for sync status update")?;

        for id in ids {
            sqlx::query(
                "UPDATE offline_queries SET status = 'synced', error_message = NULL WHERE id = ?",
            )
            .bind(id)
            .execute(&mut *transaction)
            .await
            .context("Failed to mark query synced")?;
        }

        transaction
            .commit()
            .await
            .context("Failed to commit sync status update")?;

        Ok(())
    }

    /// Record a failed upload attempt for every query in the batch. The status
    /// flips to `failed` only once the retry cap is reached; otherwise the
    /// record stays `pending` for a future pass.
    #[inline]
    pub async fn mark_batch_attempt_failed(
        pool: &SqlitePool,
        ids: &[String],
        error: &str,
        max_retries: i64,
    ) -> Result<()> {
        let mut transaction = pool
            .begin()
            .await
            .context("Failed to begin transaction for failure update")?;

        for id in ids {
            sqlx::query(
                r#"
                UPDATE offline_queries
                SET retry_count = retry_count + 1,
                    status = CASE WHEN retry_count + 1 >= ? THEN 'failed' ELSE 'pending' END,
                    error_message = ?
                WHERE id = ?
                "#,
            )
            .bind(max_retries)
            .bind(error)
            .bind(id)
            .execute(&mut *transaction)
            .await
            .context("Failed to record query upload failure")?;
        }

        transaction
            .commit()
            .await
            .context("Failed to commit failure update")?;

        Ok(())
    }

    #[inline]
    pub async fn reset_failed(pool: &SqlitePool) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE offline_queries SET status = 'pending', retry_count = 0, error_message = NULL \
             WHERE status = 'failed'",
        )
        .execute(pool)
        .await
        .context("Failed to reset failed queries")?;

        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn stats(pool: &SqlitePool) -> Result<QueueStats> {
        let (total, pending, failed, synced, high, normal, low) = sqlx::query_as::<
            _,
            (i64, i64, i64, i64, i64, i64, i64),
        >(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'synced' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN priority = 'high' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN priority = 'normal' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN priority = 'low' THEN 1 ELSE 0 END), 0)
            FROM offline_queries
            "#,
        )
        .fetch_one(pool)
        .await
        .context("Failed to get queue statistics")?;

        Ok(QueueStats {
            total,
            pending,
            failed,
            synced,
            by_priority: PriorityCounts { high, normal, low },
        })
    }

    #[inline]
    pub async fn delete_older_than(pool: &SqlitePool, threshold_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM offline_queries WHERE timestamp < ?")
            .bind(threshold_ms)
            .execute(pool)
            .await
            .context("Failed to delete old queries")?;
        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn delete_synced(pool: &SqlitePool) -> Result<u64> {
        let result = sqlx::query("DELETE FROM offline_queries WHERE status = 'synced'")
            .execute(pool)
            .await
            .context("Failed to delete synced queries")?;
        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn list_by_conversation(
        pool: &SqlitePool,
        conversation_id: &str,
    ) -> Result<Vec<OfflineQuery>> {
        sqlx::query_as::<_, OfflineQuery>(
            "SELECT * FROM offline_queries WHERE conversation_id = ? ORDER BY timestamp ASC",
        )
        .bind(conversation_id)
        .fetch_all(pool)
        .await
        .context("Failed to list queries by conversation")
    }

    #[inline]
    pub async fn list_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<OfflineQuery>> {
        sqlx::query_as::<_, OfflineQuery>(
            "SELECT * FROM offline_queries ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to list recent queries")
    }
}

pub struct SyncMetadataQueries;

impl SyncMetadataQueries {
    #[inline]
    pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<SyncMetadata>> {
        sqlx::query_as::<_, SyncMetadata>("SELECT * FROM sync_metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await
            .context("Failed to get sync metadata")
    }

    #[inline]
    pub async fn set(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now_ms())
        .execute(pool)
        .await
        .context("Failed to set sync metadata")?;

        Ok(())
    }

    #[inline]
    pub async fn delete(pool: &SqlitePool, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM sync_metadata WHERE key = ?")
            .bind(key)
            .execute(pool)
            .await
            .context("Failed to delete sync metadata")?;
        Ok(())
    }
}

pub struct CacheMetadataQueries;

impl CacheMetadataQueries {
    #[inline]
    pub async fn touch(
        pool: &SqlitePool,
        key: &str,
        version: &str,
        ttl_ms: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_metadata (key, timestamp, version, ttl_ms) VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                timestamp = excluded.timestamp,
                version = excluded.version,
                ttl_ms = excluded.ttl_ms
            "#,
        )
        .bind(key)
        .bind(now_ms())
        .bind(version)
        .bind(ttl_ms)
        .execute(pool)
        .await
        .context("Failed to touch cache metadata")?;

        Ok(())
    }

    #[inline]
    pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<CacheMetadata>> {
        sqlx::query_as::<_, CacheMetadata>("SELECT * FROM cache_metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await
            .context("Failed to get cache metadata")
    }

    #[inline]
    pub async fn delete(pool: &SqlitePool, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_metadata WHERE key = ?")
            .bind(key)
            .execute(pool)
            .await
            .context("Failed to delete cache metadata")?;
        Ok(())
    }

    #[inline]
    pub async fn delete_prefix(pool: &SqlitePool, prefix: &str) -> Result<u64> {
        let pattern = format!("{prefix}%");
        let result = sqlx::query("DELETE FROM cache_metadata WHERE key LIKE ?")
            .bind(&pattern)
            .execute(pool)
            .await
            .context("Failed to delete cache metadata by prefix")?;
        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn clear(pool: &SqlitePool) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_metadata")
            .execute(pool)
            .await
            .context("Failed to clear cache metadata")?;
        Ok(result.rows_affected())
    }
}

pub struct EmbeddingCacheQueries;

impl EmbeddingCacheQueries {
    #[inline]
    pub async fn get(pool: &SqlitePool, query: &str) -> Result<Option<CachedEmbedding>> {
        sqlx::query_as::<_, CachedEmbedding>("SELECT * FROM embedding_cache WHERE query = ?")
            .bind(query)
            .fetch_optional(pool)
            .await
            .context("Failed to get cached embedding")
    }

    #[inline]
    pub async fn upsert(
        pool: &SqlitePool,
        query: &str,
        embedding_json: &str,
        version: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embedding_cache (query, embedding, timestamp, usage_count, version)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT(query) DO UPDATE SET
                embedding = excluded.embedding,
                timestamp = excluded.timestamp,
                version = excluded.version
            "#,
        )
        .bind(query)
        .bind(embedding_json)
        .bind(now_ms())
        .bind(version)
        .execute(pool)
        .await
        .context("Failed to upsert cached embedding")?;

        Ok(())
    }

    #[inline]
    pub async fn increment_usage(pool: &SqlitePool, query: &str) -> Result<()> {
        sqlx::query("UPDATE embedding_cache SET usage_count = usage_count + 1 WHERE query = ?")
            .bind(query)
            .execute(pool)
            .await
            .context("Failed to increment cache usage count")?;
        Ok(())
    }

    #[inline]
    pub async fn count(pool: &SqlitePool) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(pool)
            .await
            .context("Failed to count cached embeddings")
    }

    /// Drop the `n` oldest entries by timestamp (batch LRU).
    #[inline]
    pub async fn evict_oldest(pool: &SqlitePool, n: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM embedding_cache WHERE query IN \
             (SELECT query FROM embedding_cache ORDER BY timestamp ASC LIMIT ?)",
        )
        .bind(n)
        .execute(pool)
        .await
        .context("Failed to evict cached embeddings")?;

        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn clear(pool: &SqlitePool) -> Result<u64> {
        let result = sqlx::query("DELETE FROM embedding_cache")
            .execute(pool)
            .await
            .context("Failed to clear embedding cache")?;
        Ok(result.rows_affected())
    }

    /// (entry count, oldest timestamp, most-used query).
    #[inline]
    pub async fn stats(pool: &SqlitePool) -> Result<(i64, Option<i64>, Option<String>)> {
        let (count, oldest) = sqlx::query_as::<_, (i64, Option<i64>)>(
            "SELECT COUNT(*), MIN(timestamp) FROM embedding_cache",
        )
        .fetch_one(pool)
        .await
        .context("Failed to aggregate embedding cache stats")?;

        let most_used = sqlx::query_scalar::<_, String>(
            "SELECT query FROM embedding_cache ORDER BY usage_count DESC LIMIT 1",
        )
        .fetch_optional(pool)
        .await
        .context("Failed to get most used cache entry")?;

        Ok((count, oldest, most_used))
    }
}
