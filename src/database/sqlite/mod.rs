use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::{debug, info};

#[cfg(test)]
mod tests;

pub mod models;
pub mod queries;

pub use models::{
    CacheMetadata, CachedEmbedding, EmbeddingRow, NewEmbedding, OfflineQuery, PriorityCounts,
    QueryMetadata, QueryPriority, QueryStatus, QueueStats, ResponseSource, SyncMetadata, now_ms,
};

pub type DbPool = Pool<Sqlite>;

/// Shared handle to the embedded SQLite store. The embeddings table is owned
/// by the vector store and the offline_queries table by the query queue; other
/// components go through those services rather than writing rows directly.
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    #[inline]
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::raw_sql(include_str!("migrations/001_initial_schema.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to run schema migration")?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    #[inline]
    pub async fn initialize_from_data_dir(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("tutor-sync.db");

        std::fs::create_dir_all(data_dir).with_context(|| {
            format!("Failed to create data directory: {}", data_dir.display())
        })?;

        Self::new(db_path).await
    }

    // Sync metadata operations

    #[inline]
    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        Ok(queries::SyncMetadataQueries::get(&self.pool, key)
            .await?
            .map(|m| m.value))
    }

    #[inline]
    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        queries::SyncMetadataQueries::set(&self.pool, key, value).await
    }

    #[inline]
    pub async fn get_metadata_entry(&self, key: &str) -> Result<Option<SyncMetadata>> {
        queries::SyncMetadataQueries::get(&self.pool, key).await
    }

    #[inline]
    pub async fn delete_metadata(&self, key: &str) -> Result<()> {
        queries::SyncMetadataQueries::delete(&self.pool, key).await
    }

    /// Optimize database performance by running VACUUM and ANALYZE.
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        info!("Optimizing database performance");

        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .context("Failed to vacuum database")?;

        sqlx::query("ANALYZE")
            .execute(&self.pool)
            .await
            .context("Failed to analyze database")?;

        debug!("Database optimization completed");
        Ok(())
    }
}
