// Local vector store: persisted embeddings plus brute-force cosine search.
// Scoring is kept separate from storage access so an ANN index could replace
// the scan without changing the public contract.


use anyhow::Result;
use tracing::{debug, warn};

use crate::SyncError;
use crate::database::Database;
use crate::database::sqlite::queries::EmbeddingQueries;
use crate::database::sqlite::{EmbeddingRow, NewEmbedding};

/// Fixed dimension of every stored and queried vector (all-MiniLM-L6-v2).
pub const EMBEDDING_DIMENSION: usize = 384;

/// True iff the vector has exactly the expected number of elements.
#[inline]
pub fn validate_dimensions(vector: &[f32]) -> bool {
    vector.len() == EMBEDDING_DIMENSION
}

/// Cosine similarity between two vectors. Zero-magnitude or length-mismatched
/// inputs score 0 rather than producing NaN.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut mag_a = 0.0f64;
    let mut mag_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }

    let denom = mag_a.sqrt() * mag_b.sqrt();
    if denom == 0.0 { 0.0 } else { (dot / denom) as f32 }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub source: Option<String>,
    pub chapter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    pub min_score: f32,
    pub filter: Option<SearchFilter>,
}

impl Default for SearchOptions {
    #[inline]
    fn default() -> Self {
        Self {
            top_k: 10,
            min_score: 0.0,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMatch {
    pub id: String,
    pub score: f32,
    pub content: String,
    pub source: Option<String>,
    pub chapter: Option<String>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Persistent collection of embedding records. Exclusive owner of the
/// embeddings table; the download manager and quota manager go through this
/// service (or the quota manager's eviction API) rather than raw rows.
#[derive(Debug, Clone)]
pub struct VectorStore {
    database: Database,
}

impl VectorStore {
    #[inline]
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// Persist a batch of embeddings as one transaction. Every vector must
    /// pass the dimension invariant; the whole batch is rejected otherwise.
    #[inline]
    pub async fn insert_batch(&self, batch: Vec<NewEmbedding>) -> Result<Vec<String>> {
        for embedding in &batch {
            if !validate_dimensions(&embedding.vector) {
                return Err(SyncError::Integrity(format!(
                    "Invalid embedding dimensions: {}, expected {}",
                    embedding.vector.len(),
                    EMBEDDING_DIMENSION
                ))
                .into());
            }
        }

        EmbeddingQueries::create_batch(self.database.pool(), batch).await
    }

    #[inline]
    pub async fn count(&self) -> Result<i64> {
        EmbeddingQueries::count(self.database.pool()).await
    }

    #[inline]
    pub async fn clear(&self) -> Result<u64> {
        EmbeddingQueries::delete_all(self.database.pool()).await
    }

    /// Rank the stored corpus against a query vector. Results are sorted by
    /// descending score, truncated to `top_k`, and exclude anything scoring
    /// below `min_score`.
    #[inline]
    pub async fn search(&self, query: &[f32], options: &SearchOptions) -> Result<Vec<ScoredMatch>> {
        let (source, chapter) = options
            .filter
            .as_ref()
            .map_or((None, None), |f| (f.source.as_deref(), f.chapter.as_deref()));

        let rows =
            EmbeddingQueries::list_filtered(self.database.pool(), source, chapter).await?;

        if rows.is_empty() {
            debug!("No embeddings available for search");
            return Ok(Vec::new());
        }

        let mut results = score_candidates(query, &rows);
        results.retain(|m| m.score >= options.min_score);
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(options.top_k);

        Ok(results)
    }
}

/// The O(n * d) scoring step, isolated from storage and result shaping.
fn score_candidates(query: &[f32], rows: &[EmbeddingRow]) -> Vec<ScoredMatch> {
    rows.iter()
        .filter_map(|row| {
            let vector = match row.vector() {
                Ok(v) => v,
                Err(e) => {
                    warn!("Skipping undecodable embedding {}: {}", row.id, e);
                    return None;
                }
            };
            Some(ScoredMatch {
                id: row.id.clone(),
                score: cosine_similarity(query, &vector),
                content: row.content.clone(),
                source: row.source.clone(),
                chapter: row.chapter.clone(),
                metadata: row.metadata_map(),
            })
        })
        .collect()
}
