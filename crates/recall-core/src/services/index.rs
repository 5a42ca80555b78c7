//! Embedding index adapter.
//!
//! Keeps the vector collections in step with the memory table and answers
//! similarity queries. Every failure of the embedder or the vector store is
//! absorbed here: writes get a local placeholder id, searches fall back to
//! keyword lookup over the memory table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use recall_models::{MemoryRecord, MemoryType, SearchResult};
use recall_qdrant::{
    KEY_CONTENT, KEY_CREATED_AT, KEY_MEMORY_ID, KEY_SUBJECT, KEY_TYPE, KEY_USER_ID,
};
use serde_json::{json, Value};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::capabilities::{Degradable, Degraded, Embedder, VectorIndex, VectorPoint, VectorQuery};
use crate::db::{self, DbPool};

/// Prefix of embedding ids minted when nothing reached the vector store.
pub const PLACEHOLDER_PREFIX: &str = "local_";

/// Score of the first keyword-fallback hit; each later rank loses
/// [`FALLBACK_SCORE_STEP`].
pub const FALLBACK_TOP_SCORE: f32 = 0.9;
pub const FALLBACK_SCORE_STEP: f32 = 0.05;

/// Metadata stored next to a vector.
#[derive(Debug, Clone)]
pub struct PointMetadata {
    pub user_id: String,
    pub memory_type: MemoryType,
    pub subject: Option<String>,
}

pub fn placeholder_embedding_id() -> String {
    format!("{}{}", PLACEHOLDER_PREFIX, Uuid::new_v4().simple())
}

pub fn is_placeholder(embedding_id: &str) -> bool {
    embedding_id.starts_with(PLACEHOLDER_PREFIX)
}

/// Synthetic score for the `rank`-th keyword hit.
pub fn fallback_score(rank: usize) -> f32 {
    (FALLBACK_TOP_SCORE - FALLBACK_SCORE_STEP * rank as f32).max(0.0)
}

#[derive(Clone)]
pub struct EmbeddingIndex {
    inner: Arc<EmbeddingIndexInner>,
}

struct EmbeddingIndexInner {
    db: DbPool,
    embedder: Arc<dyn Embedder>,
    vectors: Option<Arc<dyn VectorIndex>>,
}

impl EmbeddingIndex {
    /// `vectors` is `None` when no vector store is configured.
    pub fn new(
        db: DbPool,
        embedder: Arc<dyn Embedder>,
        vectors: Option<Arc<dyn VectorIndex>>,
    ) -> Self {
        Self {
            inner: Arc::new(EmbeddingIndexInner {
                db,
                embedder,
                vectors,
            }),
        }
    }

    /// Whether a vector store is configured at all.
    pub fn has_vector_store(&self) -> bool {
        self.inner.vectors.is_some()
    }

    /// Make sure the tenant collection exists. No-op without a vector store.
    pub async fn ensure_collection(&self, tenant_id: &str) -> Degradable<()> {
        match &self.inner.vectors {
            Some(vectors) => {
                vectors
                    .ensure_collection(tenant_id, self.inner.embedder.dimension())
                    .await
            }
            None => Ok(()),
        }
    }

    /// Embed `content` and store it under a fresh point id.
    ///
    /// Always yields an embedding id: when the embedder or the vector store
    /// is unavailable or fails, a placeholder id is returned instead.
    pub async fn embed_and_store(
        &self,
        tenant_id: &str,
        memory_id: &str,
        content: &str,
        metadata: &PointMetadata,
    ) -> String {
        match self
            .try_embed_and_store(tenant_id, memory_id, content, metadata)
            .await
        {
            Ok(point_id) => {
                debug!(tenant_id = %tenant_id, memory_id = %memory_id, point_id = %point_id, "Stored embedding");
                point_id
            }
            Err(degraded) => {
                let placeholder = placeholder_embedding_id();
                match &degraded {
                    Degraded::Unavailable => debug!(
                        tenant_id = %tenant_id,
                        memory_id = %memory_id,
                        "Vector backend unavailable, using placeholder embedding id"
                    ),
                    Degraded::Failed(e) => warn!(
                        tenant_id = %tenant_id,
                        memory_id = %memory_id,
                        error = %e,
                        "Embedding failed, using placeholder embedding id"
                    ),
                }
                metrics::counter!("recall_embedding_placeholder_total", "reason" => degraded.reason())
                    .increment(1);
                placeholder
            }
        }
    }

    async fn try_embed_and_store(
        &self,
        tenant_id: &str,
        memory_id: &str,
        content: &str,
        metadata: &PointMetadata,
    ) -> Degradable<String> {
        let vectors = self.inner.vectors.as_ref().ok_or(Degraded::Unavailable)?;
        let vector = self.inner.embedder.embed(content).await?;

        vectors
            .ensure_collection(tenant_id, self.inner.embedder.dimension())
            .await?;

        let point_id = Uuid::new_v4().to_string();
        let payload = point_payload(memory_id, content, metadata);

        vectors
            .upsert(
                tenant_id,
                VectorPoint {
                    id: point_id.clone(),
                    vector,
                    payload,
                },
            )
            .await?;

        Ok(point_id)
    }

    /// Nearest memories of one user, best first.
    ///
    /// Falls back to keyword lookup (synthetic scores from 0.9 down) when
    /// the vector path is unavailable or fails.
    pub async fn similarity_search(
        &self,
        tenant_id: &str,
        user_id: &str,
        query: &str,
        limit: usize,
        score_threshold: f32,
    ) -> Vec<SearchResult> {
        match self
            .vector_search(tenant_id, user_id, query, limit, score_threshold)
            .await
        {
            Ok(results) => results,
            Err(degraded) => {
                match &degraded {
                    Degraded::Unavailable => debug!(
                        tenant_id = %tenant_id,
                        "Vector search unavailable, using keyword fallback"
                    ),
                    Degraded::Failed(e) => warn!(
                        tenant_id = %tenant_id,
                        error = %e,
                        "Vector search failed, using keyword fallback"
                    ),
                }
                metrics::counter!("recall_vector_fallback_total", "reason" => degraded.reason())
                    .increment(1);
                self.keyword_fallback(tenant_id, user_id, query, limit).await
            }
        }
    }

    async fn vector_search(
        &self,
        tenant_id: &str,
        user_id: &str,
        query: &str,
        limit: usize,
        score_threshold: f32,
    ) -> Degradable<Vec<SearchResult>> {
        let vectors = self.inner.vectors.as_ref().ok_or(Degraded::Unavailable)?;
        let vector = self.inner.embedder.embed(query).await?;

        let hits = vectors
            .search(
                tenant_id,
                VectorQuery {
                    vector,
                    user_id: user_id.to_string(),
                    limit,
                    score_threshold,
                },
            )
            .await?;

        // Best score per memory; stale points of re-embedded memories lose
        let mut seen = HashSet::new();
        let scored: Vec<(String, f32)> = hits
            .into_iter()
            .filter(|hit| hit.score >= score_threshold)
            .filter_map(|hit| {
                hit.payload
                    .get(KEY_MEMORY_ID)
                    .and_then(Value::as_str)
                    .map(|id| (id.to_string(), hit.score))
            })
            .filter(|(id, _)| seen.insert(id.clone()))
            .collect();

        if scored.is_empty() {
            return Ok(Vec::new());
        }

        // The vector payload may be stale; the memory table is the truth
        let ids: Vec<String> = scored.iter().map(|(id, _)| id.clone()).collect();
        let records = db::get_active_memories_by_ids(&self.inner.db, tenant_id, user_id, &ids)
            .await
            .map_err(|e| Degraded::Failed(e.to_string()))?;
        let mut by_id: HashMap<String, MemoryRecord> =
            records.into_iter().map(|r| (r.id.clone(), r)).collect();

        Ok(scored
            .into_iter()
            .filter_map(|(id, score)| by_id.remove(&id).map(|r| to_result(r, score)))
            .take(limit)
            .collect())
    }

    async fn keyword_fallback(
        &self,
        tenant_id: &str,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Vec<SearchResult> {
        match db::find_relevant_memories(&self.inner.db, tenant_id, user_id, query, limit as i64)
            .await
        {
            Ok(records) => records
                .into_iter()
                .enumerate()
                .map(|(rank, r)| to_result(r, fallback_score(rank)))
                .collect(),
            Err(e) => {
                error!(tenant_id = %tenant_id, error = %e, "Keyword fallback failed");
                Vec::new()
            }
        }
    }

    /// Remove a point. Best-effort: failures are only logged.
    pub async fn delete(&self, tenant_id: &str, embedding_id: &str) {
        self.delete_many(tenant_id, vec![embedding_id.to_string()])
            .await;
    }

    /// Remove several points. Placeholder ids are skipped.
    pub async fn delete_many(&self, tenant_id: &str, embedding_ids: Vec<String>) {
        let Some(vectors) = &self.inner.vectors else {
            return;
        };

        let ids: Vec<String> = embedding_ids
            .into_iter()
            .filter(|id| !is_placeholder(id))
            .collect();
        if ids.is_empty() {
            return;
        }

        let count = ids.len();
        if let Err(e) = vectors.delete_points(tenant_id, ids).await {
            warn!(tenant_id = %tenant_id, count, error = %e, "Failed to delete vector points");
        }
    }
}

fn point_payload(memory_id: &str, content: &str, metadata: &PointMetadata) -> HashMap<String, Value> {
    let mut payload = HashMap::new();
    payload.insert(KEY_MEMORY_ID.to_string(), json!(memory_id));
    payload.insert(KEY_USER_ID.to_string(), json!(metadata.user_id));
    payload.insert(KEY_TYPE.to_string(), json!(metadata.memory_type.as_str()));
    if let Some(subject) = &metadata.subject {
        payload.insert(KEY_SUBJECT.to_string(), json!(subject));
    }
    payload.insert(KEY_CONTENT.to_string(), json!(content));
    payload.insert(
        KEY_CREATED_AT.to_string(),
        json!(recall_models::now().to_rfc3339()),
    );
    payload
}

fn to_result(record: MemoryRecord, score: f32) -> SearchResult {
    SearchResult {
        memory_id: record.id,
        score,
        content: record.content,
        subject: record.subject.filter(|s| !s.trim().is_empty()),
        memory_type: record.memory_type,
    }
}
