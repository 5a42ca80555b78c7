//! Capability seams for the optional backends.
//!
//! The memory pipeline never fails because a model provider, the embedding
//! provider or the vector store is missing or down. Each capability reports
//! problems as [`Degraded`] and the caller picks its fallback right where the
//! call is made.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;

use recall_embeddings::EmbeddingService;
use recall_llm::{ChatMessage, CompletionOptions, CompletionStream, LlmService, StreamEvent};
use recall_qdrant::{QdrantService, UserSearch};

/// Why a best-effort call produced nothing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Degraded {
    /// The backend is not configured at all.
    #[error("backend not configured")]
    Unavailable,
    /// The backend is configured but the call failed.
    #[error("backend call failed: {0}")]
    Failed(String),
}

impl Degraded {
    /// Short label used for log fields and metric labels.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Failed(_) => "failed",
        }
    }
}

pub type Degradable<T> = std::result::Result<T, Degraded>;

/// Text to vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn is_available(&self) -> bool;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Degradable<Vec<f32>>;
}

/// A point written to a tenant collection.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, Value>,
}

/// Nearest-neighbour query restricted to one user.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub vector: Vec<f32>,
    pub user_id: String,
    pub limit: usize,
    pub score_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, Value>,
}

/// Per-tenant vector collections.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the tenant collection if it does not exist yet.
    async fn ensure_collection(&self, tenant_id: &str, dimension: usize) -> Degradable<()>;

    async fn upsert(&self, tenant_id: &str, point: VectorPoint) -> Degradable<()>;

    async fn search(&self, tenant_id: &str, query: VectorQuery) -> Degradable<Vec<VectorHit>>;

    async fn delete_points(&self, tenant_id: &str, ids: Vec<String>) -> Degradable<()>;
}

/// Chat completion.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Degradable<String>;

    /// Streaming variant. Implementations without native streaming yield
    /// the whole completion as one chunk.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Degradable<CompletionStream> {
        let text = self.complete(messages, options).await?;
        let events = vec![Ok(StreamEvent::Delta(text)), Ok(StreamEvent::Done)];
        Ok(Box::pin(stream::iter(events)))
    }
}

// ============================================================================
// Concrete clients
// ============================================================================

#[async_trait]
impl Embedder for EmbeddingService {
    fn is_available(&self) -> bool {
        self.has_providers()
    }

    fn dimension(&self) -> usize {
        EmbeddingService::dimension(self)
    }

    async fn embed(&self, text: &str) -> Degradable<Vec<f32>> {
        EmbeddingService::embed(self, text).await.map_err(|e| {
            if e.is_not_configured() {
                Degraded::Unavailable
            } else {
                Degraded::Failed(e.to_string())
            }
        })
    }
}

fn vector_degraded(err: recall_qdrant::Error) -> Degraded {
    Degraded::Failed(err.to_string())
}

#[async_trait]
impl VectorIndex for QdrantService {
    async fn ensure_collection(&self, tenant_id: &str, dimension: usize) -> Degradable<()> {
        QdrantService::ensure_collection(self, tenant_id, dimension)
            .await
            .map(|_| ())
            .map_err(vector_degraded)
    }

    async fn upsert(&self, tenant_id: &str, point: VectorPoint) -> Degradable<()> {
        QdrantService::upsert(self, tenant_id, &point.id, point.vector, point.payload)
            .await
            .map_err(vector_degraded)
    }

    async fn search(&self, tenant_id: &str, query: VectorQuery) -> Degradable<Vec<VectorHit>> {
        let results = self
            .search_user(
                tenant_id,
                UserSearch {
                    user_id: &query.user_id,
                    vector: query.vector,
                    limit: query.limit,
                    score_threshold: query.score_threshold,
                },
            )
            .await
            .map_err(vector_degraded)?;

        Ok(results
            .into_iter()
            .map(|r| VectorHit {
                id: r.id,
                score: r.score,
                payload: r.payload,
            })
            .collect())
    }

    async fn delete_points(&self, tenant_id: &str, ids: Vec<String>) -> Degradable<()> {
        QdrantService::delete_points(self, tenant_id, ids)
            .await
            .map_err(vector_degraded)
    }
}

fn llm_degraded(err: recall_llm::Error) -> Degraded {
    match err {
        recall_llm::Error::NoProviders => Degraded::Unavailable,
        other => Degraded::Failed(other.to_string()),
    }
}

#[async_trait]
impl ChatCompletion for LlmService {
    async fn is_available(&self) -> bool {
        LlmService::is_available(self).await
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Degradable<String> {
        LlmService::complete(self, messages, options)
            .await
            .map_err(llm_degraded)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Degradable<CompletionStream> {
        LlmService::stream(self, messages, options)
            .await
            .map_err(llm_degraded)
    }
}
