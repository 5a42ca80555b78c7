//! Application state for Recall.
//!
//! Contains the shared state that is passed to all handlers.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;

use crate::config::{self, MemorySettings};
use crate::db::DbPool;
use crate::services::{
    ChatCompletion, Embedder, EmbeddingService, LlmService, MemoryService, QdrantService,
    VectorIndex,
};
use crate::Result;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: DbPool,
    /// Memory pipeline facade.
    pub memory: MemoryService,
    /// Embedding provider, possibly unconfigured.
    pub embedder: Arc<dyn Embedder>,
    /// Chat model, possibly unconfigured.
    pub chat: Arc<dyn ChatCompletion>,
    /// Vector store, `None` when not configured.
    pub vectors: Option<Arc<dyn VectorIndex>>,
    /// Prometheus recorder handle, rendered on `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create the application state from the global configuration.
    pub async fn new() -> Result<Self> {
        let config = config::config();

        // Initialize database
        let db = crate::db::init_pool(&config.database.path).await?;
        crate::db::initialize_schema(&db).await?;

        // Optional backends
        let embeddings: Arc<dyn Embedder> =
            Arc::new(EmbeddingService::from_config(&config.embedding)?);
        let llm: Arc<dyn ChatCompletion> = Arc::new(LlmService::new(&config.llm)?);
        let vectors: Option<Arc<dyn VectorIndex>> = match &config.qdrant {
            Some(qdrant) => Some(Arc::new(QdrantService::new(qdrant).await?)),
            None => {
                info!("QDRANT_URL not set - similarity search uses keyword fallback");
                None
            }
        };

        Ok(Self::from_parts(
            db,
            embeddings,
            vectors,
            llm,
            config.memory.clone(),
        ))
    }

    /// Assemble the state from already built parts.
    pub fn from_parts(
        db: DbPool,
        embedder: Arc<dyn Embedder>,
        vectors: Option<Arc<dyn VectorIndex>>,
        chat: Arc<dyn ChatCompletion>,
        settings: MemorySettings,
    ) -> Self {
        let memory = MemoryService::new(
            db.clone(),
            embedder.clone(),
            vectors.clone(),
            chat.clone(),
            settings,
        );

        Self {
            db,
            memory,
            embedder,
            chat,
            vectors,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
