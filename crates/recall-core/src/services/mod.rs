//! Service layer for Recall.
//!
//! - Capabilities (chat, embedder and vector index seams, with degradation)
//! - Store (tenant-scoped memory records with ownership checks)
//! - Index (embedding index adapter with keyword fallback)
//! - Retriever (hybrid subject + similarity search)
//! - Context (budgeted prompt block and citation matching)
//! - Extraction (fact extraction and deduplication)
//! - EmbeddingQueue (background embedding worker)
//! - Memory (facade over all of the above)

pub mod capabilities;
pub mod context;
pub mod embedding_queue;
pub mod extraction;
pub mod index;
mod memory;
pub mod retriever;
pub mod store;

pub use capabilities::{
    ChatCompletion, Degradable, Degraded, Embedder, VectorHit, VectorIndex, VectorPoint,
    VectorQuery,
};
pub use context::ContextAssembler;
pub use embedding_queue::{EmbeddingJob, EmbeddingQueue};
pub use extraction::ExtractionPipeline;
pub use index::{EmbeddingIndex, PointMetadata};
pub use memory::MemoryService;
pub use retriever::HybridRetriever;
pub use store::{Forgotten, MemoryStore, FORGET_CONFIRMATION};

pub use recall_embeddings::EmbeddingService;
pub use recall_llm::LlmService;
pub use recall_qdrant::QdrantService;
