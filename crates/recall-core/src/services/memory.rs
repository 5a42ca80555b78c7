//! Memory Service.
//!
//! Single entry point used by the HTTP layer and by embedders of the
//! library. Ties the store to the vector index: writes queue an embedding,
//! corrections re-embed and deletions clean their vector points up.

use std::sync::Arc;

use recall_models::{
    Attribution, ConversationTurn, ExtractOptions, ExtractedFact, MemoryContext, MemoryFilter,
    MemoryPage, MemoryRecord, MemorySource, MemoryUpdate, NewMemory, SearchResult,
};
use tracing::debug;

use super::capabilities::{ChatCompletion, Embedder, VectorIndex};
use super::context::{self, ContextAssembler};
use super::embedding_queue::{EmbeddingJob, EmbeddingQueue};
use super::extraction::ExtractionPipeline;
use super::index::EmbeddingIndex;
use super::retriever::HybridRetriever;
use super::store::MemoryStore;
use crate::config::MemorySettings;
use crate::db::DbPool;
use crate::Result;

#[derive(Clone)]
pub struct MemoryService {
    store: MemoryStore,
    index: EmbeddingIndex,
    retriever: HybridRetriever,
    assembler: ContextAssembler,
    extraction: ExtractionPipeline,
    queue: EmbeddingQueue,
}

impl MemoryService {
    /// Wire the pipeline together and start the embedding worker.
    pub fn new(
        db: DbPool,
        embedder: Arc<dyn Embedder>,
        vectors: Option<Arc<dyn VectorIndex>>,
        chat: Arc<dyn ChatCompletion>,
        settings: MemorySettings,
    ) -> Self {
        let store = MemoryStore::new(db.clone());
        let index = EmbeddingIndex::new(db.clone(), embedder, vectors);
        let queue = EmbeddingQueue::start(index.clone(), db.clone());
        let retriever = HybridRetriever::new(db.clone(), index.clone(), settings.score_threshold);
        let assembler = ContextAssembler::new(
            retriever.clone(),
            settings.token_budget,
            settings.context_candidates,
        );
        let extraction = ExtractionPipeline::new(db, chat, queue.clone(), settings);

        Self {
            store,
            index,
            retriever,
            assembler,
            extraction,
            queue,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn index(&self) -> &EmbeddingIndex {
        &self.index
    }

    pub fn queue(&self) -> &EmbeddingQueue {
        &self.queue
    }

    /// Store a memory and queue its embedding.
    pub async fn create(
        &self,
        tenant_id: &str,
        user_id: &str,
        input: NewMemory,
    ) -> Result<MemoryRecord> {
        let record = self.store.create(tenant_id, user_id, input).await?;
        self.queue.enqueue(EmbeddingJob::for_record(&record));
        Ok(record)
    }

    /// Store a memory the user stated directly.
    pub async fn remember(
        &self,
        tenant_id: &str,
        user_id: &str,
        mut input: NewMemory,
    ) -> Result<MemoryRecord> {
        input.source = MemorySource::UserStated;
        self.create(tenant_id, user_id, input).await
    }

    pub async fn get(&self, tenant_id: &str, memory_id: &str, user_id: &str) -> Result<MemoryRecord> {
        self.store.get(tenant_id, memory_id, user_id).await
    }

    pub async fn list(
        &self,
        tenant_id: &str,
        user_id: &str,
        filter: &MemoryFilter,
    ) -> Result<MemoryPage> {
        self.store.list(tenant_id, user_id, filter).await
    }

    /// Apply a user correction and re-embed the new content. The point of
    /// the old content is removed once the new one is attached.
    pub async fn update(
        &self,
        tenant_id: &str,
        memory_id: &str,
        user_id: &str,
        input: &MemoryUpdate,
    ) -> Result<MemoryRecord> {
        let previous = self.store.get(tenant_id, memory_id, user_id).await?;
        let record = self.store.update(tenant_id, memory_id, user_id, input).await?;

        self.queue
            .enqueue(EmbeddingJob::for_record(&record).replacing(previous.embedding_id));

        Ok(record)
    }

    /// Soft-delete a memory and drop its vector point.
    pub async fn delete(
        &self,
        tenant_id: &str,
        memory_id: &str,
        user_id: &str,
    ) -> Result<MemoryRecord> {
        let record = self.store.soft_delete(tenant_id, memory_id, user_id).await?;
        if let Some(embedding_id) = &record.embedding_id {
            self.index.delete(tenant_id, embedding_id).await;
        }
        Ok(record)
    }

    /// Forget everything about a user. Returns how many memories were
    /// deleted.
    pub async fn forget_all(&self, tenant_id: &str, user_id: &str, confirmation: &str) -> Result<u64> {
        let forgotten = self.store.forget_all(tenant_id, user_id, confirmation).await?;
        self.index
            .delete_many(tenant_id, forgotten.embedding_ids)
            .await;
        Ok(forgotten.count)
    }

    pub async fn search(
        &self,
        tenant_id: &str,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Vec<SearchResult> {
        self.retriever
            .hybrid_search(tenant_id, user_id, query, limit)
            .await
    }

    pub async fn build_context(&self, query: &str, user_id: &str, tenant_id: &str) -> MemoryContext {
        self.assembler.build_context(query, user_id, tenant_id).await
    }

    pub fn inject_into_prompt(&self, base_prompt: &str, context: &MemoryContext) -> String {
        context::inject_into_prompt(base_prompt, context)
    }

    pub fn match_attributions(&self, response: &str, offered: &[Attribution]) -> Vec<Attribution> {
        context::match_attributions(response, offered)
    }

    pub async fn extract(
        &self,
        window: &[ConversationTurn],
        user_id: &str,
        tenant_id: &str,
        options: &ExtractOptions,
    ) -> Vec<ExtractedFact> {
        let facts = self
            .extraction
            .extract_memories(window, user_id, tenant_id, options)
            .await;
        debug!(tenant_id = %tenant_id, facts = facts.len(), "Extraction finished");
        facts
    }
}
