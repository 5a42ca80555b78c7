//! Memories Routes
//!
//! CRUD, retrieval, context assembly and extraction for the memories of the
//! calling user.
//!
//! Routes:
//! - GET /memories - List memories
//! - POST /memories - Create a memory the user stated
//! - GET /memories/:id - Get a memory
//! - PUT /memories/:id - Correct a memory
//! - DELETE /memories/:id - Delete a memory
//! - POST /memories/forget - Delete every memory of the user
//! - POST /memories/search - Hybrid search
//! - POST /memories/context - Build the prompt context for a query
//! - POST /memories/attributions - Match citations in a model response
//! - POST /memories/extract - Extract memories from a conversation window

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

use recall_models::{
    Attribution, ConversationTurn, ExtractOptions, ExtractedFact, MemoryContext, MemoryFilter,
    MemoryRecord, MemorySource, MemoryType, MemoryUpdate, NewMemory, SearchResult,
};

use crate::middleware::TenantContext;
use crate::{AppState, Error, Result};

/// Upper bound on search results per request.
const MAX_SEARCH_LIMIT: usize = 50;

/// Build memory routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_memories).post(create_memory))
        .route("/forget", post(forget_all))
        .route("/search", post(search_memories))
        .route("/context", post(build_context))
        .route("/attributions", post(match_attributions))
        .route("/extract", post(extract_memories))
        .route(
            "/:memory_id",
            get(get_memory).put(update_memory).delete(delete_memory),
        )
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to create a memory.
#[derive(Debug, Deserialize)]
pub struct CreateMemoryRequest {
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub content: String,
    pub subject: Option<String>,
    pub confidence: Option<f64>,
    pub source_message_id: Option<String>,
}

/// List memories response.
#[derive(Debug, Serialize)]
pub struct ListMemoriesResponse {
    pub memories: Vec<MemoryRecord>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

#[derive(Debug, Deserialize)]
pub struct ForgetRequest {
    pub confirmation: String,
}

#[derive(Debug, Serialize)]
pub struct ForgetResponse {
    pub deleted: u64,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    10
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct ContextRequest {
    pub query: String,
    /// System prompt to inject the context into
    pub base_prompt: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ContextResponse {
    #[serde(flatten)]
    pub context: MemoryContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AttributionsRequest {
    /// Model response to scan for citations
    pub response: String,
    /// Attributions offered with the context
    #[serde(default)]
    pub offered: Vec<Attribution>,
}

#[derive(Debug, Serialize)]
pub struct AttributionsResponse {
    pub attributions: Vec<Attribution>,
}

#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    pub messages: Vec<ConversationTurn>,
    #[serde(flatten)]
    pub options: ExtractOptions,
}

#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    pub facts: Vec<ExtractedFact>,
}

fn require_text(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// List memories of the caller.
///
/// GET /memories
async fn list_memories(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Query(filter): Query<MemoryFilter>,
) -> Result<Json<ListMemoriesResponse>> {
    let page = state
        .memory
        .list(&ctx.tenant_id, &ctx.user_id, &filter)
        .await?;

    Ok(Json(ListMemoriesResponse {
        memories: page.records,
        total: page.total,
        offset: filter.effective_offset(),
        limit: filter.effective_limit(),
    }))
}

/// Create a memory stated by the user.
///
/// POST /memories
async fn create_memory(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(request): Json<CreateMemoryRequest>,
) -> Result<(StatusCode, Json<MemoryRecord>)> {
    let input = NewMemory {
        memory_type: request.memory_type,
        source: MemorySource::UserStated,
        content: request.content,
        subject: request.subject,
        confidence: request.confidence,
        source_message_id: request.source_message_id,
    };

    let record = state
        .memory
        .remember(&ctx.tenant_id, &ctx.user_id, input)
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /memories/:memory_id
async fn get_memory(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(memory_id): Path<String>,
) -> Result<Json<MemoryRecord>> {
    let record = state
        .memory
        .get(&ctx.tenant_id, &memory_id, &ctx.user_id)
        .await?;
    Ok(Json(record))
}

/// Correct a memory.
///
/// PUT /memories/:memory_id
async fn update_memory(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(memory_id): Path<String>,
    Json(request): Json<MemoryUpdate>,
) -> Result<Json<MemoryRecord>> {
    let record = state
        .memory
        .update(&ctx.tenant_id, &memory_id, &ctx.user_id, &request)
        .await?;
    Ok(Json(record))
}

/// DELETE /memories/:memory_id
async fn delete_memory(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(memory_id): Path<String>,
) -> Result<Json<MemoryRecord>> {
    let record = state
        .memory
        .delete(&ctx.tenant_id, &memory_id, &ctx.user_id)
        .await?;
    Ok(Json(record))
}

/// Forget everything about the caller.
///
/// POST /memories/forget
async fn forget_all(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(request): Json<ForgetRequest>,
) -> Result<Json<ForgetResponse>> {
    let deleted = state
        .memory
        .forget_all(&ctx.tenant_id, &ctx.user_id, &request.confirmation)
        .await?;
    Ok(Json(ForgetResponse { deleted }))
}

/// POST /memories/search
async fn search_memories(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    require_text(&request.query, "query")?;

    let limit = request.limit.clamp(1, MAX_SEARCH_LIMIT);
    let results = state
        .memory
        .search(&ctx.tenant_id, &ctx.user_id, &request.query, limit)
        .await;

    Ok(Json(SearchResponse {
        results,
        query: request.query,
    }))
}

/// POST /memories/context
async fn build_context(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(request): Json<ContextRequest>,
) -> Result<Json<ContextResponse>> {
    require_text(&request.query, "query")?;

    let context = state
        .memory
        .build_context(&request.query, &ctx.user_id, &ctx.tenant_id)
        .await;
    let prompt = request
        .base_prompt
        .as_deref()
        .map(|base| state.memory.inject_into_prompt(base, &context));

    Ok(Json(ContextResponse { context, prompt }))
}

/// POST /memories/attributions
async fn match_attributions(
    State(state): State<AppState>,
    Json(request): Json<AttributionsRequest>,
) -> Json<AttributionsResponse> {
    let attributions = state
        .memory
        .match_attributions(&request.response, &request.offered);
    Json(AttributionsResponse { attributions })
}

/// POST /memories/extract
async fn extract_memories(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(request): Json<ExtractRequest>,
) -> Json<ExtractResponse> {
    let facts = state
        .memory
        .extract(&request.messages, &ctx.user_id, &ctx.tenant_id, &request.options)
        .await;
    Json(ExtractResponse { facts })
}
