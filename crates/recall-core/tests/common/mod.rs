//! Common test utilities and helpers.
//!
//! In-process fakes of the chat model, the embedder and the vector store,
//! plus helpers for driving the router.

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use axum_test::TestServer;
use serde_json::Value;

use recall::config::MemorySettings;
use recall::db::{init_pool, initialize_schema};
use recall::middleware::{TENANT_HEADER, USER_HEADER};
use recall::services::{
    ChatCompletion, Degradable, Degraded, Embedder, VectorHit, VectorIndex, VectorPoint,
    VectorQuery,
};
use recall::AppState;
use recall_llm::{ChatMessage, CompletionOptions};

pub const TENANT: &str = "acme-agency";
pub const USER: &str = "user-1";

// ============================================================================
// Fakes
// ============================================================================

/// Hashed bag-of-words embedding; identical word sets embed identically.
pub struct FakeEmbedder {
    pub dimension: usize,
    pub available: bool,
    pub fail: AtomicBool,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self {
            dimension: 256,
            available: true,
            fail: AtomicBool::new(false),
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn is_available(&self) -> bool {
        self.available
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Degradable<Vec<f32>> {
        if !self.available {
            return Err(Degraded::Unavailable);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Degraded::Failed("embedding provider down".into()));
        }

        let mut vector = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            vector[(hasher.finish() as usize) % self.dimension] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}

/// In-memory vector store with cosine similarity.
#[derive(Default)]
pub struct FakeVectorIndex {
    collections: Mutex<HashMap<String, Vec<VectorPoint>>>,
    pub deleted: Mutex<Vec<String>>,
    pub fail: AtomicBool,
    /// Fixed scores for points, replacing their cosine similarity
    pinned: Mutex<HashMap<String, f32>>,
}

impl FakeVectorIndex {
    pub fn point_ids(&self, tenant_id: &str) -> Vec<String> {
        self.collections
            .lock()
            .unwrap()
            .get(tenant_id)
            .map(|points| points.iter().map(|p| p.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Make `point_id` score `score` against every query.
    pub fn pin_score(&self, point_id: &str, score: f32) {
        self.pinned.lock().unwrap().insert(point_id.to_string(), score);
    }

    fn check(&self) -> Degradable<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Degraded::Failed("vector store down".into()));
        }
        Ok(())
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorIndex for FakeVectorIndex {
    async fn ensure_collection(&self, tenant_id: &str, _dimension: usize) -> Degradable<()> {
        self.check()?;
        self.collections
            .lock()
            .unwrap()
            .entry(tenant_id.to_string())
            .or_default();
        Ok(())
    }

    async fn upsert(&self, tenant_id: &str, point: VectorPoint) -> Degradable<()> {
        self.check()?;
        let mut collections = self.collections.lock().unwrap();
        let points = collections
            .get_mut(tenant_id)
            .ok_or_else(|| Degraded::Failed("collection missing".into()))?;
        points.retain(|p| p.id != point.id);
        points.push(point);
        Ok(())
    }

    async fn search(&self, tenant_id: &str, query: VectorQuery) -> Degradable<Vec<VectorHit>> {
        self.check()?;
        let collections = self.collections.lock().unwrap();
        let points = collections
            .get(tenant_id)
            .ok_or_else(|| Degraded::Failed("collection missing".into()))?;
        let pinned = self.pinned.lock().unwrap();

        let mut hits: Vec<VectorHit> = points
            .iter()
            .filter(|p| p.payload.get("user_id").and_then(Value::as_str) == Some(query.user_id.as_str()))
            .map(|p| VectorHit {
                id: p.id.clone(),
                score: pinned
                    .get(&p.id)
                    .copied()
                    .unwrap_or_else(|| cosine(&p.vector, &query.vector)),
                payload: p.payload.clone(),
            })
            .filter(|h| h.score >= query.score_threshold)
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn delete_points(&self, tenant_id: &str, ids: Vec<String>) -> Degradable<()> {
        self.check()?;
        if let Some(points) = self.collections.lock().unwrap().get_mut(tenant_id) {
            points.retain(|p| !ids.contains(&p.id));
        }
        self.deleted.lock().unwrap().extend(ids);
        Ok(())
    }
}

/// Chat model returning a canned answer and counting calls.
pub struct FakeChat {
    pub available: bool,
    pub response: Mutex<String>,
    pub calls: AtomicUsize,
    pub last_messages: Mutex<Vec<ChatMessage>>,
}

impl FakeChat {
    pub fn answering(response: impl Into<String>) -> Self {
        Self {
            available: true,
            response: Mutex::new(response.into()),
            calls: AtomicUsize::new(0),
            last_messages: Mutex::new(Vec::new()),
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            available: false,
            ..Self::answering("[]")
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatCompletion for FakeChat {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Degradable<String> {
        if !self.available {
            return Err(Degraded::Unavailable);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().unwrap() = messages.to_vec();
        Ok(self.response.lock().unwrap().clone())
    }
}

// ============================================================================
// State
// ============================================================================

pub struct TestApp {
    pub state: AppState,
    pub embedder: Arc<FakeEmbedder>,
    pub vectors: Option<Arc<FakeVectorIndex>>,
    pub chat: Arc<FakeChat>,
}

impl TestApp {
    /// Wait for queued embeddings to be attached.
    pub async fn settle(&self) {
        self.state.memory.queue().wait_idle().await;
    }
}

/// Every backend faked and available.
pub async fn full_app(chat: FakeChat) -> TestApp {
    build_app(FakeEmbedder::new(), Some(FakeVectorIndex::default()), chat).await
}

/// No vector store, no embedder, no chat model.
pub async fn bare_app() -> TestApp {
    build_app(FakeEmbedder::unconfigured(), None, FakeChat::unconfigured()).await
}

pub async fn build_app(
    embedder: FakeEmbedder,
    vectors: Option<FakeVectorIndex>,
    chat: FakeChat,
) -> TestApp {
    let db = init_pool(":memory:").await.expect("in-memory pool");
    initialize_schema(&db).await.expect("schema");

    let embedder = Arc::new(embedder);
    let vectors = vectors.map(Arc::new);
    let chat = Arc::new(chat);

    let state = AppState::from_parts(
        db,
        embedder.clone(),
        vectors
            .clone()
            .map(|v| v as Arc<dyn VectorIndex>),
        chat.clone(),
        MemorySettings::default(),
    );

    TestApp {
        state,
        embedder,
        vectors,
        chat,
    }
}

// ============================================================================
// HTTP helpers
// ============================================================================

/// Serve the full application, layers included.
pub fn test_server(app: &TestApp) -> TestServer {
    TestServer::new(recall::api::app(app.state.clone())).expect("Failed to create test server")
}

/// Header pair naming the tenant a request acts for.
pub fn tenant_header(tenant: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static(TENANT_HEADER),
        HeaderValue::from_str(tenant).unwrap(),
    )
}

/// Header pair naming the user a request acts for.
pub fn user_header(user: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static(USER_HEADER),
        HeaderValue::from_str(user).unwrap(),
    )
}
