//! Status Routes
//!
//! Health check and metrics.
//!
//! Routes:
//! - GET /health - Database reachability and backend configuration
//! - GET /metrics - Prometheus metrics endpoint

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::{db, AppState};

/// Build status routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub components: Components,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
    Unconfigured,
}

#[derive(Debug, Serialize)]
pub struct Components {
    pub database: ComponentStatus,
    pub vector_store: ComponentStatus,
    pub embeddings: ComponentStatus,
    pub llm: ComponentStatus,
}

impl Components {
    fn overall(&self) -> HealthStatus {
        if self.database != ComponentStatus::Up {
            return HealthStatus::Unhealthy;
        }
        let optional = [self.vector_store, self.embeddings, self.llm];
        if optional.iter().all(|c| *c == ComponentStatus::Up) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check.
///
/// GET /health
///
/// Returns 503 only when the database is unreachable; missing optional
/// backends report `degraded` since every feature has a fallback.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match db::health_check(&state.db).await {
        Ok(()) => ComponentStatus::Up,
        Err(e) => {
            warn!(error = %e, "Database health check failed");
            ComponentStatus::Down
        }
    };

    let vector_store = if state.vectors.is_some() {
        ComponentStatus::Up
    } else {
        ComponentStatus::Unconfigured
    };

    let embeddings = if state.embedder.is_available() {
        ComponentStatus::Up
    } else {
        ComponentStatus::Unconfigured
    };

    let llm = if state.chat.is_available().await {
        ComponentStatus::Up
    } else {
        ComponentStatus::Unconfigured
    };

    let components = Components {
        database,
        vector_store,
        embeddings,
        llm,
    };
    let status = components.overall();
    let code = if status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION").into(),
            timestamp: Utc::now(),
            components,
        }),
    )
}

/// Prometheus metrics.
///
/// GET /metrics
async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}
