//! API Routes for Recall
//!
//! This module combines all API routes into a single router.
//! Tenant identity comes from the upstream gateway, see `middleware::tenant`.

mod memories;
pub mod status;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::middleware::require_tenant;
use crate::AppState;

/// Build the API router.
///
/// Route structure:
/// - /memories/* - Memory CRUD, retrieval, context and extraction (tenant headers required)
/// - /health, /metrics - Health and metrics (public)
pub fn routes() -> Router<AppState> {
    Router::new()
        // Health and metrics endpoints (public)
        .merge(status::routes())
        // Tenant-scoped routes
        .nest("/memories", memory_routes())
}

fn memory_routes() -> Router<AppState> {
    memories::routes().layer(axum::middleware::from_fn(require_tenant))
}

/// The complete application: routes, tracing and CORS layers, state.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes())
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state)
}
