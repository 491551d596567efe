//! HTTP router for the blocklist server

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Extension, Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::debug;

use super::auth::{EndpointGuard, guard_middleware};
use crate::blocklist::{RenderOptions, content_type, render};
use crate::config::{BlocklistConfig, BlocklistFormat};
use crate::decision::{DecisionCache, SyncTracker};
use crate::Result;

/// Shared state for handlers
pub struct AppState {
    /// Mirrored decisions
    pub cache: Arc<DecisionCache>,
    /// Outcome of the background sync
    pub sync: Arc<SyncTracker>,
    /// Authentication mode towards the authority (`cert` / `api_key`)
    pub auth_mode: &'static str,
}

/// Format served by one blocklist route
#[derive(Debug, Clone, Copy)]
struct Endpoint {
    format: BlocklistFormat,
}

/// Create the router
///
/// # Errors
///
/// Returns `Error::Config` if an endpoint's access rule cannot be resolved.
pub fn create_router(state: Arc<AppState>, blocklists: &[BlocklistConfig]) -> Result<Router> {
    let mut router = Router::new().route("/health", get(health_handler));

    for list in blocklists {
        let guard = Arc::new(EndpointGuard::from_config(&list.authentication)?);
        debug!(
            endpoint = %list.endpoint,
            format = ?list.format,
            auth = ?list.authentication.kind,
            "Registering blocklist"
        );
        router = router.merge(
            Router::new()
                .route(&list.endpoint, get(blocklist_handler))
                .route_layer(middleware::from_fn_with_state(guard, guard_middleware))
                .layer(Extension(Endpoint {
                    format: list.format,
                })),
        );
    }

    Ok(router.layer(TraceLayer::new_for_http()).with_state(state))
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "auth": state.auth_mode,
        "decisions": state.cache.active(Instant::now()).len(),
        "sync": state.sync.status(),
    }))
}

/// GET <endpoint>
async fn blocklist_handler(
    State(state): State<Arc<AppState>>,
    Extension(endpoint): Extension<Endpoint>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let now = Instant::now();
    let options = RenderOptions::from_query(&params);
    let body = render(endpoint.format, state.cache.active(now), &options, now);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type(endpoint.format))],
        body,
    )
}
