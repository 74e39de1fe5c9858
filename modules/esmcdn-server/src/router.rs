use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Assemble the app: the fixed meta-routes, then the module fallback that
/// handles every package-shaped path.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::home))
        .route("/favicon.ico", get(handlers::favicon))
        .route("/status.json", get(handlers::status_json))
        .route("/esma-target", get(handlers::esma_target))
        .route("/error.js", get(handlers::error_js))
        .route("/node/{file}", get(handlers::node_polyfill))
        .route("/transform", post(handlers::transform))
        .route("/purge", post(handlers::purge))
        .fallback(handlers::module_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
