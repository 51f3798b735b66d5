//! HTTP facade: the management and invocation surface exposed to clients.

mod handlers;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Configuration;
use crate::orchestrator::Orchestrator;

/// State shared across every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<Configuration>,
}

/// Build the HTTP router. Invocation and management routes are public; the
/// core does not gate them behind auth (see DESIGN.md for the rationale).
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/invoke/:function_name", post(handlers::invoke::invoke))
        .route(
            "/functions",
            get(handlers::functions::list_functions).post(handlers::functions::register_function),
        )
        .route(
            "/functions/:function_name",
            get(handlers::functions::get_function)
                .put(handlers::functions::update_function)
                .delete(handlers::functions::delete_function),
        )
        .route("/instances", get(handlers::instances::list_instances))
        .route(
            "/instances/:runtime_id",
            delete(handlers::instances::stop_instance),
        )
        .route("/stats", get(handlers::stats::stats))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
