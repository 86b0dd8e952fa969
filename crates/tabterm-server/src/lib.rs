//! tabterm server library: HTTP/WebSocket daemon exposing the terminal session manager.
//!
//! The router lives here rather than in main.rs so integration tests can build it
//! around an in-memory execution service.

pub mod config;
pub mod global_ws;
pub mod logging;
pub mod routes;
pub mod state;
pub mod websocket;

use axum::{
    routing::{get, post, put},
    Router,
};
use state::AppState;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Build the application router.
pub fn app(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/tabs", get(routes::tabs::list).post(routes::tabs::create))
        .route("/tabs/reorder", post(routes::tabs::reorder))
        .route(
            "/tabs/{id}",
            get(routes::tabs::get).delete(routes::tabs::close),
        )
        .route("/tabs/{id}/name", put(routes::tabs::rename))
        .route("/tabs/{id}/activate", post(routes::tabs::activate))
        .route("/tabs/{id}/retry", post(routes::tabs::retry))
        .route("/tabs/{id}/input", post(routes::tabs::send_input))
        .route("/tabs/{id}/command", post(routes::tabs::quick_command))
        .route(
            "/tabs/{id}/history",
            get(routes::tabs::history).delete(routes::tabs::clear_history),
        )
        .route("/tabs/{id}/counts", get(routes::tabs::counts))
        .route("/overview", get(routes::tabs::overview))
        .route("/health", get(routes::health));

    let ws_routes = Router::new()
        .route("/tabs/{id}", get(routes::ws::upgrade))
        .route("/events", get(routes::ws::events));

    Router::new()
        .nest("/api", api_routes)
        .nest("/ws", ws_routes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
