//! HTTP service wiring for the Paygate node.
//!
//! Exposes the metered streaming protocol plus a live console: stream
//! sessions over SSE, proof submission over POST, node info and balance,
//! and the console event feed with its persisted history.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

pub mod cli;
pub mod events;
pub mod handlers;
pub mod state;

pub use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/info", get(handlers::wallet::info_handler))
        .route("/api/balance", get(handlers::wallet::balance_handler))
        .route("/api/events", get(handlers::sse::events_handler))
        .route(
            "/api/events/history",
            get(handlers::sse::events_history_handler),
        )
        .route("/api/stream", post(handlers::stream::stream_handler))
        .route("/api/stream/proof", post(handlers::stream::proof_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
