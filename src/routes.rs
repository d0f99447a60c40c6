//! Router configuration for the client-facing API

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers;
use crate::AppState;

/// Create the main router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/push/register", post(handlers::register_push))
        .route("/calls/credentials", get(handlers::call_credentials))
        .route("/calls/end", post(handlers::end_call))
        .route("/calls/reject", post(handlers::end_call))
        .route(
            "/calls/outgoing-credentials",
            post(handlers::outgoing_credentials),
        )
        .route("/calls/outgoing-cleanup", post(handlers::outgoing_cleanup))
        .with_state(state)
}
