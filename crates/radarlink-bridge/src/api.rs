//! Local read-only status API.
//!
//! ```text
//! /health        - Health check
//! /api
//! └── /status    - Session state and counters
//! ```

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod health;
pub mod status;

/// Creates the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api", Router::new().route("/status", get(status::get_status)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
