//! HTTP entry points.
//!
//! - `/api/analysis/*`, `/api/polling/completed` - dispatch and poll analysis jobs
//! - `/api/generate-summary*` - consultation summaries
//! - `/api/tasks` - single conversation, analysis or reasoning jobs
//! - `/api/socket/{conversation_id}` - push channel for completions
//! - `/api/health` - liveness and queue counts

pub mod analysis;
pub mod health;
pub mod socket;
pub mod summary;
pub mod tasks;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::cors_layer;
use crate::models::AppState;

pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");
    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .merge(analysis::router(state.clone()))
        .merge(summary::router(state.clone()))
        .merge(tasks::router(state.clone()))
        .merge(socket::router(state.clone()))
        .merge(health::router(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
