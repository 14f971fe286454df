// Blue Booth - background analysis orchestration for a health kiosk

pub mod agents;
pub mod client;
pub mod config;
pub mod llm;
pub mod middleware;
pub mod models;
pub mod notify;
pub mod orchestration;
pub mod queue;
pub mod routes;
pub mod types;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use models::AppState;

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
