use axum::{extract::State, routing::post, Json, Router};

use crate::models::{AppState, TaskResponse};
use crate::queue::JobPayload;
use crate::types::AppResult;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", post(create_task))
        .with_state(state)
}

async fn create_task(
    State(state): State<AppState>,
    Json(payload): Json<JobPayload>,
) -> AppResult<Json<TaskResponse>> {
    let job_id = state.dispatcher.dispatch_task(payload).await?;
    Ok(Json(TaskResponse { job_id }))
}
