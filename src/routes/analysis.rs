use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use tracing::info;
use validator::Validate;

use crate::models::{
    AppState, CompletedJob, DispatchRequest, DispatchResponse, PollEntry, PollRequest,
};
use crate::queue::QueueName;
use crate::types::AppResult;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/analysis/dispatch", post(dispatch))
        .route("/api/analysis/poll", post(poll))
        .route("/api/polling/completed", get(completed))
        .with_state(state)
}

async fn dispatch(
    State(state): State<AppState>,
    Json(request): Json<DispatchRequest>,
) -> AppResult<Json<DispatchResponse>> {
    info!(
        session_id = %request.session_id,
        messages = request.messages.len(),
        "Analysis dispatch requested"
    );
    let worker_ids = state.dispatcher.dispatch_messages(&request).await?;
    Ok(Json(DispatchResponse { worker_ids }))
}

async fn poll(
    State(state): State<AppState>,
    Json(request): Json<PollRequest>,
) -> AppResult<Json<Vec<PollEntry>>> {
    request.validate()?;
    Ok(Json(state.poller.poll(&request.job_ids).await))
}

async fn completed(State(state): State<AppState>) -> AppResult<Json<Vec<CompletedJob>>> {
    let jobs = state.poller.completed(QueueName::AnalysisModule).await?;
    Ok(Json(jobs))
}
