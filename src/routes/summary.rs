use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tracing::info;
use validator::Validate;

use crate::models::{
    AppState, PollStatus, SummaryPollRequest, SummaryPollResponse, SummaryRequest,
    SummaryResponse,
};
use crate::queue::{JobState, QueueName};
use crate::types::AppResult;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/generate-summary", post(generate_summary))
        .route("/api/generate-summary/poll", post(poll_summary))
        .with_state(state)
}

async fn generate_summary(
    State(state): State<AppState>,
    Json(request): Json<SummaryRequest>,
) -> AppResult<Json<SummaryResponse>> {
    request.validate()?;
    let job_id = state
        .dispatcher
        .dispatch_summary(&request.session_id, &request.messages)
        .await?;
    info!(session_id = %request.session_id, job_id = %job_id, "Summary requested");
    Ok(Json(SummaryResponse {
        success: true,
        job_id,
    }))
}

async fn poll_summary(
    State(state): State<AppState>,
    Json(request): Json<SummaryPollRequest>,
) -> AppResult<Response> {
    request.validate()?;
    let job = state
        .queue
        .get_job(&request.job_id)
        .await?
        .filter(|job| job.queue == QueueName::SummaryGeneration);

    let Some(job) = job else {
        let body = SummaryPollResponse {
            status: PollStatus::NotFound,
            summary_content: None,
        };
        return Ok((StatusCode::NOT_FOUND, Json(body)).into_response());
    };

    let summary_content = match job.state {
        JobState::Completed => job.result,
        _ => None,
    };
    Ok(Json(SummaryPollResponse {
        status: job.state.into(),
        summary_content,
    })
    .into_response())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;

    use super::*;
    use crate::routes::testing::{post_json, test_state};

    #[tokio::test]
    async fn test_summary_round_trip() {
        let state = test_state();
        let (status, body) = post_json(
            router(state.clone()),
            "/api/generate-summary",
            serde_json::json!({
                "sessionId": "s-1",
                "messages": [
                    {"role": "user", "content": "I have a cough"},
                    {"role": "assistant", "content": "For how long?"}
                ]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let job_id = body["jobId"].as_str().unwrap().to_string();
        assert!(job_id.starts_with("generateSummary-"));

        let (status, body) = post_json(
            router(state.clone()),
            "/api/generate-summary/poll",
            serde_json::json!({"jobId": job_id}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "queued");
        assert!(body["summaryContent"].is_null());

        let backend = state.queue.backend();
        let claim = backend
            .claim(QueueName::SummaryGeneration, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        backend.complete(&claim, "Summary text".into()).await.unwrap();

        let (_, body) = post_json(
            router(state),
            "/api/generate-summary/poll",
            serde_json::json!({"jobId": job_id}),
        )
        .await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["summaryContent"], "Summary text");
    }

    #[tokio::test]
    async fn test_unknown_summary_is_404() {
        let (status, body) = post_json(
            router(test_state()),
            "/api/generate-summary/poll",
            serde_json::json!({"jobId": "generateSummary-missing"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "not_found");
    }

    #[tokio::test]
    async fn test_summary_without_messages_is_rejected() {
        let (status, _) = post_json(
            router(test_state()),
            "/api/generate-summary",
            serde_json::json!({"sessionId": "s-1", "messages": []}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
