use axum::{extract::State, routing::get, Json, Router};
use tracing::warn;

use crate::models::{AppState, HealthResponse};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (status, queue) = match state.queue.ping().await {
        Ok(()) => match state.queue.total_counts().await {
            Ok(counts) => ("ok", Some(counts)),
            Err(e) => {
                warn!(error = %e, "Failed to read queue counts");
                ("degraded", None)
            }
        },
        Err(e) => {
            warn!(error = %e, "Queue backend unreachable");
            ("degraded", None)
        }
    };

    Json(HealthResponse {
        status,
        timestamp: chrono::Utc::now(),
        queue,
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::routes::testing::test_state;

    #[tokio::test]
    async fn test_health_reports_queue_counts() {
        let response = router(test_state())
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queue"]["queued"], 0);
    }
}
