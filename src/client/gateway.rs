use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::models::{DispatchRequest, DispatchResponse, PollEntry, PollRequest};
use crate::orchestration::{Dispatcher, Poller};
use crate::types::{AppError, AppResult};

/// How a kiosk session reaches the dispatcher and poller.
#[async_trait]
pub trait JobGateway: Send + Sync {
    async fn dispatch(&self, request: &DispatchRequest) -> AppResult<Vec<String>>;

    async fn poll(&self, job_ids: &[String]) -> AppResult<Vec<PollEntry>>;
}

/// Calls the dispatcher and poller in the same process.
pub struct LocalGateway {
    dispatcher: Arc<Dispatcher>,
    poller: Arc<Poller>,
}

impl LocalGateway {
    pub fn new(dispatcher: Arc<Dispatcher>, poller: Arc<Poller>) -> Self {
        Self { dispatcher, poller }
    }
}

#[async_trait]
impl JobGateway for LocalGateway {
    async fn dispatch(&self, request: &DispatchRequest) -> AppResult<Vec<String>> {
        self.dispatcher.dispatch_messages(request).await
    }

    async fn poll(&self, job_ids: &[String]) -> AppResult<Vec<PollEntry>> {
        Ok(self.poller.poll(job_ids).await)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Talks to a remote server's `/api/analysis` routes.
pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn error_from(response: reqwest::Response) -> AppError {
        let status = response.status();
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        match status {
            StatusCode::BAD_REQUEST => AppError::Validation(message),
            StatusCode::NOT_FOUND => AppError::NotFound(message),
            _ => AppError::Internal(format!("server returned {}: {}", status, message)),
        }
    }
}

#[async_trait]
impl JobGateway for HttpGateway {
    async fn dispatch(&self, request: &DispatchRequest) -> AppResult<Vec<String>> {
        let response = self
            .client
            .post(format!("{}/api/analysis/dispatch", self.base_url))
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        let body: DispatchResponse = response.json().await?;
        Ok(body.worker_ids)
    }

    async fn poll(&self, job_ids: &[String]) -> AppResult<Vec<PollEntry>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(format!("{}/api/analysis/poll", self.base_url))
            .json(&PollRequest {
                job_ids: job_ids.to_vec(),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::*;
    use crate::models::{ChatMessage, PollStatus};

    #[tokio::test]
    async fn test_http_dispatch_and_poll() {
        let mut server = mockito::Server::new_async().await;
        let dispatch = server
            .mock("POST", "/api/analysis/dispatch")
            .match_body(Matcher::PartialJson(serde_json::json!({"sessionId": "session-1"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"workerIds":["roughOverview-1","hypothesisGeneration-2"]}"#)
            .create_async()
            .await;
        let poll = server
            .mock("POST", "/api/analysis/poll")
            .match_body(Matcher::Json(serde_json::json!({"jobIds": ["roughOverview-1"]})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"jobId":"roughOverview-1","status":"completed","data":"R1"}]"#)
            .create_async()
            .await;

        let gateway = HttpGateway::new(&server.url());
        let ids = gateway
            .dispatch(&DispatchRequest {
                messages: vec![ChatMessage::new("user", "Hello!")],
                session_id: "session-1".into(),
            })
            .await
            .unwrap();
        assert_eq!(ids, vec!["roughOverview-1", "hypothesisGeneration-2"]);

        let entries = gateway.poll(&ids[..1]).await.unwrap();
        assert_eq!(entries[0].status, PollStatus::Completed);
        assert_eq!(entries[0].data.as_deref(), Some("R1"));

        dispatch.assert_async().await;
        poll.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_validation_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/analysis/dispatch")
            .with_status(400)
            .with_body(r#"{"success":false,"error":"sessionId is required"}"#)
            .create_async()
            .await;

        let gateway = HttpGateway::new(&server.url());
        let err = gateway
            .dispatch(&DispatchRequest {
                messages: vec![ChatMessage::new("user", "hi")],
                session_id: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(m) if m.contains("sessionId")));
    }
}
