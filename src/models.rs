use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::config::Config;
use crate::notify::NotificationHub;
use crate::orchestration::{Dispatcher, Poller};
use crate::queue::{JobCounts, JobState, QueueService};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub queue: Arc<QueueService>,
    pub dispatcher: Arc<Dispatcher>,
    pub poller: Arc<Poller>,
    pub hub: Arc<NotificationHub>,
}

impl AppState {
    pub fn new(config: Config, queue: Arc<QueueService>, hub: Arc<NotificationHub>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(queue.clone()));
        let poller = Arc::new(Poller::new(queue.clone()));
        Self {
            config,
            queue,
            dispatcher,
            poller,
            hub,
        }
    }
}

// Wire types shared by the HTTP routes and the client gateways

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ChatMessage {
    #[validate(length(min = 1))]
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    #[serde(default)]
    #[validate(nested)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    #[validate(length(min = 1, message = "sessionId is required"))]
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub worker_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    #[serde(default)]
    #[validate(length(max = 500, message = "too many job ids in one poll"))]
    pub job_ids: Vec<String>,
}

/// Poll view of a job. `NotFound` is never a stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Queued,
    Active,
    Completed,
    Failed,
    NotFound,
}

impl PollStatus {
    /// No further change can be observed for this id.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PollStatus::Completed | PollStatus::Failed)
    }
}

impl From<JobState> for PollStatus {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Queued => PollStatus::Queued,
            JobState::Active => PollStatus::Active,
            JobState::Completed => PollStatus::Completed,
            JobState::Failed => PollStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollEntry {
    pub job_id: String,
    pub status: PollStatus,
    /// Result text, present only when completed
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PollEntry {
    pub fn not_found(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: PollStatus::NotFound,
            data: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedJob {
    pub id: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRequest {
    #[serde(default)]
    #[validate(length(min = 1, message = "sessionId is required"))]
    pub session_id: String,
    #[validate(length(min = 1, message = "conversation must not be empty"))]
    #[validate(nested)]
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResponse {
    pub success: bool,
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SummaryPollRequest {
    #[validate(length(min = 1, message = "jobId is required"))]
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryPollResponse {
    pub status: PollStatus,
    pub summary_content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub queue: Option<JobCounts>,
}
