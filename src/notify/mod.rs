//! Push channel for job completions.
//!
//! Workers publish a [`TaskEvent`] on the topic of the job's conversation;
//! anything subscribed to that topic (the WebSocket route, a passive display)
//! receives it. Delivery here is best effort: the poll path stays
//! authoritative, so a failed publish never touches job state.

pub mod redis_relay;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::queue::{AnalysisModule, Job, QueueName};
use crate::types::{AppError, AppResult};

pub use redis_relay::{RedisEventRelay, RedisEventSink};

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskEventKind {
    ConversationProcessed,
    AnalysisCompleted,
    ReasoningCompleted,
    SummaryGenerated,
}

impl TaskEventKind {
    pub fn for_queue(queue: QueueName) -> Self {
        match queue {
            QueueName::ConversationProcessing => TaskEventKind::ConversationProcessed,
            QueueName::Analysis | QueueName::AnalysisModule => TaskEventKind::AnalysisCompleted,
            QueueName::Reasoning => TaskEventKind::ReasoningCompleted,
            QueueName::SummaryGeneration => TaskEventKind::SummaryGenerated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub event: TaskEventKind,
    pub conversation_id: String,
    pub job_id: String,
    pub queue: QueueName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<AnalysisModule>,
    pub result: String,
}

impl TaskEvent {
    /// Event for a job that just completed. `None` if the job has no result.
    pub fn completed(job: &Job) -> Option<Self> {
        let result = job.result.clone()?;
        Some(Self {
            event: TaskEventKind::for_queue(job.queue),
            conversation_id: job.payload.conversation_id().to_string(),
            job_id: job.id.clone(),
            queue: job.queue,
            module: job.payload.module(),
            result,
        })
    }
}

/// Where workers send completion events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Returns how many subscribers the event reached, where the sink knows.
    async fn publish(&self, event: TaskEvent) -> AppResult<usize>;
}

/// In-process topics keyed by conversation id.
#[derive(Default)]
pub struct NotificationHub {
    topics: Mutex<HashMap<String, broadcast::Sender<TaskEvent>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, conversation_id: &str) -> AppResult<broadcast::Receiver<TaskEvent>> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| AppError::Channel("topic registry poisoned".into()))?;
        let sender = topics
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        debug!(conversation_id, "Subscribed to conversation topic");
        Ok(sender.subscribe())
    }

    /// Deliver to current subscribers. Topics nobody listens to are dropped.
    pub fn send(&self, event: TaskEvent) -> AppResult<usize> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| AppError::Channel("topic registry poisoned".into()))?;
        let Some(sender) = topics.get(&event.conversation_id) else {
            return Ok(0);
        };
        let topic = event.conversation_id.clone();
        match sender.send(event) {
            Ok(receivers) => Ok(receivers),
            Err(_) => {
                topics.remove(&topic);
                Ok(0)
            }
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().map(|t| t.len()).unwrap_or(0)
    }
}

#[async_trait]
impl EventSink for NotificationHub {
    async fn publish(&self, event: TaskEvent) -> AppResult<usize> {
        self.send(event)
    }
}
