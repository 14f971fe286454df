use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use validator::Validate;

use crate::models::{ChatMessage, DispatchRequest};
use crate::queue::{AnalysisModule, JobOptions, JobPayload, QueueName, QueueService};
use crate::types::{AppError, AppResult};

/// `ROLE: content` lines for the user and assistant messages.
pub fn transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role == "user" || m.role == "assistant")
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| format!("{}: {}", m.role.to_uppercase(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn require_session(session_id: &str) -> AppResult<()> {
    if session_id.trim().is_empty() {
        return Err(AppError::Validation("sessionId is required".into()));
    }
    Ok(())
}

pub struct Dispatcher {
    queue: Arc<QueueService>,
    modules: Vec<AnalysisModule>,
}

impl Dispatcher {
    pub fn new(queue: Arc<QueueService>) -> Self {
        let modules = queue.config().modules.clone();
        Self { queue, modules }
    }

    pub fn with_modules(queue: Arc<QueueService>, modules: Vec<AnalysisModule>) -> Self {
        Self { queue, modules }
    }

    pub fn modules(&self) -> &[AnalysisModule] {
        &self.modules
    }

    /// Enqueue one job per configured module, in module order.
    ///
    /// A module that fails to enqueue is logged and left out; the ids returned
    /// are exactly the jobs that made it onto the queue.
    pub async fn dispatch(&self, conversation: &str, session_id: &str) -> AppResult<Vec<String>> {
        require_session(session_id)?;
        if conversation.trim().is_empty() {
            return Ok(Vec::new());
        }

        let options = JobOptions::from_config(
            self.queue.config(),
            self.queue.priority_for(QueueName::AnalysisModule),
        );
        let timestamp = Utc::now();
        let mut ids = Vec::with_capacity(self.modules.len());

        for &module in &self.modules {
            let payload = JobPayload::AnalysisModule {
                module,
                conversation: conversation.to_string(),
                session_id: session_id.to_string(),
                timestamp,
            };
            match self.queue.enqueue_with(payload, options.clone()).await {
                Ok(job) => ids.push(job.id),
                Err(e) => warn!(
                    module = %module,
                    session_id,
                    error = %e,
                    "Failed to enqueue analysis module, skipping"
                ),
            }
        }

        info!(
            session_id,
            requested = self.modules.len(),
            enqueued = ids.len(),
            "Dispatched analysis jobs"
        );
        Ok(ids)
    }

    pub async fn dispatch_messages(&self, request: &DispatchRequest) -> AppResult<Vec<String>> {
        if request.messages.is_empty() {
            return Ok(Vec::new());
        }
        request.validate()?;
        self.dispatch(&transcript(&request.messages), &request.session_id)
            .await
    }

    /// Queue a consultation summary. Runs after conversation and analysis work.
    pub async fn dispatch_summary(
        &self,
        session_id: &str,
        messages: &[ChatMessage],
    ) -> AppResult<String> {
        require_session(session_id)?;
        let conversation = messages
            .iter()
            .map(|m| format!("{}: {}", m.role.to_uppercase(), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let job = self
            .queue
            .enqueue(JobPayload::SummaryGeneration {
                session_id: session_id.to_string(),
                conversation,
            })
            .await?;
        info!(session_id, job_id = %job.id, "Dispatched summary job");
        Ok(job.id)
    }

    /// Enqueue a single conversation, analysis or reasoning job.
    pub async fn dispatch_task(&self, payload: JobPayload) -> AppResult<String> {
        match payload.queue() {
            QueueName::ConversationProcessing | QueueName::Analysis | QueueName::Reasoning => {}
            other => {
                return Err(AppError::Validation(format!(
                    "{} jobs are not accepted as tasks",
                    other
                )))
            }
        }
        let job = self.queue.enqueue(payload).await?;
        info!(job_id = %job.id, queue = %job.queue, priority = job.priority, "Dispatched task");
        Ok(job.id)
    }
}
