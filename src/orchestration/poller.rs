use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::models::{CompletedJob, PollEntry, PollStatus};
use crate::queue::{Job, JobState, QueueName, QueueService};
use crate::types::AppResult;

/// Read-only view of job state for clients.
pub struct Poller {
    queue: Arc<QueueService>,
}

fn entry_for(job: Job) -> PollEntry {
    let status = PollStatus::from(job.state);
    let (data, error) = match job.state {
        JobState::Completed => (job.result, None),
        JobState::Failed => (None, job.failed_reason),
        _ => (None, None),
    };
    PollEntry {
        job_id: job.id,
        status,
        data,
        error,
    }
}

impl Poller {
    pub fn new(queue: Arc<QueueService>) -> Self {
        Self { queue }
    }

    /// One entry per id, in input order. A lookup that errors reports
    /// `not_found` for that id alone.
    pub async fn poll(&self, job_ids: &[String]) -> Vec<PollEntry> {
        let lookups = job_ids.iter().map(|id| async move {
            match self.queue.get_job(id).await {
                Ok(Some(job)) => entry_for(job),
                Ok(None) => PollEntry::not_found(id.clone()),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Job lookup failed, reporting not_found");
                    PollEntry::not_found(id.clone())
                }
            }
        });
        let entries = join_all(lookups).await;
        debug!(
            requested = job_ids.len(),
            completed = entries.iter().filter(|e| e.status == PollStatus::Completed).count(),
            "Polled jobs"
        );
        entries
    }

    pub async fn completed(&self, queue: QueueName) -> AppResult<Vec<CompletedJob>> {
        let jobs = self.queue.get_completed(queue).await?;
        Ok(jobs
            .into_iter()
            .filter_map(|job| job.result.map(|data| CompletedJob { id: job.id, data }))
            .collect())
    }
}
