//! Task Queue
//!
//! Durable job storage partitioned by [`QueueName`]. A job moves through an
//! explicit state machine:
//!
//! ```text
//!   enqueue ──► queued ──claim──► active ──complete──► completed
//!                 ▲                 │
//!                 └──fail (retry)───┤
//!                                   └──fail (exhausted)──► failed
//! ```
//!
//! `queued → active` only happens through an atomic [`QueueBackend::claim`],
//! and only the worker holding the claim's lease token may move the job out
//! of `active`. Two backends implement the storage: [`MemoryQueue`] for a
//! single process and [`RedisQueue`] for workers running elsewhere.

pub mod jobs;
pub mod memory;
pub mod redis_store;
pub mod service;
pub mod workers;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::types::AppResult;
use crate::utils::retry::exponential_delay;

pub use jobs::{AnalysisModule, JobPayload, QueueName};
pub use memory::MemoryQueue;
pub use redis_store::RedisQueue;
pub use service::QueueService;
pub use workers::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Transitions allowed by the job state machine. `active → queued` is a retry.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Active)
                | (JobState::Active, JobState::Completed)
                | (JobState::Active, JobState::Failed)
                | (JobState::Active, JobState::Queued)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = crate::types::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(crate::types::AppError::Queue(format!("Unknown job state: {}", other))),
        }
    }
}

/// Delay applied before a failed job becomes claimable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    #[serde(rename_all = "camelCase")]
    Fixed { delay_ms: u64 },
    #[serde(rename_all = "camelCase")]
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Delay after `attempts` failed attempts: `delay * 2^attempts` for exponential.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                exponential_delay(Duration::from_millis(delay_ms), attempts)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Lower runs sooner
    pub priority: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl JobOptions {
    pub fn from_config(config: &QueueConfig, priority: u32) -> Self {
        Self {
            priority,
            max_attempts: config.max_attempts.max(1),
            backoff: Backoff::Exponential {
                delay_ms: config.backoff_delay_ms,
            },
        }
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default(), 0)
    }
}

/// A job record as stored by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub queue: QueueName,
    pub name: String,
    pub payload: JobPayload,
    pub priority: u32,
    /// Failed attempts so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub state: JobState,
    pub result: Option<String>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a fresh `queued` job. Fails with `Validation` on a malformed payload.
    pub fn new(payload: JobPayload, options: JobOptions) -> AppResult<Self> {
        payload.validate()?;
        let name = payload.name().to_string();
        Ok(Self {
            id: format!("{}-{}", name, Uuid::new_v4()),
            queue: payload.queue(),
            name,
            payload,
            priority: options.priority,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            backoff: options.backoff,
            state: JobState::Queued,
            result: None,
            failed_reason: None,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
        })
    }
}

/// Proof that a worker won the claim on a job.
#[derive(Debug, Clone)]
pub struct Claim {
    pub job: Job,
    pub token: Uuid,
}

impl Claim {
    pub fn id(&self) -> &str {
        &self.job.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed_age: Duration,
    pub completed_count: usize,
    pub failed_age: Duration,
    pub failed_count: usize,
}

impl From<&QueueConfig> for RetentionPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            completed_age: Duration::from_secs(config.completed_retention_secs),
            completed_count: config.completed_retention_count,
            failed_age: Duration::from_secs(config.failed_retention_secs),
            failed_count: config.failed_retention_count,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Storage behind the Task Queue.
///
/// Every transition is atomic per job: concurrent claimers never both win the
/// same job, and `complete`/`fail` reject callers whose lease is gone with
/// `AppError::LeaseLost`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> AppResult<Job>;

    async fn get_job(&self, id: &str) -> AppResult<Option<Job>>;

    async fn get_completed(&self, queue: QueueName) -> AppResult<Vec<Job>>;

    /// Claim the next ready job: lowest priority value first, then FIFO.
    async fn claim(&self, queue: QueueName, lease: Duration) -> AppResult<Option<Claim>>;

    async fn complete(&self, claim: &Claim, result: String) -> AppResult<Job>;

    /// Record a failed attempt, re-queueing with backoff while attempts remain.
    async fn fail(&self, claim: &Claim, reason: &str) -> AppResult<Job>;

    /// Re-queue (or fail) active jobs whose lease expired. Returns how many moved.
    async fn recover_stalled(&self) -> AppResult<usize>;

    /// Drop terminal jobs outside the retention policy. Returns how many were removed.
    async fn purge(&self, retention: &RetentionPolicy) -> AppResult<usize>;

    async fn counts(&self, queue: QueueName) -> AppResult<JobCounts>;

    /// Park until work may be available on `queue` or `timeout` elapses.
    async fn wait_for_job(&self, _queue: QueueName, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}

pub(crate) const STALLED_REASON: &str = "job stalled more than the lease allows";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        assert!(JobState::Queued.can_transition_to(JobState::Active));
        assert!(JobState::Active.can_transition_to(JobState::Completed));
        assert!(JobState::Active.can_transition_to(JobState::Queued));
        assert!(!JobState::Queued.can_transition_to(JobState::Completed));
        assert!(!JobState::Completed.can_transition_to(JobState::Active));
        assert!(!JobState::Failed.can_transition_to(JobState::Queued));
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Active.is_terminal());
    }

    #[test]
    fn test_backoff_delays() {
        let backoff = Backoff::Exponential { delay_ms: 1000 };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(4000));
        let fixed = Backoff::Fixed { delay_ms: 250 };
        assert_eq!(fixed.delay_for(5), Duration::from_millis(250));
    }

    #[test]
    fn test_new_job_rejects_malformed_payload() {
        let payload = JobPayload::Analysis {
            conversation_id: String::new(),
            content: "text".into(),
        };
        assert!(Job::new(payload, JobOptions::default()).is_err());

        let payload = JobPayload::Analysis {
            conversation_id: "c1".into(),
            content: "text".into(),
        };
        let job = Job::new(payload, JobOptions::default()).unwrap();
        assert!(job.id.starts_with("analysis-"));
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.queue, QueueName::Analysis);
        assert_eq!(job.max_attempts, 3);
    }
}
