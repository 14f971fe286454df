//! In-process queue backend.
//!
//! All job state lives behind one async mutex, which makes every transition
//! atomic. Waiting jobs are indexed per queue by `(priority, seq)`; a job in
//! backoff stays in the index with a `ready_at` in the future and is skipped
//! until then.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Claim, Job, JobCounts, JobOptions, JobPayload, JobState, QueueBackend, QueueName,
    RetentionPolicy, STALLED_REASON,
};
use crate::types::{AppError, AppResult};

type WaitKey = (u32, u64, String);

struct Lease {
    token: Uuid,
    expires_at: Instant,
}

struct Entry {
    job: Job,
    seq: u64,
    ready_at: Instant,
    lease: Option<Lease>,
}

impl Entry {
    fn wait_key(&self) -> WaitKey {
        (self.job.priority, self.seq, self.job.id.clone())
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    waiting: HashMap<QueueName, BTreeSet<WaitKey>>,
    seq: u64,
}

pub struct MemoryQueue {
    inner: Mutex<Inner>,
    signals: HashMap<QueueName, Arc<Notify>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        let signals = QueueName::ALL
            .iter()
            .map(|q| (*q, Arc::new(Notify::new())))
            .collect();
        Self {
            inner: Mutex::new(Inner::default()),
            signals,
        }
    }

    fn signal(&self, queue: QueueName) {
        if let Some(notify) = self.signals.get(&queue) {
            notify.notify_one();
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Look up the entry a claim refers to and check the claim still owns it.
fn owned_entry<'a>(
    entries: &'a mut HashMap<String, Entry>,
    claim: &Claim,
) -> AppResult<&'a mut Entry> {
    let entry = entries
        .get_mut(claim.id())
        .ok_or_else(|| AppError::LeaseLost(claim.id().to_string()))?;
    let owns = entry.job.state == JobState::Active
        && entry.lease.as_ref().map(|l| l.token) == Some(claim.token);
    if owns {
        Ok(entry)
    } else {
        Err(AppError::LeaseLost(claim.id().to_string()))
    }
}

/// Count one failed attempt and move the job back to `queued` or on to `failed`.
fn settle_failure(
    entry: &mut Entry,
    waiting: &mut HashMap<QueueName, BTreeSet<WaitKey>>,
    reason: &str,
    retry_delay: Option<Duration>,
    now: Instant,
) {
    entry.lease = None;
    entry.job.attempts += 1;
    entry.job.failed_reason = Some(reason.to_string());

    if entry.job.attempts < entry.job.max_attempts {
        let delay = retry_delay.unwrap_or_else(|| entry.job.backoff.delay_for(entry.job.attempts));
        entry.job.state = JobState::Queued;
        entry.ready_at = now + delay;
        waiting
            .entry(entry.job.queue)
            .or_default()
            .insert(entry.wait_key());
    } else {
        entry.job.state = JobState::Failed;
        entry.job.finished_at = Some(Utc::now());
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(&self, payload: JobPayload, options: JobOptions) -> AppResult<Job> {
        let job = Job::new(payload, options)?;
        let queue = job.queue;
        {
            let mut inner = self.inner.lock().await;
            inner.seq += 1;
            let entry = Entry {
                job: job.clone(),
                seq: inner.seq,
                ready_at: Instant::now(),
                lease: None,
            };
            inner.waiting.entry(queue).or_default().insert(entry.wait_key());
            inner.entries.insert(job.id.clone(), entry);
        }
        self.signal(queue);
        debug!(job_id = %job.id, queue = %queue, priority = job.priority, "Job enqueued");
        Ok(job)
    }

    async fn get_job(&self, id: &str) -> AppResult<Option<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(id).map(|e| e.job.clone()))
    }

    async fn get_completed(&self, queue: QueueName) -> AppResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .entries
            .values()
            .filter(|e| e.job.queue == queue && e.job.state == JobState::Completed)
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.finished_at);
        Ok(jobs)
    }

    async fn claim(&self, queue: QueueName, lease: Duration) -> AppResult<Option<Claim>> {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        let Inner { entries, waiting, .. } = &mut *guard;
        let Some(index) = waiting.get_mut(&queue) else {
            return Ok(None);
        };

        let next = index
            .iter()
            .find(|(_, _, id)| entries.get(id).is_some_and(|e| e.ready_at <= now))
            .cloned();
        let Some(key) = next else {
            return Ok(None);
        };
        index.remove(&key);

        let Some(entry) = entries.get_mut(&key.2) else {
            warn!(job_id = %key.2, "Waiting index referenced a missing job");
            return Ok(None);
        };
        if !entry.job.state.can_transition_to(JobState::Active) {
            return Err(AppError::Queue(format!(
                "job {} is {} and cannot be claimed",
                entry.job.id, entry.job.state
            )));
        }

        let token = Uuid::new_v4();
        entry.job.state = JobState::Active;
        entry.job.processed_at = Some(Utc::now());
        entry.lease = Some(Lease {
            token,
            expires_at: now + lease,
        });

        Ok(Some(Claim {
            job: entry.job.clone(),
            token,
        }))
    }

    async fn complete(&self, claim: &Claim, result: String) -> AppResult<Job> {
        let mut inner = self.inner.lock().await;
        let entry = owned_entry(&mut inner.entries, claim)?;
        entry.lease = None;
        entry.job.state = JobState::Completed;
        entry.job.result = Some(result);
        entry.job.finished_at = Some(Utc::now());
        Ok(entry.job.clone())
    }

    async fn fail(&self, claim: &Claim, reason: &str) -> AppResult<Job> {
        let now = Instant::now();
        let job = {
            let mut guard = self.inner.lock().await;
            let Inner { entries, waiting, .. } = &mut *guard;
            let entry = owned_entry(entries, claim)?;
            settle_failure(entry, waiting, reason, None, now);
            entry.job.clone()
        };
        if job.state == JobState::Queued {
            self.signal(job.queue);
        }
        Ok(job)
    }

    async fn recover_stalled(&self) -> AppResult<usize> {
        let now = Instant::now();
        let mut requeued = Vec::new();
        let mut moved = 0;
        {
            let mut guard = self.inner.lock().await;
            let Inner { entries, waiting, .. } = &mut *guard;
            for entry in entries.values_mut() {
                let expired = entry.job.state == JobState::Active
                    && entry.lease.as_ref().is_some_and(|l| l.expires_at <= now);
                if !expired {
                    continue;
                }
                warn!(job_id = %entry.job.id, attempts = entry.job.attempts, "Recovering stalled job");
                settle_failure(entry, waiting, STALLED_REASON, Some(Duration::ZERO), now);
                if entry.job.state == JobState::Queued {
                    requeued.push(entry.job.queue);
                }
                moved += 1;
            }
        }
        for queue in requeued {
            self.signal(queue);
        }
        Ok(moved)
    }

    async fn purge(&self, retention: &RetentionPolicy) -> AppResult<usize> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let mut doomed = Vec::new();

        for queue in QueueName::ALL {
            for (state, age, keep) in [
                (JobState::Completed, retention.completed_age, retention.completed_count),
                (JobState::Failed, retention.failed_age, retention.failed_count),
            ] {
                let cutoff = chrono::Duration::from_std(age)
                    .ok()
                    .and_then(|age| now.checked_sub_signed(age));
                let mut finished: Vec<(chrono::DateTime<Utc>, u64, String)> = inner
                    .entries
                    .values()
                    .filter(|e| e.job.queue == queue && e.job.state == state)
                    .map(|e| (e.job.finished_at.unwrap_or(now), e.seq, e.job.id.clone()))
                    .collect();
                // newest first
                finished.sort_by(|a, b| b.cmp(a));
                for (rank, (finished_at, _, id)) in finished.into_iter().enumerate() {
                    if rank >= keep || cutoff.is_some_and(|c| finished_at < c) {
                        doomed.push(id);
                    }
                }
            }
        }

        for id in &doomed {
            inner.entries.remove(id);
        }
        if !doomed.is_empty() {
            debug!(removed = doomed.len(), "Purged finished jobs");
        }
        Ok(doomed.len())
    }

    async fn counts(&self, queue: QueueName) -> AppResult<JobCounts> {
        let inner = self.inner.lock().await;
        let mut counts = JobCounts::default();
        for entry in inner.entries.values().filter(|e| e.job.queue == queue) {
            match entry.job.state {
                JobState::Queued => counts.queued += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn wait_for_job(&self, queue: QueueName, timeout: Duration) {
        match self.signals.get(&queue) {
            Some(notify) => {
                let _ = tokio::time::timeout(timeout, notify.notified()).await;
            }
            None => tokio::time::sleep(timeout).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{AnalysisModule, Backoff};

    const LEASE: Duration = Duration::from_secs(30);

    fn module_job(session: &str) -> JobPayload {
        JobPayload::AnalysisModule {
            module: AnalysisModule::RoughOverview,
            conversation: "USER: Hello!".to_string(),
            session_id: session.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn options(priority: u32, max_attempts: u32) -> JobOptions {
        JobOptions {
            priority,
            max_attempts,
            backoff: Backoff::Exponential { delay_ms: 1000 },
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_get() {
        let queue = MemoryQueue::new();
        let job = queue.enqueue(module_job("s1"), options(1, 3)).await.unwrap();

        let fetched = queue.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, JobState::Queued);
        assert_eq!(fetched.result, None);
        assert!(queue.get_job("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_payload() {
        let queue = MemoryQueue::new();
        let err = queue.enqueue(module_job(""), options(1, 3)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let counts = queue.counts(QueueName::AnalysisModule).await.unwrap();
        assert_eq!(counts, JobCounts::default());
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_fifo() {
        let queue = MemoryQueue::new();
        let low = queue.enqueue(module_job("s1"), options(5, 3)).await.unwrap();
        let first = queue.enqueue(module_job("s2"), options(1, 3)).await.unwrap();
        let second = queue.enqueue(module_job("s3"), options(1, 3)).await.unwrap();

        let order: Vec<String> = {
            let mut ids = Vec::new();
            while let Some(claim) = queue.claim(QueueName::AnalysisModule, LEASE).await.unwrap() {
                ids.push(claim.job.id);
            }
            ids
        };
        assert_eq!(order, vec![first.id, second.id, low.id]);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let queue = Arc::new(MemoryQueue::new());
        queue.enqueue(module_job("s1"), options(1, 3)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.claim(QueueName::AnalysisModule, LEASE).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_complete_requires_lease() {
        let queue = MemoryQueue::new();
        queue.enqueue(module_job("s1"), options(1, 3)).await.unwrap();
        let claim = queue.claim(QueueName::AnalysisModule, LEASE).await.unwrap().unwrap();

        let forged = Claim {
            job: claim.job.clone(),
            token: Uuid::new_v4(),
        };
        assert!(matches!(
            queue.complete(&forged, "nope".into()).await,
            Err(AppError::LeaseLost(_))
        ));

        let done = queue.complete(&claim, "R1".into()).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.result.as_deref(), Some("R1"));

        // a second completion cannot overwrite the result
        assert!(queue.complete(&claim, "R2".into()).await.is_err());
        let stored = queue.get_job(&claim.job.id).await.unwrap().unwrap();
        assert_eq!(stored.result.as_deref(), Some("R1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_exponential_backoff_then_fail() {
        let queue = MemoryQueue::new();
        let job = queue.enqueue(module_job("s1"), options(1, 3)).await.unwrap();
        let q = QueueName::AnalysisModule;

        // attempt 1
        let claim = queue.claim(q, LEASE).await.unwrap().unwrap();
        assert_eq!(claim.job.state, JobState::Active);
        let after = queue.fail(&claim, "boom").await.unwrap();
        assert_eq!(after.state, JobState::Queued);
        assert_eq!(after.attempts, 1);

        // not claimable before 1000 * 2^1 ms
        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(queue.claim(q, LEASE).await.unwrap().is_none());
        tokio::time::advance(Duration::from_millis(1)).await;

        // attempt 2
        let claim = queue.claim(q, LEASE).await.unwrap().unwrap();
        let after = queue.fail(&claim, "boom").await.unwrap();
        assert_eq!(after.state, JobState::Queued);
        assert_eq!(after.attempts, 2);

        tokio::time::advance(Duration::from_millis(3999)).await;
        assert!(queue.claim(q, LEASE).await.unwrap().is_none());
        tokio::time::advance(Duration::from_millis(1)).await;

        // attempt 3 exhausts the budget
        let claim = queue.claim(q, LEASE).await.unwrap().unwrap();
        let after = queue.fail(&claim, "boom").await.unwrap();
        assert_eq!(after.state, JobState::Failed);
        assert_eq!(after.attempts, 3);
        assert_eq!(after.failed_reason.as_deref(), Some("boom"));

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(queue.claim(q, LEASE).await.unwrap().is_none());
        let stored = queue.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_stalled_job() {
        let queue = MemoryQueue::new();
        queue.enqueue(module_job("s1"), options(1, 2)).await.unwrap();
        let q = QueueName::AnalysisModule;

        let stale = queue.claim(q, Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(queue.recover_stalled().await.unwrap(), 0);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(queue.recover_stalled().await.unwrap(), 1);

        // redelivered immediately, and the old lease can no longer finish the job
        let fresh = queue.claim(q, Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(fresh.job.attempts, 1);
        assert!(queue.complete(&stale, "late".into()).await.is_err());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(queue.recover_stalled().await.unwrap(), 1);
        let stored = queue.get_job(fresh.id()).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.failed_reason.as_deref(), Some(STALLED_REASON));
    }

    #[tokio::test]
    async fn test_get_completed_and_purge() {
        let queue = MemoryQueue::new();
        let q = QueueName::AnalysisModule;
        for session in ["s1", "s2", "s3"] {
            queue.enqueue(module_job(session), options(1, 3)).await.unwrap();
            let claim = queue.claim(q, LEASE).await.unwrap().unwrap();
            queue.complete(&claim, format!("result {}", session)).await.unwrap();
        }
        assert_eq!(queue.get_completed(q).await.unwrap().len(), 3);
        assert!(queue.get_completed(QueueName::Reasoning).await.unwrap().is_empty());

        let retention = RetentionPolicy {
            completed_age: Duration::from_secs(3600),
            completed_count: 1,
            failed_age: Duration::from_secs(3600),
            failed_count: 10,
        };
        assert_eq!(queue.purge(&retention).await.unwrap(), 2);
        let remaining = queue.get_completed(q).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].result.as_deref(), Some("result s3"));
    }
}
