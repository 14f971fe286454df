//! Analysis workers.
//!
//! A [`WorkerPool`] serves one queue: it claims jobs under a lease, runs them
//! through an [`Analyzer`] with a timeout, records the outcome, and publishes a
//! [`TaskEvent`] for every completion. Up to `concurrency` jobs run at once and
//! claims are throttled by a shared rate limiter.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{Claim, JobState, QueueBackend, QueueName};
use crate::agents::Analyzer;
use crate::config::QueueConfig;
use crate::notify::{EventSink, TaskEvent};
use crate::types::AppError;

/// Claim throttle built from `rate_limit_max` jobs per `rate_limit_window_ms`.
/// `None` when either value is zero.
pub fn rate_limiter(config: &QueueConfig) -> Option<Arc<DefaultDirectRateLimiter>> {
    let max = NonZeroU32::new(config.rate_limit_max)?;
    let period = Duration::from_millis(config.rate_limit_window_ms) / max.get();
    let quota = Quota::with_period(period)?.allow_burst(max);
    Some(Arc::new(RateLimiter::direct(quota)))
}

#[derive(Clone)]
struct Worker {
    queue: QueueName,
    backend: Arc<dyn QueueBackend>,
    analyzer: Arc<dyn Analyzer>,
    events: Arc<dyn EventSink>,
    timeout: Duration,
}

impl Worker {
    async fn process(&self, claim: Claim) {
        let job_id = claim.id().to_string();
        debug!(queue = %self.queue, job_id = %job_id, "Processing job");

        let outcome =
            tokio::time::timeout(self.timeout, self.analyzer.analyze(&claim.job.payload)).await;
        let result = match outcome {
            Ok(Ok(text)) if !text.trim().is_empty() => Ok(text),
            Ok(Ok(_)) => Err("analysis produced an empty result".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("analysis timed out after {:?}", self.timeout)),
        };

        match result {
            Ok(text) => self.finish(&claim, text).await,
            Err(reason) => self.retry_or_fail(&claim, &reason).await,
        }
    }

    async fn finish(&self, claim: &Claim, text: String) {
        let job = match self.backend.complete(claim, text).await {
            Ok(job) => job,
            Err(AppError::LeaseLost(_)) => {
                warn!(job_id = %claim.id(), "Lease lost before completion, result discarded");
                return;
            }
            Err(e) => {
                error!(job_id = %claim.id(), error = %e, "Failed to record job completion");
                return;
            }
        };
        info!(queue = %self.queue, job_id = %job.id, name = %job.name, "Job completed");

        let Some(event) = TaskEvent::completed(&job) else {
            return;
        };
        match self.events.publish(event).await {
            Ok(receivers) => debug!(job_id = %job.id, receivers, "Published completion"),
            Err(e) => warn!(job_id = %job.id, error = %e, "Failed to publish completion"),
        }
    }

    async fn retry_or_fail(&self, claim: &Claim, reason: &str) {
        match self.backend.fail(claim, reason).await {
            Ok(job) if job.state == JobState::Failed => error!(
                queue = %self.queue,
                job_id = %job.id,
                attempts = job.attempts,
                reason,
                "Job failed permanently"
            ),
            Ok(job) => warn!(
                queue = %self.queue,
                job_id = %job.id,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                reason,
                "Job attempt failed, will retry"
            ),
            Err(AppError::LeaseLost(_)) => {
                warn!(job_id = %claim.id(), "Lease lost before failure was recorded")
            }
            Err(e) => error!(job_id = %claim.id(), error = %e, "Failed to record job failure"),
        }
    }
}

pub struct WorkerPool {
    worker: Worker,
    semaphore: Arc<Semaphore>,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    lease: Duration,
    idle_poll: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: QueueName,
        backend: Arc<dyn QueueBackend>,
        analyzer: Arc<dyn Analyzer>,
        events: Arc<dyn EventSink>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            worker: Worker {
                queue,
                backend,
                analyzer,
                events,
                timeout: config.analysis_timeout(),
            },
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            limiter: rate_limiter(config),
            lease: config.lease(),
            idle_poll: config.idle_poll(),
        }
    }

    /// Share one claim throttle between several pools.
    pub fn with_limiter(mut self, limiter: Option<Arc<DefaultDirectRateLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn queue(&self) -> QueueName {
        self.worker.queue
    }

    /// Claim and process jobs until `shutdown` flips, then wait for in-flight jobs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let queue = self.worker.queue;
        info!(queue = %queue, concurrency = self.semaphore.available_permits(), "Worker pool started");
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = limiter.until_ready() => {}
                }
            }

            match self.worker.backend.claim(queue, self.lease).await {
                Ok(Some(claim)) => {
                    let worker = self.worker.clone();
                    in_flight.spawn(async move {
                        worker.process(claim).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = self.worker.backend.wait_for_job(queue, self.idle_poll) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(queue = %queue, error = %e, "Claim failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.idle_poll) => {}
                    }
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(queue = %queue, error = %e, "Worker task panicked");
                }
            }
        }

        let draining = in_flight.len();
        if draining > 0 {
            info!(queue = %queue, jobs = draining, "Draining in-flight jobs");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(queue = %queue, error = %e, "Worker task panicked");
            }
        }
        info!(queue = %queue, "Worker pool stopped");
    }
}
