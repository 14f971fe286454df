//! Process-wide handle on the Task Queue.
//!
//! Wraps a [`QueueBackend`] with the configured job defaults and owns the
//! background tasks that serve it: one [`WorkerPool`] per queue and a
//! maintenance loop that recovers stalled jobs and applies retention.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::workers::{rate_limiter, WorkerPool};
use super::{
    Job, JobCounts, JobOptions, JobPayload, MemoryQueue, QueueBackend, QueueName, RedisQueue,
    RetentionPolicy,
};
use crate::agents::Analyzer;
use crate::config::{Config, QueueConfig};
use crate::notify::EventSink;
use crate::types::{AppError, AppResult};

pub struct QueueService {
    backend: Arc<dyn QueueBackend>,
    config: QueueConfig,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueService {
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            backend,
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn memory(config: QueueConfig) -> Self {
        Self::new(Arc::new(MemoryQueue::new()), config)
    }

    /// Redis-backed when `USE_JOB_QUEUE` is set, in-memory otherwise.
    pub async fn connect(config: &Config) -> AppResult<Self> {
        if config.redis.enabled {
            let backend = RedisQueue::connect(&config.redis).await?;
            Ok(Self::new(Arc::new(backend), config.queue.clone()))
        } else {
            info!("Using in-memory job queue");
            Ok(Self::memory(config.queue.clone()))
        }
    }

    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        self.backend.clone()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Default priority for jobs on `queue`. Lower runs sooner.
    pub fn priority_for(&self, queue: QueueName) -> u32 {
        match queue {
            QueueName::ConversationProcessing => self.config.conversation_priority,
            QueueName::SummaryGeneration => self.config.summary_priority,
            QueueName::Analysis | QueueName::Reasoning | QueueName::AnalysisModule => {
                self.config.analysis_priority
            }
        }
    }

    pub async fn enqueue(&self, payload: JobPayload) -> AppResult<Job> {
        let options = JobOptions::from_config(&self.config, self.priority_for(payload.queue()));
        self.enqueue_with(payload, options).await
    }

    pub async fn enqueue_with(&self, payload: JobPayload, options: JobOptions) -> AppResult<Job> {
        payload.validate()?;
        let job = self.backend.enqueue(payload, options).await.map_err(|e| match e {
            AppError::Validation(_) => e,
            other => AppError::Enqueue(other.to_string()),
        })?;
        debug!(job_id = %job.id, queue = %job.queue, priority = job.priority, "Job enqueued");
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> AppResult<Option<Job>> {
        self.backend.get_job(id).await
    }

    pub async fn get_completed(&self, queue: QueueName) -> AppResult<Vec<Job>> {
        self.backend.get_completed(queue).await
    }

    pub async fn counts(&self, queue: QueueName) -> AppResult<JobCounts> {
        self.backend.counts(queue).await
    }

    /// Totals across every queue.
    pub async fn total_counts(&self) -> AppResult<JobCounts> {
        let mut total = JobCounts::default();
        for queue in QueueName::ALL {
            let counts = self.backend.counts(queue).await?;
            total.queued += counts.queued;
            total.active += counts.active;
            total.completed += counts.completed;
            total.failed += counts.failed;
        }
        Ok(total)
    }

    pub async fn ping(&self) -> AppResult<()> {
        self.backend.ping().await
    }

    /// One pass of stall recovery and retention. Returns (recovered, purged).
    pub async fn run_maintenance(&self) -> AppResult<(usize, usize)> {
        maintain(self.backend.as_ref(), &RetentionPolicy::from(&self.config)).await
    }

    /// Spawn a worker pool for every queue plus the maintenance loop.
    pub async fn start(
        &self,
        analyzer: Arc<dyn Analyzer>,
        events: Arc<dyn EventSink>,
    ) -> AppResult<()> {
        self.config.validate()?;
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            warn!("Queue workers already running");
            return Ok(());
        }
        self.shutdown.send_replace(false);

        let limiter = rate_limiter(&self.config);
        for queue in QueueName::ALL {
            let pool = WorkerPool::new(
                queue,
                self.backend.clone(),
                analyzer.clone(),
                events.clone(),
                &self.config,
            )
            .with_limiter(limiter.clone());
            tasks.push(tokio::spawn(pool.run(self.shutdown.subscribe())));
        }

        tasks.push(tokio::spawn(maintenance_loop(
            self.backend.clone(),
            self.config.clone(),
            self.shutdown.subscribe(),
        )));
        info!(
            queues = QueueName::ALL.len(),
            concurrency = self.config.concurrency,
            "Queue workers started"
        );
        Ok(())
    }

    /// Stop claiming, let in-flight jobs finish, and wait for every task.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Queue task ended abnormally");
            }
        }
        info!("Queue workers stopped");
    }
}

async fn maintain(
    backend: &dyn QueueBackend,
    retention: &RetentionPolicy,
) -> AppResult<(usize, usize)> {
    let recovered = backend.recover_stalled().await?;
    let purged = backend.purge(retention).await?;
    if recovered > 0 || purged > 0 {
        info!(recovered, purged, "Queue maintenance");
    }
    Ok((recovered, purged))
}

async fn maintenance_loop(
    backend: Arc<dyn QueueBackend>,
    config: QueueConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let retention = RetentionPolicy::from(&config);
    let mut ticker = tokio::time::interval(config.maintenance_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = maintain(backend.as_ref(), &retention).await {
                    warn!(error = %e, "Queue maintenance failed");
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::notify::NotificationHub;
    use crate::queue::{AnalysisModule, JobState};

    struct Fixed;

    #[async_trait]
    impl Analyzer for Fixed {
        async fn analyze(&self, payload: &JobPayload) -> AppResult<String> {
            Ok(format!("analysis of {}", payload.name()))
        }
    }

    fn config() -> QueueConfig {
        QueueConfig {
            idle_poll_ms: 10,
            backoff_delay_ms: 5,
            maintenance_interval_ms: 20,
            ..QueueConfig::default()
        }
    }

    fn module(module: AnalysisModule) -> JobPayload {
        JobPayload::AnalysisModule {
            module,
            conversation: "user: hello".into(),
            session_id: "session-1".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_priorities_follow_queue() {
        let service = QueueService::memory(config());
        let summary = service
            .enqueue(JobPayload::SummaryGeneration {
                session_id: "s".into(),
                conversation: "user: hi".into(),
            })
            .await
            .unwrap();
        let conversation = service
            .enqueue(JobPayload::ConversationProcessing {
                conversation_id: "c".into(),
                message: "hi".into(),
            })
            .await
            .unwrap();
        let analysis = service.enqueue(module(AnalysisModule::RoughOverview)).await.unwrap();

        assert_eq!(summary.priority, 5);
        assert_eq!(conversation.priority, 1);
        assert_eq!(analysis.priority, 2);
        assert_eq!(analysis.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_payload() {
        let service = QueueService::memory(config());
        let err = service
            .enqueue(JobPayload::Analysis {
                conversation_id: "c".into(),
                content: "  ".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(service.total_counts().await.unwrap(), JobCounts::default());
    }

    #[tokio::test]
    async fn test_start_processes_every_queue_and_shuts_down() {
        let service = QueueService::memory(config());
        service
            .start(Arc::new(Fixed), Arc::new(NotificationHub::new()))
            .await
            .unwrap();

        let module_job = service.enqueue(module(AnalysisModule::RoughOverview)).await.unwrap();
        let reasoning = service
            .enqueue(JobPayload::Reasoning {
                conversation_id: "c".into(),
                context: "ctx".into(),
            })
            .await
            .unwrap();

        for id in [&module_job.id, &reasoning.id] {
            let mut done = None;
            for _ in 0..500 {
                let job = service.get_job(id).await.unwrap().unwrap();
                if job.state == JobState::Completed {
                    done = Some(job);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let job = done.expect("job should complete");
            assert!(job.result.unwrap().starts_with("analysis of"));
        }

        let completed = service.get_completed(QueueName::Reasoning).await.unwrap();
        assert_eq!(completed.len(), 1);

        tokio::time::timeout(Duration::from_secs(5), service.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_rejects_zero_maintenance_interval() {
        let service = QueueService::memory(QueueConfig {
            maintenance_interval_ms: 0,
            ..config()
        });
        let err = service
            .start(Arc::new(Fixed), Arc::new(NotificationHub::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert!(service.tasks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_maintenance_requeues_stalled_job() {
        let service = QueueService::memory(QueueConfig {
            lease_ms: 1,
            ..config()
        });
        let job = service.enqueue(module(AnalysisModule::RoughOverview)).await.unwrap();
        service
            .backend()
            .claim(QueueName::AnalysisModule, Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (recovered, _) = service.run_maintenance().await.unwrap();
        assert_eq!(recovered, 1);
        let job = service.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempts, 1);
    }
}
