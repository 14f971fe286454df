//! Result delivery into a live conversation.
//!
//! Completions arrive either from a poll or from a push event. Both paths go
//! through [`ResultDelivery::deliver`], which keeps a set of delivered job
//! ids, so each result becomes exactly one [`Insight`] and one injected message
//! no matter how many times or which way it is observed.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::outstanding::OutstandingJobs;
use super::tracker::ANALYSIS_MARKER;
use crate::models::{PollEntry, PollStatus};
use crate::notify::TaskEvent;
use crate::types::AppResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    /// Id of the job that produced it
    pub id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub role: String,
    pub content: String,
}

impl OutboundMessage {
    pub fn background_analysis(result: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: format!("{} {}", ANALYSIS_MARKER, result),
        }
    }
}

/// The live conversation results are injected into.
#[async_trait]
pub trait ConversationChannel: Send + Sync {
    async fn inject(&self, message: OutboundMessage) -> AppResult<()>;
}

/// What one poll or event changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
    pub dropped: Vec<String>,
}

impl DeliveryReport {
    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty() && self.failed.is_empty() && self.dropped.is_empty()
    }
}

pub struct ResultDelivery {
    outstanding: OutstandingJobs,
    insights: Vec<Insight>,
    delivered: HashSet<String>,
}

impl ResultDelivery {
    pub fn new(outstanding: OutstandingJobs) -> Self {
        Self {
            outstanding,
            insights: Vec::new(),
            delivered: HashSet::new(),
        }
    }

    pub fn outstanding(&self) -> &OutstandingJobs {
        &self.outstanding
    }

    pub fn track<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outstanding.extend(ids);
    }

    pub fn insights(&self) -> &[Insight] {
        &self.insights
    }

    /// Record a completion. Returns false if this job was already delivered.
    pub async fn deliver(
        &mut self,
        job_id: &str,
        content: &str,
        channel: &dyn ConversationChannel,
    ) -> bool {
        self.outstanding.remove(job_id);
        if !self.delivered.insert(job_id.to_string()) {
            debug!(job_id, "Result already delivered");
            return false;
        }

        self.insights.push(Insight {
            id: job_id.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        });
        if let Err(e) = channel
            .inject(OutboundMessage::background_analysis(content))
            .await
        {
            warn!(job_id, error = %e, "Failed to inject analysis into conversation");
        }
        info!(job_id, "Delivered background analysis");
        true
    }

    pub async fn apply_poll(
        &mut self,
        entries: &[PollEntry],
        channel: &dyn ConversationChannel,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for entry in entries {
            let id = entry.job_id.as_str();
            match entry.status {
                PollStatus::Completed => match entry.data.as_deref() {
                    Some(data) => {
                        if self.deliver(id, data, channel).await {
                            report.delivered.push(id.to_string());
                        }
                    }
                    None => {
                        warn!(job_id = id, "Completed job reported without data");
                        self.outstanding.remove(id);
                        report.dropped.push(id.to_string());
                    }
                },
                PollStatus::Failed => {
                    if self.outstanding.remove(id) {
                        warn!(job_id = id, reason = ?entry.error, "Background analysis failed");
                        report.failed.push(id.to_string());
                    }
                }
                PollStatus::NotFound => {
                    if self.outstanding.observe_not_found(id) {
                        warn!(job_id = id, "Job no longer known to the queue, giving up");
                        report.dropped.push(id.to_string());
                    }
                }
                PollStatus::Queued | PollStatus::Active => self.outstanding.observe_live(id),
            }
        }
        report
    }

    /// Push path. Converges with polling on the same delivered set.
    pub async fn apply_event(&mut self, event: &TaskEvent, channel: &dyn ConversationChannel) -> bool {
        self.deliver(&event.job_id, &event.result, channel).await
    }

    /// Stop waiting on ids past the client timeout.
    pub fn expire(&mut self) -> Vec<String> {
        let expired = self.outstanding.expire();
        for id in &expired {
            warn!(job_id = %id, "Gave up waiting for background analysis");
        }
        expired
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::notify::TaskEventKind;
    use crate::queue::{AnalysisModule, QueueName};

    #[derive(Default)]
    pub(crate) struct RecordingChannel {
        pub messages: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl ConversationChannel for RecordingChannel {
        async fn inject(&self, message: OutboundMessage) -> AppResult<()> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn delivery(ids: &[&str]) -> ResultDelivery {
        let mut delivery = ResultDelivery::new(OutstandingJobs::new(3, Duration::from_secs(600)));
        delivery.track(ids.iter().copied());
        delivery
    }

    fn entry(id: &str, status: PollStatus, data: Option<&str>) -> PollEntry {
        PollEntry {
            job_id: id.into(),
            status,
            data: data.map(String::from),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_completed_entries_become_insights_once() {
        let channel = RecordingChannel::default();
        let mut delivery = delivery(&["a", "b"]);

        let entries = vec![
            entry("b", PollStatus::Completed, Some("R2")),
            entry("a", PollStatus::Completed, Some("R1")),
        ];
        let report = delivery.apply_poll(&entries, &channel).await;
        assert_eq!(report.delivered, vec!["b", "a"]);
        assert!(delivery.outstanding().is_empty());

        let again = delivery.apply_poll(&entries, &channel).await;
        assert!(again.is_empty());
        assert_eq!(delivery.insights().len(), 2);

        let messages = channel.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "[Background Analysis] R1");
    }

    #[tokio::test]
    async fn test_failed_and_pending_entries() {
        let channel = RecordingChannel::default();
        let mut delivery = delivery(&["a", "b"]);
        let report = delivery
            .apply_poll(
                &[entry("a", PollStatus::Failed, None), entry("b", PollStatus::Active, None)],
                &channel,
            )
            .await;
        assert_eq!(report.failed, vec!["a"]);
        assert_eq!(delivery.outstanding().ids(), vec!["b"]);
        assert!(delivery.insights().is_empty());
    }

    #[tokio::test]
    async fn test_not_found_dropped_after_limit() {
        let channel = RecordingChannel::default();
        let mut delivery = delivery(&["gone"]);
        let missing = [entry("gone", PollStatus::NotFound, None)];
        for _ in 0..2 {
            assert!(delivery.apply_poll(&missing, &channel).await.is_empty());
        }
        let report = delivery.apply_poll(&missing, &channel).await;
        assert_eq!(report.dropped, vec!["gone"]);
        assert!(delivery.outstanding().is_empty());
    }

    #[tokio::test]
    async fn test_push_and_pull_converge() {
        let channel = RecordingChannel::default();
        let mut delivery = delivery(&["a"]);
        let event = TaskEvent {
            event: TaskEventKind::AnalysisCompleted,
            conversation_id: "session-1".into(),
            job_id: "a".into(),
            queue: QueueName::AnalysisModule,
            module: Some(AnalysisModule::RoughOverview),
            result: "R1".into(),
        };
        assert!(delivery.apply_event(&event, &channel).await);

        let report = delivery
            .apply_poll(&[entry("a", PollStatus::Completed, Some("R1"))], &channel)
            .await;
        assert!(report.delivered.is_empty());
        assert_eq!(delivery.insights().len(), 1);
        assert_eq!(channel.messages.lock().unwrap().len(), 1);
    }
}
