use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::delivery::{ConversationChannel, DeliveryReport, Insight, ResultDelivery};
use super::gateway::JobGateway;
use super::outstanding::OutstandingJobs;
use super::tracker::{ConversationTurn, TurnTracker};
use crate::config::DeliveryConfig;
use crate::models::{ChatMessage, DispatchRequest};
use crate::notify::TaskEvent;
use crate::types::AppResult;

/// Drives one kiosk conversation: analyzes new user turns in the background
/// and feeds the results back into the conversation.
pub struct KioskSession {
    session_id: String,
    gateway: Arc<dyn JobGateway>,
    channel: Arc<dyn ConversationChannel>,
    tracker: TurnTracker,
    delivery: ResultDelivery,
    history: Vec<ChatMessage>,
    poll_interval: Duration,
    paused: bool,
}

impl KioskSession {
    pub fn new(
        session_id: impl Into<String>,
        gateway: Arc<dyn JobGateway>,
        channel: Arc<dyn ConversationChannel>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            gateway,
            channel,
            tracker: TurnTracker::new(),
            delivery: ResultDelivery::new(OutstandingJobs::new(
                config.not_found_limit,
                config.outstanding_ttl(),
            )),
            history: Vec::new(),
            poll_interval: config.poll_interval(),
            paused: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn outstanding(&self) -> Vec<String> {
        self.delivery.outstanding().ids()
    }

    pub fn insights(&self) -> &[Insight] {
        self.delivery.insights()
    }

    /// While paused, turns are recorded but not analyzed.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Record a turn and dispatch analysis if it is a new user turn.
    /// Returns the ids of the jobs it started.
    pub async fn handle_turn(&mut self, turn: ConversationTurn) -> AppResult<Vec<String>> {
        if !turn.is_injected() {
            self.history
                .push(ChatMessage::new(turn.role.clone(), turn.content.clone()));
        }
        if self.paused || !self.tracker.should_analyze(&turn) {
            return Ok(Vec::new());
        }

        let request = DispatchRequest {
            messages: self.history.clone(),
            session_id: self.session_id.clone(),
        };
        let ids = self.gateway.dispatch(&request).await?;
        debug!(session_id = %self.session_id, jobs = ids.len(), "Analysis dispatched");
        self.delivery.track(ids.iter().cloned());
        Ok(ids)
    }

    /// Poll everything outstanding once and deliver what finished.
    pub async fn poll_once(&mut self) -> AppResult<DeliveryReport> {
        let mut report = DeliveryReport {
            dropped: self.delivery.expire(),
            ..DeliveryReport::default()
        };
        if self.delivery.outstanding().is_empty() {
            return Ok(report);
        }

        let entries = self.gateway.poll(&self.delivery.outstanding().ids()).await?;
        let polled = self
            .delivery
            .apply_poll(&entries, self.channel.as_ref())
            .await;
        report.delivered = polled.delivered;
        report.failed = polled.failed;
        report.dropped.extend(polled.dropped);
        Ok(report)
    }

    pub async fn apply_event(&mut self, event: &TaskEvent) -> bool {
        if event.conversation_id != self.session_id {
            return false;
        }
        self.delivery
            .apply_event(event, self.channel.as_ref())
            .await
    }

    /// Consume turns until the sender closes or `shutdown` flips, polling on
    /// the configured interval while any job is outstanding.
    pub async fn run(
        mut self,
        mut turns: mpsc::Receiver<ConversationTurn>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        info!(session_id = %self.session_id, "Kiosk session started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut open = true;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                turn = turns.recv(), if open => match turn {
                    Some(turn) => {
                        if let Err(e) = self.handle_turn(turn).await {
                            warn!(session_id = %self.session_id, error = %e, "Analysis request failed");
                        }
                    }
                    None => open = false,
                },
                _ = ticker.tick() => {
                    if self.delivery.outstanding().is_empty() {
                        if !open {
                            break;
                        }
                        continue;
                    }
                    match self.poll_once().await {
                        Ok(report) if !report.is_empty() => debug!(
                            delivered = report.delivered.len(),
                            failed = report.failed.len(),
                            dropped = report.dropped.len(),
                            "Poll applied"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(session_id = %self.session_id, error = %e, "Poll failed"),
                    }
                }
            }
        }
        info!(
            session_id = %self.session_id,
            insights = self.delivery.insights().len(),
            "Kiosk session ended"
        );
        self
    }
}
