//! Carry task events across processes through Redis pub/sub.
//!
//! Workers running in their own process publish with [`RedisEventSink`]; the
//! HTTP process runs a [`RedisEventRelay`] that re-publishes every message into
//! its local [`NotificationHub`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{EventSink, NotificationHub, TaskEvent};
use crate::types::{AppError, AppResult};

fn channel_prefix(prefix: &str) -> String {
    format!("{}:events:", prefix)
}

pub struct RedisEventSink {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisEventSink {
    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: channel_prefix(prefix),
        }
    }
}

#[async_trait]
impl EventSink for RedisEventSink {
    async fn publish(&self, event: TaskEvent) -> AppResult<usize> {
        let channel = format!("{}{}", self.prefix, event.conversation_id);
        let body = serde_json::to_string(&event)?;
        let mut conn = self.conn.clone();
        let receivers: usize = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::Channel(format!("publish to {} failed: {}", channel, e)))?;
        Ok(receivers)
    }
}

pub struct RedisEventRelay {
    client: redis::Client,
    prefix: String,
    hub: Arc<NotificationHub>,
}

impl RedisEventRelay {
    pub fn new(client: redis::Client, prefix: &str, hub: Arc<NotificationHub>) -> Self {
        Self {
            client,
            prefix: channel_prefix(prefix),
            hub,
        }
    }

    /// Forward events into the hub until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        let pattern = format!("{}*", self.prefix);
        pubsub.psubscribe(&pattern).await?;
        info!(pattern = %pattern, "Relaying task events from Redis");

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                message = messages.next() => {
                    let Some(message) = message else {
                        warn!("Redis event subscription closed");
                        break;
                    };
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(error = %e, "Unreadable task event payload");
                            continue;
                        }
                    };
                    match serde_json::from_str::<TaskEvent>(&payload) {
                        Ok(event) => {
                            let job_id = event.job_id.clone();
                            match self.hub.send(event) {
                                Ok(n) => debug!(job_id = %job_id, receivers = n, "Relayed task event"),
                                Err(e) => warn!(job_id = %job_id, error = %e, "Failed to relay task event"),
                            }
                        }
                        Err(e) => warn!(error = %e, "Malformed task event on Redis channel"),
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::notify::TaskEventKind;
    use crate::queue::{AnalysisModule, QueueName};

    fn event(conversation: &str) -> TaskEvent {
        TaskEvent {
            event: TaskEventKind::AnalysisCompleted,
            conversation_id: conversation.to_string(),
            job_id: "roughOverview-1".to_string(),
            queue: QueueName::AnalysisModule,
            module: Some(AnalysisModule::RoughOverview),
            result: "R1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_relay_forwards_published_events_into_hub() {
        // Needs a live server.
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let client = redis::Client::open(url.as_str()).unwrap();
        let conn = ConnectionManager::new(client.clone()).await.unwrap();
        let prefix = format!("booth-test-{}", uuid::Uuid::new_v4());

        let hub = Arc::new(NotificationHub::new());
        let mut mine = hub.subscribe("conv-1").unwrap();
        let mut other = hub.subscribe("conv-2").unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let relay = tokio::spawn(RedisEventRelay::new(client, &prefix, hub.clone()).run(stop_rx));

        let sink = RedisEventSink::new(conn, &prefix);
        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.publish(event("conv-1")).await.unwrap() == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("relay never subscribed");

        let received = tokio::time::timeout(Duration::from_secs(5), mine.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, event("conv-1"));
        assert!(other.try_recv().is_err());

        stop_tx.send(true).unwrap();
        relay.await.unwrap().unwrap();
    }
}
