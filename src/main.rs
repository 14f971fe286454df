use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use blue_booth::agents::LlmAnalyzer;
use blue_booth::client::{
    ConversationChannel, ConversationTurn, HttpGateway, KioskSession, OutboundMessage,
};
use blue_booth::config::Config;
use blue_booth::notify::{EventSink, NotificationHub, RedisEventRelay, RedisEventSink};
use blue_booth::queue::QueueService;
use blue_booth::types::AppResult;
use blue_booth::utils::init_logger;
use blue_booth::{create_router, AppState};

#[derive(Parser)]
#[command(name = "blue-booth", about = "Background analysis for the Little Blue Booth kiosk")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and the queue workers (default)
    Serve,
    /// Run queue workers only
    Worker,
    /// Drive a kiosk session from stdin against a running server
    Kiosk {
        #[arg(long, default_value = "http://localhost:3000")]
        base_url: String,
        #[arg(long)]
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _log_guard = init_logger(&config.logging);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Worker => worker(config).await,
        Commands::Kiosk {
            base_url,
            session_id,
        } => kiosk(config, &base_url, &session_id).await,
    }
}

/// Where completions go, plus the relay task feeding the local hub when
/// events travel through Redis.
async fn event_pipeline(
    config: &Config,
    hub: Arc<NotificationHub>,
    shutdown: watch::Receiver<bool>,
) -> Result<(Arc<dyn EventSink>, Option<JoinHandle<AppResult<()>>>)> {
    if !config.redis.enabled {
        let events: Arc<dyn EventSink> = hub;
        return Ok((events, None));
    }
    let client = redis::Client::open(config.redis.url.as_str())?;
    let conn = redis::aio::ConnectionManager::new(client.clone()).await?;
    let sink = RedisEventSink::new(conn, &config.redis.key_prefix);
    let relay = RedisEventRelay::new(client, &config.redis.key_prefix, hub);
    let events: Arc<dyn EventSink> = Arc::new(sink);
    Ok((events, Some(tokio::spawn(relay.run(shutdown)))))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}

async fn stop_relay(relay: Option<JoinHandle<AppResult<()>>>) {
    if let Some(handle) = relay {
        match handle.await {
            Ok(Err(e)) => error!(error = %e, "Event relay failed"),
            Err(e) => error!(error = %e, "Event relay task panicked"),
            Ok(Ok(())) => {}
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    info!(server = ?config.server, redis = config.redis.enabled, "Configuration loaded");
    let (stop_tx, stop_rx) = watch::channel(false);

    let hub = Arc::new(NotificationHub::new());
    let queue = Arc::new(QueueService::connect(&config).await?);
    let (events, relay) = event_pipeline(&config, hub.clone(), stop_rx).await?;
    queue
        .start(Arc::new(LlmAnalyzer::from_config(&config.llm)), events)
        .await?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let state = AppState::new(config, queue.clone(), hub);
    let app = create_router(state);

    info!("Server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    queue.shutdown().await;
    let _ = stop_tx.send(true);
    stop_relay(relay).await;
    Ok(())
}

/// Standalone workers only see jobs through the shared Redis queue.
fn ensure_shared_queue(config: &Config) -> Result<()> {
    if !config.redis.enabled {
        anyhow::bail!("the worker command needs the shared Redis queue; set USE_JOB_QUEUE=true");
    }
    Ok(())
}

async fn worker(config: Config) -> Result<()> {
    ensure_shared_queue(&config)?;
    let queue = QueueService::connect(&config).await?;
    let hub = Arc::new(NotificationHub::new());
    let (stop_tx, stop_rx) = watch::channel(false);
    let (events, relay) = event_pipeline(&config, hub, stop_rx).await?;

    queue
        .start(Arc::new(LlmAnalyzer::from_config(&config.llm)), events)
        .await?;
    shutdown_signal().await;
    queue.shutdown().await;
    let _ = stop_tx.send(true);
    stop_relay(relay).await;
    Ok(())
}

struct StdoutChannel;

#[async_trait]
impl ConversationChannel for StdoutChannel {
    async fn inject(&self, message: OutboundMessage) -> AppResult<()> {
        println!("{}: {}", message.role, message.content);
        Ok(())
    }
}

async fn kiosk(config: Config, base_url: &str, session_id: &str) -> Result<()> {
    let session = KioskSession::new(
        session_id,
        Arc::new(HttpGateway::new(base_url)),
        Arc::new(StdoutChannel),
        &config.delivery,
    );
    let (turn_tx, turn_rx) = mpsc::channel(32);
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    // Lines prefixed with "assistant:" are assistant turns, all others user turns
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let turn = match line.strip_prefix("assistant:") {
                Some(rest) => ConversationTurn::assistant(rest.trim()),
                None => ConversationTurn::user(line),
            };
            if turn_tx.send(turn).await.is_err() {
                break;
            }
        }
    });

    let session = session.run(turn_rx, stop_rx).await;
    for insight in session.insights() {
        info!(job_id = %insight.id, "Insight recorded");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_requires_redis_queue() {
        let mut config = Config::default();
        let err = ensure_shared_queue(&config).unwrap_err();
        assert!(err.to_string().contains("USE_JOB_QUEUE"));

        config.redis.enabled = true;
        assert!(ensure_shared_queue(&config).is_ok());
    }
}
