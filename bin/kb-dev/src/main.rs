//! KudosBot Development Monolith
//!
//! All-in-one binary for local development containing:
//! - The inbound-event resilience core (dispatcher, queue, breakers, pools)
//! - In-process development collaborators (blocklist filter, in-memory
//!   scoring, echo answerer, logging reply sink)
//! - Status/administration API (for injecting events and watching state)
//!
//! Inject events with:
//! `curl -X POST localhost:8080/api/events -H 'content-type: application/json' \
//!   -d '{"kind":"Message","chat_id":1,"actor_id":2,"text":"hello"}'`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use kb_api::create_router;
use kb_common::{CoreConfig, Event, EventKind, QueueItem};
use kb_core::{
    Collaborators, ContentFilter, CoreContext, DeferredAnswerer, EventDispatcher,
    EventProcessor, ExclusiveSessionGate, FlowProgress, LifecycleConfig, LifecycleManager,
    MessageStore, ProcessOutcome, RejectAction, ReplySink, ScoringEngine, SessionFlow,
    Verdict,
};

/// KudosBot Development Server
#[derive(Parser, Debug)]
#[command(name = "kb-dev")]
#[command(about = "KudosBot Development Monolith - core plus dev collaborators")]
struct Args {
    /// API server port
    #[arg(long, env = "KB_API_PORT", default_value = "8080")]
    api_port: u16,

    /// Backpressure queue capacity
    #[arg(long, env = "KB_QUEUE_CAPACITY", default_value = "512")]
    queue_capacity: usize,

    /// General pool worker count
    #[arg(long, env = "KB_GENERAL_WORKERS", default_value = "16")]
    general_workers: u32,

    /// Persistence pool worker count
    #[arg(long, env = "KB_PERSIST_WORKERS", default_value = "4")]
    persist_workers: u32,

    /// Per-lane timeout in milliseconds
    #[arg(long, env = "KB_LANE_TIMEOUT_MS", default_value = "10000")]
    lane_timeout_ms: u64,

    /// Comma-separated list of vetoed words
    #[arg(long, env = "KB_BLOCKLIST", default_value = "casino,airdrop")]
    blocklist: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    info!("Starting KudosBot Dev Monolith");
    info!("API port: {}", args.api_port);

    // 1. Build core configuration from arguments
    let mut config = CoreConfig::default();
    config.queue.capacity = args.queue_capacity;
    config.general_pool.workers = args.general_workers;
    config.persist_pool.workers = args.persist_workers;
    config.dispatch.lane_timeout_ms = args.lane_timeout_ms;

    // 2. Create the core context (queue, breakers, pools, session gate)
    let ctx = CoreContext::new(config);

    // 3. Wire development collaborators
    let replies: Arc<dyn ReplySink> = Arc::new(LogReplySink);
    let blocklist: Vec<String> = args
        .blocklist
        .split(',')
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    info!(blocklist = ?blocklist, "Content filter configured");

    let collaborators = Collaborators {
        filter: Arc::new(BlocklistFilter { blocklist }),
        scoring: Arc::new(InMemoryScoring { scores: DashMap::new() }),
        processor: Arc::new(EchoProcessor {
            replies: replies.clone(),
            session_gate: ctx.session_gate.clone(),
        }),
        store: Arc::new(LogStore),
        flow: Arc::new(DevSetupFlow { replies: replies.clone() }),
        deferred: Arc::new(LateAnswerer { replies: replies.clone() }),
        replies,
    };

    // 4. Create the dispatcher and its lifecycle tasks
    let dispatcher = Arc::new(EventDispatcher::new(ctx.clone(), collaborators));
    let lifecycle = LifecycleManager::start(dispatcher.clone(), LifecycleConfig::default());

    // 5. Start the API server
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let app = create_router(dispatcher.clone()).layer(TraceLayer::new_for_http());

    let api_addr = format!("0.0.0.0:{}", args.api_port);
    info!("API server listening on http://{}", api_addr);
    let api_listener = TcpListener::bind(&api_addr).await?;
    let api_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let server = axum::serve(api_listener, app);
            tokio::select! {
                result = server => {
                    if let Err(e) = result {
                        error!("API server error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("API server shutting down");
                }
            }
        })
    };

    info!("KudosBot Dev Monolith started successfully");
    info!("Press Ctrl+C to shutdown");

    // 6. Wait for shutdown signal, then tear down in order
    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    let _ = shutdown_tx.send(());
    lifecycle.shutdown();
    ctx.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(10), api_handle).await;

    info!("KudosBot Dev Monolith shutdown complete");
    Ok(())
}

// ============================================================================
// Development collaborators
// ============================================================================

/// Layer-1 veto against a fixed word blocklist.
struct BlocklistFilter {
    blocklist: Vec<String>,
}

impl ContentFilter for BlocklistFilter {
    fn check(&self, event: &Event) -> Verdict {
        let Some(text) = &event.text else { return Verdict::Allow };
        let lowered = text.to_lowercase();
        for word in &self.blocklist {
            if lowered.contains(word.as_str()) {
                return Verdict::Reject(RejectAction {
                    delete_message: true,
                    restrict_actor: false,
                    reason: format!("blocklisted word {word:?}"),
                });
            }
        }
        Verdict::Allow
    }
}

/// In-memory score table standing in for the gamification backend.
struct InMemoryScoring {
    scores: DashMap<i64, u64>,
}

#[async_trait]
impl ScoringEngine for InMemoryScoring {
    async fn apply(&self, event: &Event) -> anyhow::Result<()> {
        let points = match event.kind {
            EventKind::Message => 2,
            EventKind::Reaction => 1,
            _ => 0,
        };
        if points > 0 {
            let mut score = self.scores.entry(event.actor_id).or_insert(0);
            *score += points;
            debug!(actor_id = event.actor_id, score = *score, "Score updated");
        }
        Ok(())
    }
}

/// Echo answerer standing in for the LLM-backed processor.
///
/// Questions are deferred into the queue (pretending a knowledge-base lookup
/// is needed); everything else is acknowledged inline. A "/setup" callback
/// claims the exclusive session slot to start the guided flow.
struct EchoProcessor {
    replies: Arc<dyn ReplySink>,
    session_gate: Arc<ExclusiveSessionGate>,
}

#[async_trait]
impl EventProcessor for EchoProcessor {
    async fn process(&self, event: &Event) -> anyhow::Result<ProcessOutcome> {
        match event.kind {
            EventKind::Message => {
                let text = event.text.as_deref().unwrap_or_default();
                if text.contains('?') {
                    return Ok(ProcessOutcome::Deferred { requires_answer: true });
                }
                self.replies.send(event.chat_id, &format!("noted: {text}")).await?;
                Ok(ProcessOutcome::Completed)
            }
            EventKind::Callback => {
                if event.text.as_deref() == Some("/setup")
                    && self.session_gate.claim(event.session_key())
                {
                    self.replies
                        .send(event.chat_id, "setup started, send /done to finish")
                        .await?;
                }
                Ok(ProcessOutcome::Completed)
            }
            EventKind::EditedMessage | EventKind::Reaction => {
                debug!(event_id = %event.id, kind = event.kind.as_str(), "Acknowledged");
                Ok(ProcessOutcome::Completed)
            }
        }
    }
}

/// Persistence stand-in; logs instead of writing to a database.
struct LogStore;

#[async_trait]
impl MessageStore for LogStore {
    async fn persist(&self, event: &Event) -> anyhow::Result<()> {
        debug!(event_id = %event.id, kind = event.kind.as_str(), "Event persisted");
        Ok(())
    }
}

/// Minimal guided flow: any input advances, "/done" completes.
struct DevSetupFlow {
    replies: Arc<dyn ReplySink>,
}

#[async_trait]
impl SessionFlow for DevSetupFlow {
    async fn advance(&self, event: &Event) -> anyhow::Result<FlowProgress> {
        match event.text.as_deref() {
            Some("/done") => {
                self.replies.send(event.chat_id, "setup complete").await?;
                Ok(FlowProgress::Completed)
            }
            Some("/cancel") => Ok(FlowProgress::Cancelled),
            other => {
                debug!(input = ?other, "Setup flow step");
                Ok(FlowProgress::InProgress)
            }
        }
    }
}

/// Answers swept queue items with an apology for the delay.
struct LateAnswerer {
    replies: Arc<dyn ReplySink>,
}

#[async_trait]
impl DeferredAnswerer for LateAnswerer {
    async fn answer(&self, item: &QueueItem) -> anyhow::Result<()> {
        self.replies
            .send(
                item.session_key.chat_id,
                "sorry for the delay, still looking into that one",
            )
            .await
    }
}

/// Outbound transport stand-in; logs every call.
struct LogReplySink;

#[async_trait]
impl ReplySink for LogReplySink {
    async fn send(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        info!(chat_id = chat_id, text = text, "Reply sent");
        Ok(())
    }

    async fn delete(&self, chat_id: i64, message_id: i64) -> anyhow::Result<()> {
        info!(chat_id = chat_id, message_id = message_id, "Message deleted");
        Ok(())
    }

    async fn restrict(&self, chat_id: i64, actor_id: i64) -> anyhow::Result<()> {
        info!(chat_id = chat_id, actor_id = actor_id, "Actor restricted");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
