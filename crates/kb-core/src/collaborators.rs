//! External collaborator contracts
//!
//! The core never owns business logic; scoring, persistence, answering, the
//! guided admin flow, and the outbound chat transport are invoked through the
//! narrow traits below. Collaborator errors are `anyhow::Error`: the core
//! logs them, feeds them to the retry/breaker machinery, and never inspects
//! their structure.

use std::sync::Arc;

use async_trait::async_trait;

use kb_common::{Event, QueueItem};

/// Outcome of the synchronous layer-1 content check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Reject(RejectAction),
}

/// Enforcement side effects for a vetoed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectAction {
    pub delete_message: bool,
    pub restrict_actor: bool,
    pub reason: String,
}

/// Fast, local content policy check.
///
/// Runs inline on the ingestion path, so it must complete in bounded time
/// and must never call the LLM or any network-bound dependency.
pub trait ContentFilter: Send + Sync {
    fn check(&self, event: &Event) -> Verdict;
}

/// Gamification / business-rule collaborator.
///
/// Must be safe enough to retry, or deduplicate internally (for example via
/// a unique constraint on the message id).
#[async_trait]
pub trait ScoringEngine: Send + Sync {
    async fn apply(&self, event: &Event) -> anyhow::Result<()>;
}

/// Result of type-specific event processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    /// Could not be handled inline; the dispatcher queues it for later.
    Deferred { requires_answer: bool },
}

/// Type-specific handling of an event (answering messages, reconciling
/// edits, reacting to callbacks and reactions).
#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, event: &Event) -> anyhow::Result<ProcessOutcome>;
}

/// Message persistence collaborator, run on its own smaller pool.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn persist(&self, event: &Event) -> anyhow::Result<()>;
}

/// Progress of the exclusive guided flow after consuming one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowProgress {
    InProgress,
    Completed,
    Cancelled,
}

/// Handler for the single active guided multi-step interaction.
#[async_trait]
pub trait SessionFlow: Send + Sync {
    async fn advance(&self, event: &Event) -> anyhow::Result<FlowProgress>;
}

/// Receives queue items whose age exceeded the answer deadline.
#[async_trait]
pub trait DeferredAnswerer: Send + Sync {
    async fn answer(&self, item: &QueueItem) -> anyhow::Result<()>;
}

/// Outbound chat capability surface.
///
/// A small capability interface implemented once by the transport and passed
/// by reference; the core never discovers transport types at runtime.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> anyhow::Result<()>;
    async fn delete(&self, chat_id: i64, message_id: i64) -> anyhow::Result<()>;
    async fn restrict(&self, chat_id: i64, actor_id: i64) -> anyhow::Result<()>;
}

/// Bundle of all collaborators handed to the dispatcher at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub filter: Arc<dyn ContentFilter>,
    pub scoring: Arc<dyn ScoringEngine>,
    pub processor: Arc<dyn EventProcessor>,
    pub store: Arc<dyn MessageStore>,
    pub flow: Arc<dyn SessionFlow>,
    pub deferred: Arc<dyn DeferredAnswerer>,
    pub replies: Arc<dyn ReplySink>,
}
