//! EventDispatcher - layered entry point for inbound events
//!
//! Invoked once per externally delivered event. Layer 1 runs a synchronous
//! content veto inline; layer 2 routes events belonging to the exclusive
//! guided session to its flow handler; layer 3 fans the rest out to
//! independent asynchronous lanes on the task pools. Each lane carries a
//! timeout and, for fan-out lanes, a breaker-guarded retry. Nothing that
//! happens inside a lane ever propagates back to the event source: failures
//! are absorbed at the lane boundary and converted to log records.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use kb_common::{Event, EventKind, QueueItem, Result};

use crate::collaborators::{Collaborators, FlowProgress, ProcessOutcome, RejectAction, Verdict};
use crate::context::CoreContext;
use crate::pool::TaskPool;
use crate::retry::RetryExecutor;

pub struct EventDispatcher {
    ctx: Arc<CoreContext>,
    retry: RetryExecutor,
    collaborators: Collaborators,
}

impl EventDispatcher {
    pub fn new(ctx: Arc<CoreContext>, collaborators: Collaborators) -> Self {
        let retry = RetryExecutor::new(ctx.config().clone());
        Self { ctx, retry, collaborators }
    }

    pub fn context(&self) -> &Arc<CoreContext> {
        &self.ctx
    }

    /// Single entry point, called once per inbound event.
    ///
    /// Performs only layer-1 synchronous work inline and returns without
    /// waiting for any lane, so one event's processing never delays
    /// ingestion of the next.
    pub fn on_event(&self, event: Event) {
        // Layer 1: synchronous veto. A match fully handles the event here.
        match self.collaborators.filter.check(&event) {
            Verdict::Reject(action) => {
                self.enforce_veto(event, action);
                return;
            }
            Verdict::Allow => {}
        }

        // Layer 2: exclusive interactive session claims all input from its
        // actor; no other lane runs for this event.
        if self.ctx.session_gate.matches(event.session_key()) {
            self.submit_flow_lane(event);
            return;
        }

        // Layer 3: independent fan-out lanes by classification.
        self.fan_out(event);
    }

    /// Route queue items whose age exceeded the answer deadline to the
    /// deferred-answer path. The first still-fresh item is reinserted at the
    /// head so it keeps chronological priority, and the pass ends there.
    pub fn sweep_deferred(&self) {
        let deadline = self.ctx.config().queue().answer_deadline();
        let mut routed = 0u32;

        while let Some(item) = self.ctx.queue.poll() {
            if item.age() < deadline {
                self.ctx.queue.offer_head(item);
                break;
            }
            if item.requires_answer {
                routed += 1;
                self.dispatch_deferred(item);
            } else {
                debug!(
                    event_id = %item.event.id,
                    "Dropping expired queue item that needs no answer"
                );
            }
        }

        if routed > 0 {
            debug!(routed = routed, "Deferred-answer sweep routed items");
        }
    }

    /// Submit one deferred-answer lane for a swept queue item.
    pub fn dispatch_deferred(&self, item: QueueItem) {
        let deferred = self.collaborators.deferred.clone();
        let event_id = item.event.id.clone();
        self.spawn_guarded(
            &self.ctx.general_pool,
            "deferred.answer",
            event_id,
            move || {
                let deferred = deferred.clone();
                let item = item.clone();
                async move { deferred.answer(&item).await }
            },
        );
    }

    fn fan_out(&self, event: Event) {
        // Persistence lane, isolated on its own smaller pool.
        {
            let store = self.collaborators.store.clone();
            let work_event = event.clone();
            self.spawn_guarded(
                &self.ctx.persist_pool,
                "store.persist",
                event.id.clone(),
                move || {
                    let store = store.clone();
                    let event = work_event.clone();
                    async move { store.persist(&event).await }
                },
            );
        }

        // Scoring lane for content that earns points.
        if matches!(event.kind, EventKind::Message | EventKind::Reaction) {
            let scoring = self.collaborators.scoring.clone();
            let work_event = event.clone();
            self.spawn_guarded(
                &self.ctx.general_pool,
                "scoring.apply",
                event.id.clone(),
                move || {
                    let scoring = scoring.clone();
                    let event = work_event.clone();
                    async move { scoring.apply(&event).await }
                },
            );
        }

        // Type-specific lane; may defer the event into the queue.
        self.submit_process_lane(event);
    }

    fn submit_process_lane(&self, event: Event) {
        let operation = process_operation(event.kind);
        let processor = self.collaborators.processor.clone();
        let queue = self.ctx.queue.clone();
        let retry = self.retry.clone();
        let breaker = self.ctx.breaker.clone();
        let timeout = self.ctx.config().dispatch().lane_timeout();
        let event_id = event.id.clone();
        let log_id = event_id.clone();

        let submitted = self.ctx.general_pool.submit(operation, async move {
            let work_event = event.clone();
            let work_processor = processor.clone();
            let outcome = tokio::time::timeout(
                timeout,
                retry.run_guarded(&breaker, operation, move || {
                    let processor = work_processor.clone();
                    let event = work_event.clone();
                    async move { processor.process(&event).await }
                }),
            )
            .await;

            match outcome {
                Ok(Ok(ProcessOutcome::Completed)) => {}
                Ok(Ok(ProcessOutcome::Deferred { requires_answer })) => {
                    debug!(
                        operation = operation,
                        event_id = %event.id,
                        requires_answer = requires_answer,
                        "Cannot answer inline, deferring to queue"
                    );
                    // A refused offer is already counted and logged by the queue.
                    let _ = queue.offer_tail(QueueItem::new(event, requires_answer));
                }
                other => log_lane_outcome(operation, &event_id, timeout, other),
            }
        });

        if let Err(error) = submitted {
            debug!(operation = operation, event_id = %log_id, error = %error, "Lane not submitted");
        }
    }

    fn submit_flow_lane(&self, event: Event) {
        let flow = self.collaborators.flow.clone();
        let gate = self.ctx.session_gate.clone();
        let timeout = self.ctx.config().dispatch().lane_timeout();
        let event_id = event.id.clone();

        let submitted = self.ctx.general_pool.submit("session.flow", async move {
            let key = event.session_key();
            match tokio::time::timeout(timeout, flow.advance(&event)).await {
                Err(_) => {
                    metrics::counter!("kudosbot_lane_timeout_total").increment(1);
                    warn!(
                        operation = "session.flow",
                        event_id = %event.id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Guided flow lane timed out"
                    );
                }
                Ok(Err(error)) => {
                    error!(
                        operation = "session.flow",
                        event_id = %event.id,
                        error = %error,
                        "Guided flow failed"
                    );
                }
                Ok(Ok(FlowProgress::InProgress)) => {}
                Ok(Ok(FlowProgress::Completed)) => {
                    info!(
                        operation = "session.flow",
                        chat_id = key.chat_id,
                        actor_id = key.actor_id,
                        "Guided flow completed"
                    );
                    gate.release(key);
                }
                Ok(Ok(FlowProgress::Cancelled)) => {
                    info!(
                        operation = "session.flow",
                        chat_id = key.chat_id,
                        actor_id = key.actor_id,
                        "Guided flow cancelled"
                    );
                    gate.release(key);
                }
            }
        });

        if let Err(error) = submitted {
            debug!(operation = "session.flow", event_id = %event_id, error = %error, "Lane not submitted");
        }
    }

    fn enforce_veto(&self, event: Event, action: RejectAction) {
        info!(
            operation = "moderation.veto",
            event_id = %event.id,
            chat_id = event.chat_id,
            actor_id = event.actor_id,
            reason = %action.reason,
            "Event vetoed by content policy"
        );

        if !action.delete_message && !action.restrict_actor {
            return;
        }

        let replies = self.collaborators.replies.clone();
        let timeout = self.ctx.config().dispatch().lane_timeout();
        let event_id = event.id.clone();

        let submitted = self.ctx.general_pool.submit("moderation.enforce", async move {
            let enforcement = async {
                if action.delete_message {
                    if let Some(message_id) = event.message_id {
                        if let Err(error) = replies.delete(event.chat_id, message_id).await {
                            warn!(
                                operation = "moderation.enforce",
                                event_id = %event.id,
                                error = %error,
                                "Failed to delete vetoed message"
                            );
                        }
                    }
                }
                if action.restrict_actor {
                    if let Err(error) = replies.restrict(event.chat_id, event.actor_id).await {
                        warn!(
                            operation = "moderation.enforce",
                            event_id = %event.id,
                            error = %error,
                            "Failed to restrict actor"
                        );
                    }
                }
            };

            if tokio::time::timeout(timeout, enforcement).await.is_err() {
                metrics::counter!("kudosbot_lane_timeout_total").increment(1);
                warn!(
                    operation = "moderation.enforce",
                    event_id = %event.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Moderation lane timed out"
                );
            }
        });

        if let Err(error) = submitted {
            debug!(operation = "moderation.enforce", event_id = %event_id, error = %error, "Lane not submitted");
        }
    }

    /// Submit a breaker-guarded, retried, timeout-bounded lane.
    fn spawn_guarded<F, Fut>(
        &self,
        pool: &Arc<TaskPool>,
        operation: &'static str,
        event_id: String,
        work: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let retry = self.retry.clone();
        let breaker = self.ctx.breaker.clone();
        let timeout = self.ctx.config().dispatch().lane_timeout();
        let log_id = event_id.clone();

        let submitted = pool.submit(operation, async move {
            let outcome =
                tokio::time::timeout(timeout, retry.run_guarded(&breaker, operation, work)).await;
            log_lane_outcome(operation, &event_id, timeout, outcome);
        });

        if let Err(error) = submitted {
            debug!(operation = operation, event_id = %log_id, error = %error, "Lane not submitted");
        }
    }
}

fn process_operation(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Message => "process.message",
        EventKind::EditedMessage => "process.edited_message",
        EventKind::Reaction => "process.reaction",
        EventKind::Callback => "process.callback",
    }
}

/// Absorb a lane's final outcome into log records and metrics.
///
/// The lane timeout is logged distinctly from business failure, and a policy
/// rejection (circuit open, pool saturated) distinctly from both.
fn log_lane_outcome<T>(
    operation: &'static str,
    event_id: &str,
    timeout: Duration,
    outcome: std::result::Result<Result<T>, tokio::time::error::Elapsed>,
) {
    match outcome {
        Err(_) => {
            metrics::counter!("kudosbot_lane_timeout_total").increment(1);
            warn!(
                operation = operation,
                event_id = event_id,
                timeout_ms = timeout.as_millis() as u64,
                "Lane timed out, abandoning in-flight work"
            );
        }
        Ok(Err(error)) if error.is_rejection() => {
            debug!(
                operation = operation,
                event_id = event_id,
                error = %error,
                "Lane rejected by policy"
            );
        }
        Ok(Err(error)) => {
            error!(
                operation = operation,
                event_id = event_id,
                error = %error,
                "Lane failed"
            );
        }
        Ok(Ok(_)) => {}
    }
}
