//! API surface tests over an in-process dispatcher with no-op collaborators.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

use kb_api::create_router;
use kb_common::{CoreConfig, Event, QueueItem};
use kb_core::{
    Collaborators, ContentFilter, CoreContext, DeferredAnswerer, EventDispatcher,
    EventProcessor, FlowProgress, MessageStore, ProcessOutcome, ReplySink, ScoringEngine,
    SessionFlow, Verdict,
};

struct NoopCollaborators {
    processed: Arc<AtomicU32>,
}

impl ContentFilter for NoopCollaborators {
    fn check(&self, _event: &Event) -> Verdict {
        Verdict::Allow
    }
}

#[async_trait]
impl ScoringEngine for NoopCollaborators {
    async fn apply(&self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl EventProcessor for NoopCollaborators {
    async fn process(&self, _event: &Event) -> anyhow::Result<ProcessOutcome> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessOutcome::Completed)
    }
}

#[async_trait]
impl MessageStore for NoopCollaborators {
    async fn persist(&self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SessionFlow for NoopCollaborators {
    async fn advance(&self, _event: &Event) -> anyhow::Result<FlowProgress> {
        Ok(FlowProgress::Completed)
    }
}

#[async_trait]
impl DeferredAnswerer for NoopCollaborators {
    async fn answer(&self, _item: &QueueItem) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ReplySink for NoopCollaborators {
    async fn send(&self, _chat_id: i64, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn delete(&self, _chat_id: i64, _message_id: i64) -> anyhow::Result<()> {
        Ok(())
    }

    async fn restrict(&self, _chat_id: i64, _actor_id: i64) -> anyhow::Result<()> {
        Ok(())
    }
}

fn build_app() -> (axum::Router, Arc<EventDispatcher>, Arc<AtomicU32>) {
    let processed = Arc::new(AtomicU32::new(0));
    let shared = Arc::new(NoopCollaborators { processed: processed.clone() });
    let collaborators = Collaborators {
        filter: shared.clone(),
        scoring: shared.clone(),
        processor: shared.clone(),
        store: shared.clone(),
        flow: shared.clone(),
        deferred: shared.clone(),
        replies: shared,
    };
    let ctx = CoreContext::new(CoreConfig::default());
    let dispatcher = Arc::new(EventDispatcher::new(ctx, collaborators));
    (create_router(dispatcher.clone()), dispatcher, processed)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_up() {
    let (app, _dispatcher, _) = build_app();

    let response =
        app.oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "UP");
}

#[tokio::test]
async fn probes_answer() {
    let (app, _dispatcher, _) = build_app();

    let live = app
        .clone()
        .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(live.status(), StatusCode::OK);

    let ready =
        app.oneshot(Request::get("/health/ready").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
}

#[tokio::test]
async fn monitoring_returns_a_full_report() {
    let (app, _dispatcher, _) = build_app();

    let response =
        app.oneshot(Request::get("/api/monitoring").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "Healthy");
    assert_eq!(json["queue"]["size"], 0);
    assert_eq!(json["pools"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn injected_event_is_dispatched() {
    let (app, _dispatcher, processed) = build_app();

    let request = Request::post("/api/events")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({
                "kind": "Message",
                "chat_id": 1,
                "actor_id": 2,
                "text": "hello"
            })
            .to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let json = body_json(response).await;
    assert!(json["event_id"].as_str().is_some());

    for _ in 0..100 {
        if processed.load(Ordering::SeqCst) == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("injected event was never processed");
}

#[tokio::test]
async fn config_reload_changes_live_settings() {
    let (app, dispatcher, _) = build_app();

    let mut config = dispatcher.context().config().snapshot();
    config.retry.max_retries = 8;

    let request = Request::post("/api/config/reload")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&config).unwrap()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(dispatcher.context().config().retry().max_retries, 8);
}

#[tokio::test]
async fn circuit_reset_closes_an_open_circuit() {
    let (app, dispatcher, _) = build_app();
    let breaker = &dispatcher.context().breaker;
    for _ in 0..5 {
        breaker.record_failure("scoring.apply", "down");
    }
    assert!(!breaker.is_allowed("scoring.apply"));

    let response = app
        .oneshot(
            Request::post("/api/monitoring/circuits/scoring.apply/reset")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(breaker.is_allowed("scoring.apply"));
}
