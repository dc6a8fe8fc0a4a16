//! End-to-end delivery flows over in-memory storage and queue.
//!
//! Drives the engine one batch at a time against a wiremock receiver and
//! advances a shared `TestClock` past each retry delay.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use bastion_core::{
    AttemptStatus, DeliveryEvent, Event, EventHandler, TestClock, WebhookEndpoint,
};
use bastion_delivery::{
    queue::mock::MockJobQueue,
    signing::{self, SIGNATURE_HEADER},
    storage::mock::MockDeliveryStorage,
    DeliveryConfig, DeliveryEngine, JobQueue, RetryPolicy, UrlPolicy,
};
use serde_json::json;
use tokio::sync::Mutex;
use wiremock::{
    matchers::{header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

#[derive(Debug, Default)]
struct RecordingHandler {
    events: Mutex<Vec<DeliveryEvent>>,
}

#[async_trait::async_trait]
impl EventHandler for RecordingHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        self.events.lock().await.push(event);
    }
}

struct Env {
    engine: DeliveryEngine,
    storage: MockDeliveryStorage,
    queue: MockJobQueue,
    clock: TestClock,
    events: Arc<RecordingHandler>,
}

fn env(failure_threshold: u32) -> Result<Env> {
    let clock = TestClock::new();
    let storage = MockDeliveryStorage::new();
    let queue = MockJobQueue::new(Arc::new(clock.clone()));
    let events = Arc::new(RecordingHandler::default());
    let config = DeliveryConfig {
        failure_threshold,
        url_policy: UrlPolicy::development(),
        retry_policy: RetryPolicy::default(),
        ..DeliveryConfig::default()
    };
    let engine = DeliveryEngine::with_event_handler(
        Arc::new(storage.clone()),
        Arc::new(queue.clone()),
        config,
        Arc::new(clock.clone()),
        events.clone(),
    )?;
    Ok(Env { engine, storage, queue, clock, events })
}

async fn register(env: &Env, server: &MockServer) -> WebhookEndpoint {
    let endpoint = WebhookEndpoint::new(
        "acct_1",
        format!("{}/hook", server.uri()),
        "whsec_flow",
        vec!["message.completed".to_string()],
    );
    env.storage.add_endpoint(endpoint.clone()).await;
    endpoint
}

#[tokio::test]
async fn three_server_errors_disable_endpoint_and_stop_retries() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let env = env(3)?;
    let endpoint = register(&env, &server).await;
    let created = env.engine.enqueue_event(Event::new("message.completed", json!({}))).await?;
    let delivery_id = created[0].id;

    assert_eq!(env.engine.process_batch().await?, 1);
    env.clock.advance(Duration::from_secs(10));
    assert_eq!(env.engine.process_batch().await?, 1);
    env.clock.advance(Duration::from_secs(60));
    assert_eq!(env.engine.process_batch().await?, 1);

    let stored = env.storage.endpoint(endpoint.id).await.expect("endpoint exists");
    assert!(!stored.enabled);
    assert_eq!(stored.consecutive_failures, 3);

    let attempt = env.engine.delivery_status(delivery_id).await?.expect("attempt exists");
    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(attempt.attempt, 3);
    assert!(attempt.error.as_deref().unwrap_or_default().starts_with("endpoint disabled"));

    // Nothing is left to pick up, however long we wait.
    assert_eq!(env.queue.depth().await?, 0);
    env.clock.advance(Duration::from_secs(86_400));
    assert_eq!(env.engine.process_batch().await?, 0);

    let stats = env.engine.stats().await;
    assert_eq!(stats.retries_scheduled, 2);
    assert_eq!(stats.endpoints_disabled, 1);

    let events = env.events.events.lock().await;
    assert!(events.iter().any(|e| matches!(e, DeliveryEvent::EndpointDisabled(d)
        if d.webhook_id == endpoint.id && d.consecutive_failures == 3)));
    Ok(())
}

#[tokio::test]
async fn retry_is_not_visible_before_its_delay() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let env = env(10)?;
    register(&env, &server).await;
    env.engine.enqueue_event(Event::new("message.completed", json!({}))).await?;

    assert_eq!(env.engine.process_batch().await?, 1);
    env.clock.advance(Duration::from_secs(9));
    assert_eq!(env.engine.process_batch().await?, 0);
    assert_eq!(env.queue.depth().await?, 1);
    Ok(())
}

#[tokio::test]
async fn disabling_cancels_scheduled_retry() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let env = env(10)?;
    let endpoint = register(&env, &server).await;
    let created = env.engine.enqueue_event(Event::new("message.completed", json!({}))).await?;

    env.engine.process_batch().await?;
    assert!(env.engine.set_endpoint_enabled(endpoint.id, false).await?);
    env.clock.advance(Duration::from_secs(10));
    assert_eq!(env.engine.process_batch().await?, 1);

    let attempt = env.engine.delivery_status(created[0].id).await?.expect("attempt exists");
    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(attempt.error.as_deref(), Some("endpoint disabled"));
    assert_eq!(env.engine.stats().await.skipped, 1);
    Ok(())
}

#[tokio::test]
async fn success_after_failure_resets_counter() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let env = env(3)?;
    let endpoint = register(&env, &server).await;
    let created = env.engine.enqueue_event(Event::new("message.completed", json!({}))).await?;

    env.engine.process_batch().await?;
    assert_eq!(env.storage.endpoint(endpoint.id).await.map(|e| e.consecutive_failures), Some(1));

    env.clock.advance(Duration::from_secs(10));
    env.engine.process_batch().await?;

    let attempt = env.engine.delivery_status(created[0].id).await?.expect("attempt exists");
    assert_eq!(attempt.status, AttemptStatus::Success);
    assert_eq!(attempt.attempt, 2);
    assert_eq!(attempt.response_status, Some(204));
    assert_eq!(env.storage.endpoint(endpoint.id).await.map(|e| e.consecutive_failures), Some(0));
    Ok(())
}

#[tokio::test]
async fn receiver_can_verify_signed_envelope() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header_exists(SIGNATURE_HEADER))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let env = env(3)?;
    let endpoint = register(&env, &server).await;
    let event = Event::new("message.completed", json!({"conversation": "c_1"}));
    let created = env.engine.enqueue_event(event.clone()).await?;
    env.engine.process_batch().await?;

    let requests = server.received_requests().await.unwrap_or_default();
    let request = requests.first().expect("one request received");
    let signature = request
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .expect("signature header");
    assert!(signing::verify(&endpoint.secret, &request.body, signature));

    let body: serde_json::Value = serde_json::from_slice(&request.body)?;
    assert_eq!(body["id"], json!(event.id));
    assert_eq!(body["type"], "message.completed");
    assert_eq!(body["delivery"]["id"], json!(created[0].id));
    assert_eq!(body["delivery"]["attempt"], 1);
    assert_eq!(body["data"]["conversation"], "c_1");
    Ok(())
}
