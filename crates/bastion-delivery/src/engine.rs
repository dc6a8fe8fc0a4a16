//! Entry point for producers and operators of webhook delivery.
//!
//! The engine fans events out into delivery attempts, runs the worker pool
//! and answers status queries.

use std::{sync::Arc, time::Duration};

use bastion_core::{
    Clock, DeliveryAttempt, DeliveryAttemptId, Event, EventHandler, EventId, NoOpEventHandler,
    WebhookEndpoint, WebhookEndpointId,
};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    client::WebhookDeliveryService,
    error::{DeliveryError, Result},
    queue::{DeliveryJob, JobQueue, PostgresJobQueue},
    storage::{AttemptOutcome, DeliveryStorage, PostgresDeliveryStorage},
    url_guard::UrlValidator,
    worker::{DeliveryWorker, WorkerContext},
    worker_pool::WorkerPool,
};
pub use crate::worker::{DeliveryConfig, EngineStats};

/// Main delivery engine coordinating webhook delivery workers.
pub struct DeliveryEngine {
    ctx: WorkerContext,
    validator: Arc<UrlValidator>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates an engine over explicit storage, queue and event handler.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn with_event_handler(
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn JobQueue>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        let validator = Arc::new(UrlValidator::new(config.url_policy.clone()));
        let client =
            Arc::new(WebhookDeliveryService::new(config.client_config.clone(), validator.clone())?);
        let ctx = WorkerContext {
            storage,
            queue,
            client,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            event_handler,
            clock,
        };

        Ok(Self { ctx, validator, cancellation_token: CancellationToken::new(), worker_pool: None })
    }

    /// Creates a Postgres-backed engine that discards outcome events.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(pool: &PgPool, config: DeliveryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let storage = Arc::new(PostgresDeliveryStorage::new(pool.clone()));
        let queue = Arc::new(PostgresJobQueue::new(pool.clone(), clock.clone()));
        Self::with_event_handler(storage, queue, config, clock, Arc::new(NoOpEventHandler))
    }

    /// Starts the worker pool. Returns once workers are spawned.
    ///
    /// # Errors
    ///
    /// Returns error if the engine is already running or the pool fails to
    /// spawn.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }

        info!(
            worker_count = self.ctx.config.worker_count,
            batch_size = self.ctx.config.batch_size,
            "starting webhook delivery engine"
        );

        let mut worker_pool = WorkerPool::new(self.ctx.clone(), self.cancellation_token.clone());
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);
        Ok(())
    }

    /// Stops workers between jobs and waits up to the shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns error if workers do not stop in time or one panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");
        match self.worker_pool.take() {
            Some(pool) => pool.shutdown_graceful(self.ctx.config.shutdown_timeout).await,
            None => {
                info!("delivery engine was not started, shutdown completed immediately");
                Ok(())
            },
        }
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.ctx.stats.read().await.clone()
    }

    /// Processes exactly one batch on the calling task. Returns the number of
    /// jobs leased.
    ///
    /// # Errors
    ///
    /// Returns error if the queue cannot be read.
    pub async fn process_batch(&self) -> Result<usize> {
        DeliveryWorker::new(0, self.ctx.clone(), self.cancellation_token.clone())
            .process_batch()
            .await
    }

    /// Registers or updates an endpoint after validating its URL.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::UnsafeUrl` if the URL is rejected, or a
    /// storage error.
    pub async fn register_endpoint(&self, endpoint: WebhookEndpoint) -> Result<()> {
        self.validator.validate(&endpoint.url).await?;
        self.ctx.storage.upsert_endpoint(endpoint).await?;
        Ok(())
    }

    /// Stores `event` and creates one delivery per subscribed, enabled
    /// endpoint.
    ///
    /// Each endpoint URL is checked here as well as before the send. A
    /// rejected URL produces an attempt that is already failed and no job.
    /// Returns the attempts as created.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails. Queue failures are logged and left
    /// to [`DeliveryEngine::requeue_stranded`].
    pub async fn enqueue_event(&self, event: Event) -> Result<Vec<DeliveryAttempt>> {
        let storage = &self.ctx.storage;
        storage.store_event(event.clone()).await?;
        let endpoints = storage.find_subscribed_endpoints(event.event_type.clone()).await?;
        let max_attempts = self.ctx.config.retry_policy.max_attempts;

        let mut created = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let mut attempt = DeliveryAttempt::first(endpoint.id, &event, max_attempts);
            attempt.scheduled_at = self.ctx.clock.now_utc();
            storage.create_attempt(attempt.clone()).await?;

            if let Err(rejection) = self.validator.validate(&endpoint.url).await {
                warn!(
                    delivery_id = %attempt.id,
                    endpoint_id = %endpoint.id,
                    code = %rejection.code,
                    "endpoint url rejected at enqueue"
                );
                let outcome = AttemptOutcome {
                    response_status: None,
                    response_body: None,
                    error: Some(DeliveryError::from(rejection).to_string()),
                    at: self.ctx.clock.now_utc(),
                };
                storage.mark_failed(attempt.id, attempt.attempt, outcome).await?;
                if let Some(failed) = storage.find_attempt(attempt.id).await? {
                    created.push(failed);
                }
                continue;
            }

            let job = DeliveryJob {
                delivery_id: attempt.id,
                webhook_id: endpoint.id,
                event_id: event.id,
                attempt: attempt.attempt,
            };
            if let Err(error) = self.ctx.queue.enqueue(job, Duration::ZERO).await {
                warn!(delivery_id = %attempt.id, error = %error, "failed to enqueue delivery");
            }
            created.push(attempt);
        }

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            deliveries = created.len(),
            "event enqueued for delivery"
        );
        Ok(created)
    }

    /// Current state of one delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn delivery_status(&self, id: DeliveryAttemptId) -> Result<Option<DeliveryAttempt>> {
        Ok(self.ctx.storage.find_attempt(id).await?)
    }

    /// Every delivery attempt created for an event.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn deliveries_for_event(&self, event_id: EventId) -> Result<Vec<DeliveryAttempt>> {
        Ok(self.ctx.storage.find_attempts_for_event(event_id).await?)
    }

    /// Enables or disables an endpoint. Re-enabling clears its failure
    /// counter. Jobs already queued for a disabled endpoint are dropped when
    /// dequeued. Returns false if the endpoint does not exist.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn set_endpoint_enabled(&self, id: WebhookEndpointId, enabled: bool) -> Result<bool> {
        let found = self.ctx.storage.set_endpoint_enabled(id, enabled).await?;
        if found {
            info!(endpoint_id = %id, enabled, "endpoint state changed");
        }
        Ok(found)
    }

    /// Re-enqueues pending retries that were due more than `grace` ago.
    ///
    /// Covers a crash between recording a retry and enqueueing it. Extra
    /// jobs are harmless: all but one are skipped by the attempt guard.
    /// Returns the number of jobs enqueued.
    ///
    /// # Errors
    ///
    /// Returns a storage or queue error.
    pub async fn requeue_stranded(&self, grace: Duration) -> Result<usize> {
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| DeliveryError::configuration(format!("invalid grace period: {e}")))?;
        let cutoff = self.ctx.clock.now_utc() - grace;
        let stranded = self.ctx.storage.find_stranded_retries(cutoff).await?;

        for attempt in &stranded {
            let job = DeliveryJob {
                delivery_id: attempt.id,
                webhook_id: attempt.webhook_id,
                event_id: attempt.event_id,
                attempt: attempt.attempt,
            };
            self.ctx.queue.enqueue(job, Duration::ZERO).await?;
        }

        if !stranded.is_empty() {
            warn!(count = stranded.len(), "re-enqueued stranded retries");
        }
        Ok(stranded.len())
    }

    /// Jobs currently in the queue.
    ///
    /// # Errors
    ///
    /// Returns a queue error.
    pub async fn queue_depth(&self) -> Result<usize> {
        self.ctx.queue.depth().await
    }

    /// Engine configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.ctx.config
    }
}

#[cfg(test)]
mod tests {
    use bastion_core::{AttemptStatus, TestClock};
    use serde_json::json;

    use super::*;
    use crate::{
        queue::mock::MockJobQueue,
        storage::{mock::MockDeliveryStorage, FailureRecord, FailureSettlement},
        url_guard::UrlPolicy,
    };

    struct Fixture {
        engine: DeliveryEngine,
        storage: MockDeliveryStorage,
        queue: MockJobQueue,
        clock: TestClock,
    }

    fn fixture() -> Fixture {
        let clock = TestClock::new();
        let storage = MockDeliveryStorage::new();
        let queue = MockJobQueue::new(Arc::new(clock.clone()));
        let config = DeliveryConfig { url_policy: UrlPolicy::development(), ..Default::default() };
        let engine = DeliveryEngine::with_event_handler(
            Arc::new(storage.clone()),
            Arc::new(queue.clone()),
            config,
            Arc::new(clock.clone()),
            Arc::new(NoOpEventHandler),
        )
        .unwrap();
        Fixture { engine, storage, queue, clock }
    }

    fn endpoint(url: &str, types: &[&str]) -> WebhookEndpoint {
        WebhookEndpoint::new("acct", url, "whsec", types.iter().map(|t| t.to_string()).collect())
    }

    #[tokio::test]
    async fn fan_out_targets_enabled_subscribers() {
        let f = fixture();
        let wanted = endpoint("http://127.0.0.1:9/a", &["message.completed"]);
        let wildcard = endpoint("http://127.0.0.1:9/b", &["*"]);
        let other = endpoint("http://127.0.0.1:9/c", &["session.closed"]);
        let mut disabled = endpoint("http://127.0.0.1:9/d", &["*"]);
        disabled.enabled = false;
        for e in [&wanted, &wildcard, &other, &disabled] {
            f.storage.add_endpoint(e.clone()).await;
        }

        let event = Event::new("message.completed", json!({}));
        let created = f.engine.enqueue_event(event.clone()).await.unwrap();

        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|a| a.status == AttemptStatus::Pending && a.attempt == 1));
        assert!(created.iter().all(|a| a.max_attempts == 6));
        assert_eq!(f.queue.depth().await.unwrap(), 2);
        assert_eq!(f.engine.deliveries_for_event(event.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unsafe_endpoint_fails_at_enqueue() {
        let f = fixture();
        f.storage.add_endpoint(endpoint("https://192.168.1.5/hook", &["*"])).await;

        let created =
            f.engine.enqueue_event(Event::new("message.completed", json!({}))).await.unwrap();

        assert_eq!(created.len(), 1);
        assert_eq!(created[0].status, AttemptStatus::Failed);
        assert!(created[0].error.as_deref().unwrap().contains("private_ip_blocked"));
        assert_eq!(f.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn register_rejects_unsafe_url() {
        let f = fixture();
        let err = f
            .engine
            .register_endpoint(endpoint("https://169.254.169.254/latest", &["*"]))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::UnsafeUrl(_)));
    }

    #[tokio::test]
    async fn stranded_retries_are_requeued_after_grace() {
        let f = fixture();
        let target = endpoint("http://127.0.0.1:9/a", &["*"]);
        f.storage.add_endpoint(target).await;
        let created =
            f.engine.enqueue_event(Event::new("message.completed", json!({}))).await.unwrap();
        let attempt = &created[0];

        let due = f.clock.now_utc();
        let failure = FailureRecord {
            endpoint_id: attempt.webhook_id,
            attempt: 1,
            outcome: AttemptOutcome {
                response_status: None,
                response_body: None,
                error: None,
                at: due,
            },
            retry_at: Some(due),
            failure_threshold: 10,
        };
        let settled = f.storage.record_failure(attempt.id, failure).await.unwrap();
        assert!(matches!(settled, FailureSettlement::RetryScheduled { .. }));

        let grace = Duration::from_secs(60);
        assert_eq!(f.engine.requeue_stranded(grace).await.unwrap(), 0);

        f.clock.advance(Duration::from_secs(61));
        assert_eq!(f.engine.requeue_stranded(grace).await.unwrap(), 1);
        assert_eq!(f.queue.jobs().await.last().map(|j| j.attempt), Some(2));
    }

    #[tokio::test]
    async fn reenable_resets_counter() {
        let f = fixture();
        let mut target = endpoint("http://127.0.0.1:9/a", &["*"]);
        target.consecutive_failures = 3;
        f.storage.add_endpoint(target.clone()).await;

        assert!(f.engine.set_endpoint_enabled(target.id, false).await.unwrap());
        assert!(f.engine.set_endpoint_enabled(target.id, true).await.unwrap());
        assert_eq!(f.storage.endpoint(target.id).await.unwrap().consecutive_failures, 0);
        assert!(!f.engine.set_endpoint_enabled(WebhookEndpointId::new(), true).await.unwrap());
    }

    #[tokio::test]
    async fn start_twice_is_rejected_and_shutdown_completes() {
        let mut f = fixture();
        f.engine.start().await.unwrap();
        assert!(f.engine.start().await.is_err());
        assert_eq!(f.engine.stats().await.active_workers, crate::DEFAULT_WORKER_COUNT);
        f.engine.shutdown().await.unwrap();
    }
}
