//! Delivery workers that drain the job queue.
//!
//! Each worker leases a batch of jobs, delivers them one at a time and
//! acknowledges a job only after its outcome has been written. A job whose
//! processing fails on storage is left leased and comes back after the
//! visibility timeout.

use std::{sync::Arc, time::Duration};

use bastion_core::{
    Clock, DeliveryAttempt, DeliveryAttemptId, DeliveryEvent, DeliveryFailedEvent,
    DeliverySucceededEvent, EndpointDisabledEvent, EventHandler, WebhookEndpoint,
    WebhookEndpointId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{ClientConfig, DeliveryRequest, DeliveryResult, WebhookDeliveryService},
    error::Result,
    queue::{DeliveryJob, JobQueue, LeasedJob},
    retry::{RetryContext, RetryDecision, RetryPolicy},
    storage::{AttemptOutcome, DeliveryStorage, FailureRecord, FailureSettlement},
    url_guard::UrlPolicy,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Maximum jobs leased per worker batch.
    pub batch_size: usize,

    /// How often idle workers poll the queue.
    pub poll_interval: Duration,

    /// Lease on a dequeued job. Must exceed the client timeout.
    pub visibility_timeout: Duration,

    /// Consecutive failures after which an endpoint is disabled.
    pub failure_threshold: u32,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Outbound URL policy.
    pub url_policy: UrlPolicy,

    /// Retry budget and backoff table for new deliveries.
    pub retry_policy: RetryPolicy,

    /// Maximum time to wait for workers to stop.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS * 4),
            failure_threshold: crate::DEFAULT_FAILURE_THRESHOLD,
            client_config: ClientConfig::default(),
            url_policy: UrlPolicy::default(),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Number of running delivery workers.
    pub active_workers: usize,
    /// Jobs taken off the queue and processed.
    pub jobs_processed: u64,
    /// Attempts settled as success.
    pub delivered: u64,
    /// Failed attempts that were rescheduled.
    pub retries_scheduled: u64,
    /// Attempts settled as failed.
    pub failed: u64,
    /// Endpoints disabled by the failure threshold.
    pub endpoints_disabled: u64,
    /// Jobs dropped without a send: stale, duplicate or disabled target.
    pub skipped: u64,
    /// Deliveries currently on the wire.
    pub in_flight: u64,
}

/// What processing one job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The receiver accepted the delivery.
    Delivered,
    /// The attempt failed and a retry was enqueued.
    RetryScheduled,
    /// The attempt failed terminally.
    Failed,
    /// The failure crossed the endpoint threshold and disabled it.
    EndpointDisabled,
    /// Nothing was sent.
    Skipped,
}

/// Dependencies shared by every worker of an engine.
#[derive(Clone)]
pub struct WorkerContext {
    /// Endpoint, event and attempt records.
    pub storage: Arc<dyn DeliveryStorage>,
    /// Job queue.
    pub queue: Arc<dyn JobQueue>,
    /// Outbound HTTP client.
    pub client: Arc<WebhookDeliveryService>,
    /// Engine configuration.
    pub config: DeliveryConfig,
    /// Shared counters.
    pub stats: Arc<RwLock<EngineStats>>,
    /// Receives outcome notifications.
    pub event_handler: Arc<dyn EventHandler>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Individual worker that processes webhook deliveries.
pub struct DeliveryWorker {
    id: usize,
    ctx: WorkerContext,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    /// Creates a worker.
    pub fn new(id: usize, ctx: WorkerContext, cancellation_token: CancellationToken) -> Self {
        Self { id, ctx, cancellation_token }
    }

    /// Main worker loop. Leases and processes jobs until cancelled.
    ///
    /// # Errors
    ///
    /// Returns error only if worker setup fails. Batch errors are logged and
    /// retried after a pause.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.ctx.clock.sleep(self.ctx.config.poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(worker_id = self.id, error = %error, "worker batch processing failed");
                    tokio::select! {
                        () = self.ctx.clock.sleep(Duration::from_secs(5)) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Leases one batch and processes it. Returns the number of jobs leased.
    ///
    /// Jobs left unprocessed because of cancellation stay leased and come
    /// back when their lease expires.
    ///
    /// # Errors
    ///
    /// Returns error if the queue cannot be read.
    pub async fn process_batch(&self) -> Result<usize> {
        let config = &self.ctx.config;
        let jobs = self.ctx.queue.dequeue(config.batch_size, config.visibility_timeout).await?;
        let leased = jobs.len();

        if leased > 0 {
            debug!(worker_id = self.id, batch_size = leased, "processing job batch");
        }

        for leased_job in jobs {
            if self.cancellation_token.is_cancelled() {
                break;
            }
            self.process_leased(leased_job).await;
        }

        Ok(leased)
    }

    async fn process_leased(&self, leased: LeasedJob) {
        let LeasedJob { job_id, job, receive_count } = leased;
        self.ctx.stats.write().await.in_flight += 1;
        let result = self.process_job(job).await;
        {
            let mut stats = self.ctx.stats.write().await;
            stats.in_flight -= 1;
            stats.jobs_processed += 1;
        }

        match result {
            Ok(outcome) => {
                self.count(outcome).await;
                if let Err(error) = self.ctx.queue.ack(job_id).await {
                    warn!(
                        worker_id = self.id,
                        job_id = %job_id,
                        error = %error,
                        "failed to acknowledge job, it will be redelivered"
                    );
                }
            },
            Err(error) => {
                error!(
                    worker_id = self.id,
                    delivery_id = %job.delivery_id,
                    receive_count,
                    error = %error,
                    "job processing failed, leaving it for redelivery"
                );
            },
        }
    }

    /// Runs one job to completion.
    ///
    /// # Errors
    ///
    /// Returns error if a storage read or write fails. The job should then be
    /// left unacknowledged.
    pub async fn process_job(&self, job: DeliveryJob) -> Result<JobOutcome> {
        let storage = &self.ctx.storage;

        let Some(attempt) = storage.find_attempt(job.delivery_id).await? else {
            warn!(delivery_id = %job.delivery_id, "delivery attempt not found, dropping job");
            return Ok(JobOutcome::Skipped);
        };

        if attempt.status.is_terminal() || attempt.attempt != job.attempt {
            debug!(
                delivery_id = %job.delivery_id,
                job_attempt = job.attempt,
                record_attempt = attempt.attempt,
                status = %attempt.status,
                "stale or duplicate job, skipping"
            );
            return Ok(JobOutcome::Skipped);
        }

        let endpoint = match storage.find_endpoint(job.webhook_id).await? {
            Some(endpoint) if endpoint.enabled => endpoint,
            found => {
                let reason =
                    if found.is_some() { "endpoint disabled" } else { "endpoint not found" };
                debug!(
                    delivery_id = %job.delivery_id,
                    endpoint_id = %job.webhook_id,
                    reason,
                    "skipping delivery"
                );
                storage.mark_failed(job.delivery_id, job.attempt, self.note(reason)).await?;
                return Ok(JobOutcome::Skipped);
            },
        };

        let Some(event) = storage.find_event(job.event_id).await? else {
            let outcome = self.note("event not found");
            if storage.mark_failed(job.delivery_id, job.attempt, outcome).await? {
                self.emit_failed(&attempt, None, "event not found".to_string()).await;
                return Ok(JobOutcome::Failed);
            }
            return Ok(JobOutcome::Skipped);
        };

        let request = DeliveryRequest::new(&endpoint, &event, job.delivery_id, job.attempt);
        let result = self.ctx.client.deliver(&request).await;

        if result.success {
            self.settle_success(&endpoint, &attempt, result).await
        } else {
            self.settle_failure(&endpoint, &attempt, job, result).await
        }
    }

    async fn settle_success(
        &self,
        endpoint: &WebhookEndpoint,
        attempt: &DeliveryAttempt,
        result: DeliveryResult,
    ) -> Result<JobOutcome> {
        let delivered_at = self.ctx.clock.now_utc();
        let response_status = result.status_code.unwrap_or(200);
        let outcome = AttemptOutcome {
            response_status: result.status_code,
            response_body: result.response_body,
            error: None,
            at: delivered_at,
        };

        if !self.ctx.storage.mark_success(attempt.id, attempt.attempt, outcome).await? {
            return Ok(JobOutcome::Skipped);
        }
        self.ctx.storage.reset_endpoint_failures(endpoint.id).await?;

        info!(
            delivery_id = %attempt.id,
            endpoint_id = %endpoint.id,
            attempt = attempt.attempt,
            status_code = response_status,
            "webhook delivered"
        );
        self.ctx
            .event_handler
            .handle_event(DeliveryEvent::Succeeded(DeliverySucceededEvent {
                delivery_id: attempt.id,
                event_id: attempt.event_id,
                webhook_id: endpoint.id,
                response_status,
                attempt: attempt.attempt,
                delivered_at,
            }))
            .await;
        Ok(JobOutcome::Delivered)
    }

    /// Settles a failed attempt. The endpoint counter returned by storage
    /// decides between disabling the endpoint, retrying and failing.
    async fn settle_failure(
        &self,
        endpoint: &WebhookEndpoint,
        attempt: &DeliveryAttempt,
        job: DeliveryJob,
        result: DeliveryResult,
    ) -> Result<JobOutcome> {
        let failed_at = self.ctx.clock.now_utc();
        let error = result.error_message().unwrap_or_else(|| "delivery failed".to_string());
        let context = RetryContext::new(
            attempt.attempt,
            attempt.max_attempts,
            result.should_retry,
            failed_at,
        );

        let (retry, error) = match context.decide_retry(&self.ctx.config.retry_policy.schedule) {
            RetryDecision::Retry { delay, next_attempt_at } => {
                (Some((delay, next_attempt_at)), error)
            },
            RetryDecision::GiveUp { reason } => (None, format!("{error} ({reason})")),
        };
        let failure = FailureRecord {
            endpoint_id: endpoint.id,
            attempt: attempt.attempt,
            outcome: AttemptOutcome {
                response_status: result.status_code,
                response_body: result.response_body,
                error: Some(error.clone()),
                at: failed_at,
            },
            retry_at: retry.map(|(_, at)| at),
            failure_threshold: self.ctx.config.failure_threshold,
        };

        match self.ctx.storage.record_failure(attempt.id, failure).await? {
            FailureSettlement::Stale => Ok(JobOutcome::Skipped),
            FailureSettlement::RetryScheduled { consecutive_failures, .. } => {
                let delay = retry.map_or(Duration::ZERO, |(delay, _)| delay);

                // The record already points at the next attempt. A lost enqueue is
                // picked up by the stranded retry sweep.
                let enqueued = self.ctx.queue.enqueue(job.next_attempt(), delay).await;
                if let Err(enqueue_error) = enqueued {
                    error!(
                        delivery_id = %attempt.id,
                        error = %enqueue_error,
                        "failed to enqueue retry"
                    );
                }

                info!(
                    delivery_id = %attempt.id,
                    endpoint_id = %endpoint.id,
                    attempt = attempt.attempt,
                    consecutive_failures,
                    delay_seconds = delay.as_secs(),
                    error = %error,
                    "delivery failed, retry scheduled"
                );
                Ok(JobOutcome::RetryScheduled)
            },
            FailureSettlement::Failed { consecutive_failures, error } => {
                warn!(
                    delivery_id = %attempt.id,
                    endpoint_id = %endpoint.id,
                    attempt = attempt.attempt,
                    consecutive_failures,
                    error = %error,
                    "delivery failed permanently"
                );
                self.emit_failed(attempt, result.status_code, error).await;
                Ok(JobOutcome::Failed)
            },
            FailureSettlement::EndpointDisabled { consecutive_failures, error } => {
                self.emit_failed(attempt, result.status_code, error).await;
                self.announce_disabled(endpoint.id, consecutive_failures, attempt.id).await;
                Ok(JobOutcome::EndpointDisabled)
            },
        }
    }

    async fn announce_disabled(
        &self,
        endpoint_id: WebhookEndpointId,
        consecutive_failures: u32,
        triggered_by: DeliveryAttemptId,
    ) {
        warn!(
            endpoint_id = %endpoint_id,
            consecutive_failures,
            delivery_id = %triggered_by,
            "endpoint disabled after consecutive failures"
        );
        self.ctx
            .event_handler
            .handle_event(DeliveryEvent::EndpointDisabled(EndpointDisabledEvent {
                webhook_id: endpoint_id,
                consecutive_failures,
                triggered_by,
                disabled_at: self.ctx.clock.now_utc(),
            }))
            .await;
    }

    async fn emit_failed(
        &self,
        attempt: &DeliveryAttempt,
        response_status: Option<u16>,
        error: String,
    ) {
        self.ctx
            .event_handler
            .handle_event(DeliveryEvent::Failed(DeliveryFailedEvent {
                delivery_id: attempt.id,
                event_id: attempt.event_id,
                webhook_id: attempt.webhook_id,
                response_status,
                attempt: attempt.attempt,
                error,
                failed_at: self.ctx.clock.now_utc(),
            }))
            .await;
    }

    fn note(&self, reason: &str) -> AttemptOutcome {
        AttemptOutcome {
            response_status: None,
            response_body: None,
            error: Some(reason.to_string()),
            at: self.ctx.clock.now_utc(),
        }
    }

    async fn count(&self, outcome: JobOutcome) {
        let mut stats = self.ctx.stats.write().await;
        match outcome {
            JobOutcome::Delivered => stats.delivered += 1,
            JobOutcome::RetryScheduled => stats.retries_scheduled += 1,
            JobOutcome::Failed => stats.failed += 1,
            JobOutcome::EndpointDisabled => {
                stats.failed += 1;
                stats.endpoints_disabled += 1;
            },
            JobOutcome::Skipped => stats.skipped += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use bastion_core::{AttemptStatus, Event, NoOpEventHandler, TestClock};
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{
        queue::mock::MockJobQueue, storage::mock::MockDeliveryStorage, url_guard::UrlValidator,
    };

    struct Harness {
        worker: DeliveryWorker,
        storage: MockDeliveryStorage,
        queue: MockJobQueue,
        stats: Arc<RwLock<EngineStats>>,
    }

    fn harness(failure_threshold: u32) -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let storage = MockDeliveryStorage::new();
        let queue = MockJobQueue::new(clock.clone());
        let config = DeliveryConfig {
            failure_threshold,
            url_policy: UrlPolicy::development(),
            ..DeliveryConfig::default()
        };
        let validator = Arc::new(UrlValidator::new(config.url_policy.clone()));
        let client =
            Arc::new(WebhookDeliveryService::new(config.client_config.clone(), validator).unwrap());
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let ctx = WorkerContext {
            storage: Arc::new(storage.clone()),
            queue: Arc::new(queue.clone()),
            client,
            config,
            stats: stats.clone(),
            event_handler: Arc::new(NoOpEventHandler),
            clock,
        };
        let worker = DeliveryWorker::new(0, ctx, CancellationToken::new());
        Harness { worker, storage, queue, stats }
    }

    async fn seed(h: &Harness, url: String, max_attempts: u32) -> (WebhookEndpoint, DeliveryJob) {
        let endpoint = WebhookEndpoint::new("acct", url, "whsec", vec!["*".into()]);
        let event = Event::new("message.completed", json!({"text": "hi"}));
        let attempt = DeliveryAttempt::first(endpoint.id, &event, max_attempts);
        let job = DeliveryJob {
            delivery_id: attempt.id,
            webhook_id: endpoint.id,
            event_id: event.id,
            attempt: 1,
        };
        h.storage.add_endpoint(endpoint.clone()).await;
        h.storage.store_event(event).await.unwrap();
        h.storage.create_attempt(attempt).await.unwrap();
        (endpoint, job)
    }

    async fn receiver(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn success_settles_and_resets_counter() {
        let server = receiver(200).await;
        let h = harness(5);
        let (mut endpoint, job) = seed(&h, format!("{}/hook", server.uri()), 3).await;
        endpoint.consecutive_failures = 2;
        h.storage.add_endpoint(endpoint.clone()).await;

        assert_eq!(h.worker.process_job(job).await.unwrap(), JobOutcome::Delivered);

        let record = h.storage.find_attempt(job.delivery_id).await.unwrap().unwrap();
        assert_eq!(record.status, AttemptStatus::Success);
        assert_eq!(record.response_status, Some(200));
        assert_eq!(h.storage.endpoint(endpoint.id).await.unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn retryable_failure_reschedules_with_table_delay() {
        let server = receiver(503).await;
        let h = harness(5);
        let (endpoint, job) = seed(&h, format!("{}/hook", server.uri()), 3).await;

        assert_eq!(h.worker.process_job(job).await.unwrap(), JobOutcome::RetryScheduled);

        let record = h.storage.find_attempt(job.delivery_id).await.unwrap().unwrap();
        assert_eq!(record.status, AttemptStatus::Pending);
        assert_eq!(record.attempt, 2);
        assert!(record.next_retry_at.is_some());
        assert_eq!(h.queue.jobs().await, vec![job.next_attempt()]);
        assert_eq!(h.queue.next_visible_in().await, Some(Duration::from_secs(10)));
        assert_eq!(h.storage.endpoint(endpoint.id).await.unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_terminal() {
        let server = receiver(404).await;
        let h = harness(5);
        let (_, job) = seed(&h, format!("{}/hook", server.uri()), 3).await;

        assert_eq!(h.worker.process_job(job).await.unwrap(), JobOutcome::Failed);

        let record = h.storage.find_attempt(job.delivery_id).await.unwrap().unwrap();
        assert_eq!(record.status, AttemptStatus::Failed);
        assert!(record.error.unwrap().contains("non-retryable"));
        assert!(h.queue.jobs().await.is_empty());
    }

    #[tokio::test]
    async fn exhausted_budget_is_terminal() {
        let server = receiver(500).await;
        let h = harness(10);
        let (_, job) = seed(&h, format!("{}/hook", server.uri()), 1).await;

        assert_eq!(h.worker.process_job(job).await.unwrap(), JobOutcome::Failed);
        let record = h.storage.find_attempt(job.delivery_id).await.unwrap().unwrap();
        assert!(record.error.unwrap().contains("maximum attempts"));
    }

    #[tokio::test]
    async fn threshold_takes_precedence_over_retry_budget() {
        let server = receiver(500).await;
        let h = harness(1);
        let (endpoint, job) = seed(&h, format!("{}/hook", server.uri()), 6).await;

        assert_eq!(h.worker.process_job(job).await.unwrap(), JobOutcome::EndpointDisabled);

        let record = h.storage.find_attempt(job.delivery_id).await.unwrap().unwrap();
        assert_eq!(record.status, AttemptStatus::Failed);
        assert!(record.error.unwrap().starts_with("endpoint disabled"));
        assert!(!h.storage.endpoint(endpoint.id).await.unwrap().enabled);
        assert!(h.queue.jobs().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_failures_stop_retrying_once_threshold_is_reached() {
        let server = receiver(503).await;
        let h = harness(2);
        let (endpoint, first) = seed(&h, format!("{}/hook", server.uri()), 3).await;
        let event = Event::new("message.completed", json!({"text": "again"}));
        let attempt = DeliveryAttempt::first(endpoint.id, &event, 3);
        let second = DeliveryJob {
            delivery_id: attempt.id,
            webhook_id: endpoint.id,
            event_id: event.id,
            attempt: 1,
        };
        h.storage.store_event(event).await.unwrap();
        h.storage.create_attempt(attempt).await.unwrap();

        let (a, b) = tokio::join!(h.worker.process_job(first), h.worker.process_job(second));
        let outcomes = [a.unwrap(), b.unwrap()];

        assert!(outcomes.contains(&JobOutcome::RetryScheduled));
        assert!(outcomes.contains(&JobOutcome::EndpointDisabled));
        assert_eq!(h.queue.jobs().await.len(), 1);
        let stored = h.storage.endpoint(endpoint.id).await.unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn success_clears_failures_recorded_while_in_flight() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
            .mount(&server)
            .await;
        let h = harness(5);
        let (endpoint, job) = seed(&h, format!("{}/hook", server.uri()), 3).await;

        let failure_elsewhere = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut failed = endpoint.clone();
            failed.consecutive_failures = 1;
            h.storage.add_endpoint(failed).await;
        };
        let (outcome, ()) = tokio::join!(h.worker.process_job(job), failure_elsewhere);

        assert_eq!(outcome.unwrap(), JobOutcome::Delivered);
        assert_eq!(h.storage.endpoint(endpoint.id).await.unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn disabled_endpoint_is_skipped_without_send() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let h = harness(5);
        let (endpoint, job) = seed(&h, format!("{}/hook", server.uri()), 3).await;
        h.storage.set_endpoint_enabled(endpoint.id, false).await.unwrap();

        assert_eq!(h.worker.process_job(job).await.unwrap(), JobOutcome::Skipped);
        let record = h.storage.find_attempt(job.delivery_id).await.unwrap().unwrap();
        assert_eq!(record.status, AttemptStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("endpoint disabled"));
    }

    #[tokio::test]
    async fn duplicate_job_does_not_touch_counters() {
        let server = receiver(503).await;
        let h = harness(5);
        let (endpoint, job) = seed(&h, format!("{}/hook", server.uri()), 3).await;

        assert_eq!(h.worker.process_job(job).await.unwrap(), JobOutcome::RetryScheduled);
        assert_eq!(h.worker.process_job(job).await.unwrap(), JobOutcome::Skipped);

        assert_eq!(h.storage.endpoint(endpoint.id).await.unwrap().consecutive_failures, 1);
        assert_eq!(h.queue.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn unsafe_url_fails_without_retry() {
        let h = harness(5);
        let (_, job) = seed(&h, "https://192.168.1.5/hook".to_string(), 3).await;

        assert_eq!(h.worker.process_job(job).await.unwrap(), JobOutcome::Failed);
        let record = h.storage.find_attempt(job.delivery_id).await.unwrap().unwrap();
        assert!(record.error.unwrap().contains("private_ip_blocked"));
        assert!(h.queue.jobs().await.is_empty());
    }

    #[tokio::test]
    async fn storage_error_leaves_job_unacknowledged() {
        let server = receiver(200).await;
        let h = harness(5);
        let (_, job) = seed(&h, format!("{}/hook", server.uri()), 3).await;
        h.queue.enqueue(job, Duration::ZERO).await.unwrap();
        h.storage.inject_find_error("connection reset").await;

        assert_eq!(h.worker.process_batch().await.unwrap(), 1);
        assert_eq!(h.queue.depth().await.unwrap(), 1);
        assert_eq!(h.stats.read().await.jobs_processed, 1);
        assert_eq!(h.stats.read().await.delivered, 0);
    }

    #[tokio::test]
    async fn batch_acknowledges_processed_jobs() {
        let server = receiver(200).await;
        let h = harness(5);
        let (_, job) = seed(&h, format!("{}/hook", server.uri()), 3).await;
        h.queue.enqueue(job, Duration::ZERO).await.unwrap();

        assert_eq!(h.worker.process_batch().await.unwrap(), 1);
        assert_eq!(h.queue.depth().await.unwrap(), 0);
        assert_eq!(h.stats.read().await.delivered, 1);
    }
}
