//! Webhook delivery with SSRF protection and durable retries.
//!
//! Events are fanned out into one delivery attempt per subscribed endpoint
//! and handed to a pool of workers through a durable job queue. Each worker
//! re-validates the destination, signs and sends the request, then settles
//! the attempt.
//!
//! # Architecture
//!
//! ```text
//! enqueue_event ─▶ delivery_attempts + delivery_jobs
//!                          │
//!                 DeliveryWorker (× worker_count)
//!                          │ dequeue with visibility lease
//!                          ▼
//!          UrlValidator ─▶ WebhookDeliveryService ─▶ receiver
//!                          │
//!        success ─▶ settle, reset endpoint counter
//!        failure ─▶ disable endpoint │ retry via delayed enqueue │ fail
//! ```
//!
//! Every settle is conditional on the attempt still being pending at the
//! attempt number the job carries, so at-least-once execution of a job never
//! settles an attempt twice.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bastion_core::RealClock;
//! use bastion_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), DeliveryError> {
//! let mut engine = DeliveryEngine::new(&pool, DeliveryConfig::default(), Arc::new(RealClock))?;
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod engine;
pub mod error;
pub mod queue;
pub mod retry;
pub mod signing;
pub mod storage;
pub mod url_guard;
mod worker;
mod worker_pool;

pub use client::{ClientConfig, DeliveryRequest, DeliveryResult, WebhookDeliveryService};
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, Result};
pub use queue::{DeliveryJob, JobQueue, LeasedJob, PostgresJobQueue};
pub use retry::{BackoffSchedule, RetryContext, RetryDecision, RetryPolicy};
pub use storage::{
    AttemptOutcome, DeliveryStorage, FailureRecord, FailureSettlement, PostgresDeliveryStorage,
};
pub use url_guard::{UrlPolicy, UrlValidationError, UrlValidator, ValidationCode};
pub use worker::JobOutcome;

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default batch size for leasing jobs from the queue.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default consecutive failures before an endpoint is disabled.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 10;
