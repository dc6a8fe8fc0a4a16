//! Durable job queue with visibility leases.
//!
//! A dequeued job is hidden for the visibility timeout rather than removed.
//! It is deleted only when the worker acknowledges it, so a job held by a
//! crashed worker becomes visible again once its lease expires. Retries are
//! plain enqueues with a delay, which makes them survive restarts.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use bastion_core::{Clock, DeliveryAttemptId, EventId, WebhookEndpointId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use crate::error::{DeliveryError, Result};

/// Work item for one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryJob {
    /// Attempt record this job settles.
    pub delivery_id: DeliveryAttemptId,
    /// Target endpoint.
    pub webhook_id: WebhookEndpointId,
    /// Event to deliver.
    pub event_id: EventId,
    /// 1-based attempt number the job was enqueued for.
    pub attempt: u32,
}

impl DeliveryJob {
    /// Job for the attempt after this one.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self { attempt: self.attempt.saturating_add(1), ..*self }
    }
}

/// A dequeued job and its lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedJob {
    /// Queue entry id, used to acknowledge.
    pub job_id: Uuid,
    /// The job.
    pub job: DeliveryJob,
    /// How many times this entry has been handed out, including this one.
    pub receive_count: u32,
}

/// Boxed future returned by [`JobQueue`] methods.
pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Queue operations required by delivery workers.
pub trait JobQueue: Send + Sync + 'static {
    /// Adds a job that becomes visible after `delay`.
    fn enqueue(&self, job: DeliveryJob, delay: Duration) -> QueueFuture<'_, Uuid>;

    /// Leases up to `batch_size` visible jobs for `visibility_timeout`.
    ///
    /// Concurrent callers never receive the same entry while its lease is
    /// live.
    fn dequeue(
        &self,
        batch_size: usize,
        visibility_timeout: Duration,
    ) -> QueueFuture<'_, Vec<LeasedJob>>;

    /// Deletes a leased entry after processing.
    fn ack(&self, job_id: Uuid) -> QueueFuture<'_, ()>;

    /// Number of entries, visible or leased.
    fn depth(&self) -> QueueFuture<'_, usize>;
}

/// Queue backed by the `delivery_jobs` table.
pub struct PostgresJobQueue {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresJobQueue {
    /// Creates a queue over `pool`.
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    fn after(&self, delay: Duration) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.clock.now_utc().checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl JobQueue for PostgresJobQueue {
    fn enqueue(&self, job: DeliveryJob, delay: Duration) -> QueueFuture<'_, Uuid> {
        let visible_at = self.after(delay);
        Box::pin(async move {
            let id = Uuid::new_v4();
            sqlx::query(
                r"
                INSERT INTO delivery_jobs (id, payload, visible_at, receive_count)
                VALUES ($1, $2, $3, 0)
                ",
            )
            .bind(id)
            .bind(Json(job))
            .bind(visible_at)
            .execute(&self.pool)
            .await
            .map_err(|e| DeliveryError::queue(format!("failed to enqueue job: {e}")))?;
            Ok(id)
        })
    }

    fn dequeue(
        &self,
        batch_size: usize,
        visibility_timeout: Duration,
    ) -> QueueFuture<'_, Vec<LeasedJob>> {
        let now = self.clock.now_utc();
        let lease_until = self.after(visibility_timeout);
        Box::pin(async move {
            let rows: Vec<(Uuid, Json<DeliveryJob>, i32)> = sqlx::query_as(
                r"
                UPDATE delivery_jobs
                SET visible_at = $2, receive_count = receive_count + 1
                WHERE id IN (
                    SELECT id FROM delivery_jobs
                    WHERE visible_at <= $1
                    ORDER BY visible_at ASC
                    LIMIT $3
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, payload, receive_count
                ",
            )
            .bind(now)
            .bind(lease_until)
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DeliveryError::queue(format!("failed to dequeue jobs: {e}")))?;

            Ok(rows
                .into_iter()
                .map(|(job_id, Json(job), count)| LeasedJob {
                    job_id,
                    job,
                    receive_count: u32::try_from(count).unwrap_or(0),
                })
                .collect())
        })
    }

    fn ack(&self, job_id: Uuid) -> QueueFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("DELETE FROM delivery_jobs WHERE id = $1")
                .bind(job_id)
                .execute(&self.pool)
                .await
                .map_err(|e| DeliveryError::queue(format!("failed to ack job {job_id}: {e}")))?;
            Ok(())
        })
    }

    fn depth(&self) -> QueueFuture<'_, usize> {
        Box::pin(async move {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delivery_jobs")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| DeliveryError::queue(format!("failed to count jobs: {e}")))?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! In-memory queue driven by an injected clock.
    //!
    //! Visibility and leases follow the same rules as the Postgres queue, so
    //! tests can advance a `TestClock` past a retry delay or an expired lease
    //! instead of sleeping.

    use std::{sync::Arc, time::Instant};

    use tokio::sync::RwLock;

    use super::*;

    #[derive(Debug, Clone)]
    struct Entry {
        job_id: Uuid,
        job: DeliveryJob,
        visible_at: Instant,
        receive_count: u32,
    }

    /// In-memory [`JobQueue`].
    #[derive(Debug, Clone)]
    pub struct MockJobQueue {
        entries: Arc<RwLock<Vec<Entry>>>,
        clock: Arc<dyn Clock>,
        enqueue_error: Arc<RwLock<Option<String>>>,
    }

    impl MockJobQueue {
        /// Creates an empty queue.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                entries: Arc::new(RwLock::new(Vec::new())),
                clock,
                enqueue_error: Arc::new(RwLock::new(None)),
            }
        }

        /// Fails the next enqueue with a queue error.
        pub async fn inject_enqueue_error(&self, error: impl Into<String>) {
            *self.enqueue_error.write().await = Some(error.into());
        }

        /// Every queued job, visible or not, in visibility order.
        pub async fn jobs(&self) -> Vec<DeliveryJob> {
            let mut entries = self.entries.read().await.clone();
            entries.sort_by_key(|e| e.visible_at);
            entries.into_iter().map(|e| e.job).collect()
        }

        /// Time until the earliest entry becomes visible, if any is hidden.
        pub async fn next_visible_in(&self) -> Option<Duration> {
            let now = self.clock.now();
            self.entries
                .read()
                .await
                .iter()
                .map(|e| e.visible_at.saturating_duration_since(now))
                .min()
        }
    }

    impl JobQueue for MockJobQueue {
        fn enqueue(&self, job: DeliveryJob, delay: Duration) -> QueueFuture<'_, Uuid> {
            Box::pin(async move {
                if let Some(error) = self.enqueue_error.write().await.take() {
                    return Err(DeliveryError::queue(error));
                }
                let job_id = Uuid::new_v4();
                let visible_at = self.clock.now() + delay;
                let entry = Entry { job_id, job, visible_at, receive_count: 0 };
                self.entries.write().await.push(entry);
                Ok(job_id)
            })
        }

        fn dequeue(
            &self,
            batch_size: usize,
            visibility_timeout: Duration,
        ) -> QueueFuture<'_, Vec<LeasedJob>> {
            Box::pin(async move {
                let now = self.clock.now();
                let mut entries = self.entries.write().await;
                entries.sort_by_key(|e| e.visible_at);

                let mut leased = Vec::new();
                for entry in entries.iter_mut().filter(|e| e.visible_at <= now).take(batch_size) {
                    entry.visible_at = now + visibility_timeout;
                    entry.receive_count += 1;
                    leased.push(LeasedJob {
                        job_id: entry.job_id,
                        job: entry.job,
                        receive_count: entry.receive_count,
                    });
                }
                Ok(leased)
            })
        }

        fn ack(&self, job_id: Uuid) -> QueueFuture<'_, ()> {
            Box::pin(async move {
                self.entries.write().await.retain(|e| e.job_id != job_id);
                Ok(())
            })
        }

        fn depth(&self) -> QueueFuture<'_, usize> {
            Box::pin(async move { Ok(self.entries.read().await.len()) })
        }
    }
}

#[cfg(test)]
mod tests {
    use bastion_core::TestClock;

    use super::{mock::MockJobQueue, *};

    fn job() -> DeliveryJob {
        DeliveryJob {
            delivery_id: DeliveryAttemptId::new(),
            webhook_id: WebhookEndpointId::new(),
            event_id: EventId::new(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn delayed_job_is_invisible_until_due() {
        let clock = TestClock::new();
        let queue = MockJobQueue::new(Arc::new(clock.clone()));
        queue.enqueue(job(), Duration::from_secs(60)).await.unwrap();

        assert!(queue.dequeue(10, Duration::from_secs(30)).await.unwrap().is_empty());
        clock.advance(Duration::from_secs(60));
        assert_eq!(queue.dequeue(10, Duration::from_secs(30)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unacked_lease_expires_and_redelivers() {
        let clock = TestClock::new();
        let queue = MockJobQueue::new(Arc::new(clock.clone()));
        queue.enqueue(job(), Duration::ZERO).await.unwrap();

        let first = queue.dequeue(1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(first[0].receive_count, 1);
        assert!(queue.dequeue(1, Duration::from_secs(30)).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(30));
        let again = queue.dequeue(1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(again[0].job_id, first[0].job_id);
        assert_eq!(again[0].receive_count, 2);

        queue.ack(again[0].job_id).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_size_bounds_dequeue() {
        let queue = MockJobQueue::new(Arc::new(TestClock::new()));
        for _ in 0..5 {
            queue.enqueue(job(), Duration::ZERO).await.unwrap();
        }
        assert_eq!(queue.dequeue(3, Duration::from_secs(1)).await.unwrap().len(), 3);
        assert_eq!(queue.dequeue(3, Duration::from_secs(1)).await.unwrap().len(), 2);
    }

    #[test]
    fn next_attempt_increments_only_attempt() {
        let first = job();
        let second = first.next_attempt();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.delivery_id, first.delivery_id);
    }

    #[test]
    fn job_payload_round_trips_through_json() {
        let job = job();
        let value = serde_json::to_value(job).unwrap();
        assert_eq!(value["attempt"], 1);
        assert_eq!(serde_json::from_value::<DeliveryJob>(value).unwrap(), job);
    }
}
