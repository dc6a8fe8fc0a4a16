//! Storage abstraction for endpoints, events and delivery attempts.
//!
//! Every write that settles a delivery attempt is conditional on the record
//! still being `pending` at the attempt number the caller observed. The
//! methods report whether the update applied. Failures are counted against
//! the endpoint in the same step that settles them, so the counter only moves
//! for an attempt that actually settled. Re-running a job therefore cannot
//! settle an attempt twice or move its status backwards.

use std::{future::Future, pin::Pin};

use bastion_core::{
    AttemptStatus, DeliveryAttempt, DeliveryAttemptId, Event, EventId, Result, WebhookEndpoint,
    WebhookEndpointId,
};
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgArguments, Postgres},
    PgPool,
};

/// Boxed future returned by [`DeliveryStorage`] methods.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// What an attempt produced, written when it settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    /// Response status, if any.
    pub response_status: Option<u16>,
    /// Truncated response body, if any.
    pub response_body: Option<String>,
    /// Failure description, if any.
    pub error: Option<String>,
    /// When the attempt finished.
    pub at: DateTime<Utc>,
}

/// A failed attempt to settle through [`DeliveryStorage::record_failure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    /// Endpoint the failure counts against.
    pub endpoint_id: WebhookEndpointId,
    /// Attempt number the caller observed.
    pub attempt: u32,
    /// What the attempt produced. `error` is stored unless the endpoint is
    /// disabled, in which case it is wrapped by [`endpoint_disabled_error`].
    pub outcome: AttemptOutcome,
    /// When the next attempt is due, if the retry budget allows one.
    pub retry_at: Option<DateTime<Utc>>,
    /// Consecutive failures at which the endpoint is disabled.
    pub failure_threshold: u32,
}

/// How [`DeliveryStorage::record_failure`] settled an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureSettlement {
    /// The attempt had already moved on. Nothing was written.
    Stale,
    /// The attempt now waits for its next try.
    RetryScheduled {
        /// Endpoint counter after this failure.
        consecutive_failures: u32,
        /// When the next attempt is due.
        next_retry_at: DateTime<Utc>,
    },
    /// The attempt failed terminally.
    Failed {
        /// Endpoint counter after this failure.
        consecutive_failures: u32,
        /// Stored error.
        error: String,
    },
    /// The attempt failed terminally and this failure disabled the endpoint.
    EndpointDisabled {
        /// Endpoint counter after this failure.
        consecutive_failures: u32,
        /// Stored error.
        error: String,
    },
}

/// Error stored on an attempt whose failure reached the endpoint threshold.
pub fn endpoint_disabled_error(consecutive_failures: u32, error: &str) -> String {
    format!("endpoint disabled after {consecutive_failures} consecutive failures: {error}")
}

/// Storage operations required by the delivery engine.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Finds an endpoint by id.
    fn find_endpoint(&self, id: WebhookEndpointId) -> StorageFuture<'_, Option<WebhookEndpoint>>;

    /// Enabled endpoints subscribed to `event_type`, directly or by wildcard.
    fn find_subscribed_endpoints(
        &self,
        event_type: String,
    ) -> StorageFuture<'_, Vec<WebhookEndpoint>>;

    /// Inserts or replaces an endpoint.
    fn upsert_endpoint(&self, endpoint: WebhookEndpoint) -> StorageFuture<'_, ()>;

    /// Enables or disables an endpoint. Enabling also clears its failure
    /// counter. Returns false if the endpoint does not exist.
    fn set_endpoint_enabled(
        &self,
        id: WebhookEndpointId,
        enabled: bool,
    ) -> StorageFuture<'_, bool>;

    /// Sets the consecutive-failure counter to zero.
    fn reset_endpoint_failures(&self, id: WebhookEndpointId) -> StorageFuture<'_, ()>;

    /// Persists an immutable event.
    fn store_event(&self, event: Event) -> StorageFuture<'_, ()>;

    /// Finds an event by id.
    fn find_event(&self, id: EventId) -> StorageFuture<'_, Option<Event>>;

    /// Persists a new pending attempt.
    fn create_attempt(&self, attempt: DeliveryAttempt) -> StorageFuture<'_, ()>;

    /// Finds an attempt by id.
    fn find_attempt(&self, id: DeliveryAttemptId) -> StorageFuture<'_, Option<DeliveryAttempt>>;

    /// Every attempt created for an event, oldest first.
    fn find_attempts_for_event(&self, event_id: EventId)
        -> StorageFuture<'_, Vec<DeliveryAttempt>>;

    /// Settles `pending@attempt` as success.
    fn mark_success(
        &self,
        id: DeliveryAttemptId,
        attempt: u32,
        outcome: AttemptOutcome,
    ) -> StorageFuture<'_, bool>;

    /// Settles `pending@attempt` as terminally failed.
    fn mark_failed(
        &self,
        id: DeliveryAttemptId,
        attempt: u32,
        outcome: AttemptOutcome,
    ) -> StorageFuture<'_, bool>;

    /// Settles a failed `pending@attempt` and counts the failure against its
    /// endpoint in one step.
    ///
    /// The incremented counter decides the settlement. At or above the
    /// threshold the attempt fails terminally and the endpoint is disabled.
    /// Below it the attempt moves to `pending@attempt+1` when `retry_at` is
    /// set and fails otherwise. Nothing changes when the attempt is no longer
    /// pending at that number.
    fn record_failure(
        &self,
        id: DeliveryAttemptId,
        failure: FailureRecord,
    ) -> StorageFuture<'_, FailureSettlement>;

    /// Pending attempts whose retry was due at or before `due_before`.
    fn find_stranded_retries(
        &self,
        due_before: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<DeliveryAttempt>>;
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

const ATTEMPT_COLUMNS: &str = "id, webhook_id, event_id, event_type, status, attempt, \
     max_attempts, created_at, scheduled_at, completed_at, response_status, response_body, \
     error, next_retry_at";

const ENDPOINT_COLUMNS: &str = "id, owner, url, secret, event_types, enabled, \
     consecutive_failures, metadata, created_at, updated_at";

/// Picks the settlement for a failure that brought the endpoint counter to
/// `failures`. Only the failure that crosses the threshold on an enabled
/// endpoint reports the disable.
fn decide_failure(
    failures: u32,
    was_enabled: bool,
    failure: &FailureRecord,
) -> FailureSettlement {
    let error = failure.outcome.error.clone().unwrap_or_default();
    if failures >= failure.failure_threshold {
        let error = endpoint_disabled_error(failures, &error);
        if was_enabled {
            return FailureSettlement::EndpointDisabled { consecutive_failures: failures, error };
        }
        return FailureSettlement::Failed { consecutive_failures: failures, error };
    }
    match failure.retry_at {
        Some(next_retry_at) => {
            FailureSettlement::RetryScheduled { consecutive_failures: failures, next_retry_at }
        },
        None => FailureSettlement::Failed { consecutive_failures: failures, error },
    }
}

/// PostgreSQL implementation of [`DeliveryStorage`].
#[derive(Debug, Clone)]
pub struct PostgresDeliveryStorage {
    pool: PgPool,
}

impl PostgresDeliveryStorage {
    /// Creates a storage adapter over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn settle(
        &self,
        id: DeliveryAttemptId,
        attempt: u32,
        status: AttemptStatus,
        outcome: AttemptOutcome,
    ) -> Result<bool> {
        let result = settle_query(id, attempt, status, outcome).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}

type PgQuery = sqlx::query::Query<'static, Postgres, PgArguments>;

fn settle_query(
    id: DeliveryAttemptId,
    attempt: u32,
    status: AttemptStatus,
    outcome: AttemptOutcome,
) -> PgQuery {
    sqlx::query(
        r"
        UPDATE delivery_attempts
        SET status = $3, completed_at = $4, response_status = $5,
            response_body = $6, error = $7, next_retry_at = NULL
        WHERE id = $1 AND attempt = $2 AND status = 'pending'
        ",
    )
    .bind(id)
    .bind(to_i32(attempt))
    .bind(status.as_str())
    .bind(outcome.at)
    .bind(outcome.response_status.map(i32::from))
    .bind(outcome.response_body)
    .bind(outcome.error)
}

fn retry_query(
    id: DeliveryAttemptId,
    attempt: u32,
    outcome: AttemptOutcome,
    next_retry_at: DateTime<Utc>,
) -> PgQuery {
    sqlx::query(
        r"
        UPDATE delivery_attempts
        SET attempt = attempt + 1, scheduled_at = $3, next_retry_at = $3,
            response_status = $4, response_body = $5, error = $6
        WHERE id = $1 AND attempt = $2 AND status = 'pending'
          AND attempt < max_attempts
        ",
    )
    .bind(id)
    .bind(to_i32(attempt))
    .bind(next_retry_at)
    .bind(outcome.response_status.map(i32::from))
    .bind(outcome.response_body)
    .bind(outcome.error)
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn find_endpoint(&self, id: WebhookEndpointId) -> StorageFuture<'_, Option<WebhookEndpoint>> {
        Box::pin(async move {
            let query = format!("SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE id = $1");
            Ok(sqlx::query_as(&query).bind(id).fetch_optional(&self.pool).await?)
        })
    }

    fn find_subscribed_endpoints(
        &self,
        event_type: String,
    ) -> StorageFuture<'_, Vec<WebhookEndpoint>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints
                 WHERE enabled AND ($1 = ANY(event_types) OR '*' = ANY(event_types))
                 ORDER BY created_at ASC"
            );
            Ok(sqlx::query_as(&query).bind(event_type).fetch_all(&self.pool).await?)
        })
    }

    fn upsert_endpoint(&self, endpoint: WebhookEndpoint) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO webhook_endpoints (
                    id, owner, url, secret, event_types, enabled,
                    consecutive_failures, metadata, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id) DO UPDATE SET
                    owner = EXCLUDED.owner,
                    url = EXCLUDED.url,
                    secret = EXCLUDED.secret,
                    event_types = EXCLUDED.event_types,
                    enabled = EXCLUDED.enabled,
                    consecutive_failures = EXCLUDED.consecutive_failures,
                    metadata = EXCLUDED.metadata,
                    updated_at = EXCLUDED.updated_at
                ",
            )
            .bind(endpoint.id)
            .bind(&endpoint.owner)
            .bind(&endpoint.url)
            .bind(&endpoint.secret)
            .bind(&endpoint.event_types)
            .bind(endpoint.enabled)
            .bind(to_i32(endpoint.consecutive_failures))
            .bind(&endpoint.metadata)
            .bind(endpoint.created_at)
            .bind(endpoint.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn set_endpoint_enabled(
        &self,
        id: WebhookEndpointId,
        enabled: bool,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE webhook_endpoints
                SET enabled = $2,
                    consecutive_failures = CASE WHEN $2 THEN 0 ELSE consecutive_failures END,
                    updated_at = now()
                WHERE id = $1
                ",
            )
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn reset_endpoint_failures(&self, id: WebhookEndpointId) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE webhook_endpoints
                SET consecutive_failures = 0, updated_at = now()
                WHERE id = $1 AND consecutive_failures <> 0
                ",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn store_event(&self, event: Event) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO webhook_events (id, event_type, payload, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO NOTHING
                ",
            )
            .bind(event.id)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(event.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn find_event(&self, id: EventId) -> StorageFuture<'_, Option<Event>> {
        Box::pin(async move {
            Ok(sqlx::query_as(
                "SELECT id, event_type, payload, created_at FROM webhook_events WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
        })
    }

    fn create_attempt(&self, attempt: DeliveryAttempt) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO delivery_attempts (
                    id, webhook_id, event_id, event_type, status, attempt, max_attempts,
                    created_at, scheduled_at, completed_at, response_status, response_body,
                    error, next_retry_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ",
            )
            .bind(attempt.id)
            .bind(attempt.webhook_id)
            .bind(attempt.event_id)
            .bind(&attempt.event_type)
            .bind(attempt.status.as_str())
            .bind(to_i32(attempt.attempt))
            .bind(to_i32(attempt.max_attempts))
            .bind(attempt.created_at)
            .bind(attempt.scheduled_at)
            .bind(attempt.completed_at)
            .bind(attempt.response_status.map(i32::from))
            .bind(&attempt.response_body)
            .bind(&attempt.error)
            .bind(attempt.next_retry_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn find_attempt(&self, id: DeliveryAttemptId) -> StorageFuture<'_, Option<DeliveryAttempt>> {
        Box::pin(async move {
            let query = format!("SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts WHERE id = $1");
            Ok(sqlx::query_as(&query).bind(id).fetch_optional(&self.pool).await?)
        })
    }

    fn find_attempts_for_event(
        &self,
        event_id: EventId,
    ) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts
                 WHERE event_id = $1 ORDER BY created_at ASC"
            );
            Ok(sqlx::query_as(&query).bind(event_id).fetch_all(&self.pool).await?)
        })
    }

    fn mark_success(
        &self,
        id: DeliveryAttemptId,
        attempt: u32,
        outcome: AttemptOutcome,
    ) -> StorageFuture<'_, bool> {
        Box::pin(self.settle(id, attempt, AttemptStatus::Success, outcome))
    }

    fn mark_failed(
        &self,
        id: DeliveryAttemptId,
        attempt: u32,
        outcome: AttemptOutcome,
    ) -> StorageFuture<'_, bool> {
        Box::pin(self.settle(id, attempt, AttemptStatus::Failed, outcome))
    }

    fn record_failure(
        &self,
        id: DeliveryAttemptId,
        failure: FailureRecord,
    ) -> StorageFuture<'_, FailureSettlement> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            // The row lock taken here orders concurrent failures on one endpoint.
            let (count, was_enabled): (i32, bool) = sqlx::query_as(
                r"
                UPDATE webhook_endpoints
                SET consecutive_failures = consecutive_failures + 1, updated_at = now()
                WHERE id = $1
                RETURNING consecutive_failures, enabled
                ",
            )
            .bind(failure.endpoint_id)
            .fetch_one(&mut *tx)
            .await?;
            let failures = u32::try_from(count).unwrap_or(u32::MAX);
            let settlement = decide_failure(failures, was_enabled, &failure);

            let query = match &settlement {
                FailureSettlement::RetryScheduled { next_retry_at, .. } => {
                    retry_query(id, failure.attempt, failure.outcome, *next_retry_at)
                },
                FailureSettlement::Failed { error, .. }
                | FailureSettlement::EndpointDisabled { error, .. } => {
                    let outcome = AttemptOutcome { error: Some(error.clone()), ..failure.outcome };
                    settle_query(id, failure.attempt, AttemptStatus::Failed, outcome)
                },
                FailureSettlement::Stale => return Ok(FailureSettlement::Stale),
            };
            if query.execute(&mut *tx).await?.rows_affected() != 1 {
                tx.rollback().await?;
                return Ok(FailureSettlement::Stale);
            }

            if matches!(settlement, FailureSettlement::EndpointDisabled { .. }) {
                sqlx::query("UPDATE webhook_endpoints SET enabled = false WHERE id = $1")
                    .bind(failure.endpoint_id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(settlement)
        })
    }

    fn find_stranded_retries(
        &self,
        due_before: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts
                 WHERE status = 'pending' AND next_retry_at IS NOT NULL AND next_retry_at <= $1
                 ORDER BY next_retry_at ASC"
            );
            Ok(sqlx::query_as(&query).bind(due_before).fetch_all(&self.pool).await?)
        })
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! In-memory storage for exercising delivery logic without a database.
    //!
    //! Conditional settles behave like the SQL versions: they apply only to a
    //! record that is still pending at the expected attempt.

    use std::{collections::HashMap, sync::Arc};

    use bastion_core::CoreError;
    use tokio::sync::RwLock;

    use super::*;

    /// Mock storage for testing delivery logic without database.
    #[derive(Debug, Clone, Default)]
    pub struct MockDeliveryStorage {
        endpoints: Arc<RwLock<HashMap<WebhookEndpointId, WebhookEndpoint>>>,
        events: Arc<RwLock<HashMap<EventId, Event>>>,
        attempts: Arc<RwLock<Vec<DeliveryAttempt>>>,
        find_error: Arc<RwLock<Option<String>>>,
    }

    impl MockDeliveryStorage {
        /// Creates empty storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers an endpoint.
        pub async fn add_endpoint(&self, endpoint: WebhookEndpoint) {
            self.endpoints.write().await.insert(endpoint.id, endpoint);
        }

        /// Current copy of an endpoint.
        pub async fn endpoint(&self, id: WebhookEndpointId) -> Option<WebhookEndpoint> {
            self.endpoints.read().await.get(&id).cloned()
        }

        /// Every attempt record.
        pub async fn attempts(&self) -> Vec<DeliveryAttempt> {
            self.attempts.read().await.clone()
        }

        /// Fails the next endpoint lookup with a database error.
        pub async fn inject_find_error(&self, error: impl Into<String>) {
            *self.find_error.write().await = Some(error.into());
        }

        async fn update_attempt<F>(&self, id: DeliveryAttemptId, attempt: u32, apply: F) -> bool
        where
            F: FnOnce(&mut DeliveryAttempt),
        {
            let mut attempts = self.attempts.write().await;
            match attempts.iter_mut().find(|a| a.id == id) {
                Some(record)
                    if record.status == AttemptStatus::Pending && record.attempt == attempt =>
                {
                    apply(record);
                    true
                },
                _ => false,
            }
        }

        async fn settle(
            &self,
            id: DeliveryAttemptId,
            attempt: u32,
            status: AttemptStatus,
            outcome: AttemptOutcome,
        ) -> bool {
            self.update_attempt(id, attempt, |record| {
                record.status = status;
                record.completed_at = Some(outcome.at);
                record.response_status = outcome.response_status;
                record.response_body = outcome.response_body;
                record.error = outcome.error;
                record.next_retry_at = None;
            })
            .await
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn find_endpoint(
            &self,
            id: WebhookEndpointId,
        ) -> StorageFuture<'_, Option<WebhookEndpoint>> {
            Box::pin(async move {
                if let Some(error) = self.find_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }
                Ok(self.endpoints.read().await.get(&id).cloned())
            })
        }

        fn find_subscribed_endpoints(
            &self,
            event_type: String,
        ) -> StorageFuture<'_, Vec<WebhookEndpoint>> {
            Box::pin(async move {
                let mut found: Vec<_> = self
                    .endpoints
                    .read()
                    .await
                    .values()
                    .filter(|e| e.enabled && e.subscribes_to(&event_type))
                    .cloned()
                    .collect();
                found.sort_by_key(|e| e.created_at);
                Ok(found)
            })
        }

        fn upsert_endpoint(&self, endpoint: WebhookEndpoint) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.add_endpoint(endpoint).await;
                Ok(())
            })
        }

        fn set_endpoint_enabled(
            &self,
            id: WebhookEndpointId,
            enabled: bool,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut endpoints = self.endpoints.write().await;
                let Some(endpoint) = endpoints.get_mut(&id) else {
                    return Ok(false);
                };
                endpoint.enabled = enabled;
                if enabled {
                    endpoint.consecutive_failures = 0;
                }
                endpoint.updated_at = Utc::now();
                Ok(true)
            })
        }

        fn reset_endpoint_failures(&self, id: WebhookEndpointId) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                if let Some(endpoint) = self.endpoints.write().await.get_mut(&id) {
                    endpoint.consecutive_failures = 0;
                }
                Ok(())
            })
        }

        fn store_event(&self, event: Event) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.events.write().await.entry(event.id).or_insert(event);
                Ok(())
            })
        }

        fn find_event(&self, id: EventId) -> StorageFuture<'_, Option<Event>> {
            Box::pin(async move { Ok(self.events.read().await.get(&id).cloned()) })
        }

        fn create_attempt(&self, attempt: DeliveryAttempt) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut attempts = self.attempts.write().await;
                if attempts.iter().any(|a| a.id == attempt.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "delivery attempt {} already exists",
                        attempt.id
                    )));
                }
                attempts.push(attempt);
                Ok(())
            })
        }

        fn find_attempt(
            &self,
            id: DeliveryAttemptId,
        ) -> StorageFuture<'_, Option<DeliveryAttempt>> {
            Box::pin(async move {
                Ok(self.attempts.read().await.iter().find(|a| a.id == id).cloned())
            })
        }

        fn find_attempts_for_event(
            &self,
            event_id: EventId,
        ) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
            Box::pin(async move {
                Ok(self
                    .attempts
                    .read()
                    .await
                    .iter()
                    .filter(|a| a.event_id == event_id)
                    .cloned()
                    .collect())
            })
        }

        fn mark_success(
            &self,
            id: DeliveryAttemptId,
            attempt: u32,
            outcome: AttemptOutcome,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                Ok(self.settle(id, attempt, AttemptStatus::Success, outcome).await)
            })
        }

        fn mark_failed(
            &self,
            id: DeliveryAttemptId,
            attempt: u32,
            outcome: AttemptOutcome,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                Ok(self.settle(id, attempt, AttemptStatus::Failed, outcome).await)
            })
        }

        fn record_failure(
            &self,
            id: DeliveryAttemptId,
            failure: FailureRecord,
        ) -> StorageFuture<'_, FailureSettlement> {
            Box::pin(async move {
                let mut endpoints = self.endpoints.write().await;
                let endpoint_id = failure.endpoint_id;
                let endpoint = endpoints
                    .get_mut(&endpoint_id)
                    .ok_or_else(|| CoreError::NotFound(format!("endpoint {endpoint_id}")))?;
                let failures = endpoint.consecutive_failures.saturating_add(1);
                let settlement = decide_failure(failures, endpoint.enabled, &failure);

                let mut attempts = self.attempts.write().await;
                let Some(record) = attempts.iter_mut().find(|a| {
                    a.id == id && a.status == AttemptStatus::Pending && a.attempt == failure.attempt
                }) else {
                    return Ok(FailureSettlement::Stale);
                };

                let outcome = failure.outcome;
                match &settlement {
                    FailureSettlement::RetryScheduled { next_retry_at, .. } => {
                        if record.attempt >= record.max_attempts {
                            return Ok(FailureSettlement::Stale);
                        }
                        record.attempt += 1;
                        record.scheduled_at = *next_retry_at;
                        record.next_retry_at = Some(*next_retry_at);
                        record.response_status = outcome.response_status;
                        record.response_body = outcome.response_body;
                        record.error = outcome.error;
                    },
                    FailureSettlement::Failed { error, .. }
                    | FailureSettlement::EndpointDisabled { error, .. } => {
                        record.status = AttemptStatus::Failed;
                        record.completed_at = Some(outcome.at);
                        record.response_status = outcome.response_status;
                        record.response_body = outcome.response_body;
                        record.error = Some(error.clone());
                        record.next_retry_at = None;
                    },
                    FailureSettlement::Stale => return Ok(FailureSettlement::Stale),
                }

                endpoint.consecutive_failures = failures;
                endpoint.updated_at = Utc::now();
                if matches!(settlement, FailureSettlement::EndpointDisabled { .. }) {
                    endpoint.enabled = false;
                }
                Ok(settlement)
            })
        }

        fn find_stranded_retries(
            &self,
            due_before: DateTime<Utc>,
        ) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
            Box::pin(async move {
                Ok(self
                    .attempts
                    .read()
                    .await
                    .iter()
                    .filter(|a| {
                        a.status == AttemptStatus::Pending
                            && a.next_retry_at.is_some_and(|due| due <= due_before)
                    })
                    .cloned()
                    .collect())
            })
        }
    }
}
