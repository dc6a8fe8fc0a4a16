//! Webhook delivery data model and strongly-typed identifiers.
//!
//! Three records make up the delivery side of the system:
//!
//! ```text
//!   WebhookEndpoint 1 ───── * DeliveryAttempt * ───── 1 Event
//!   (where, secret,           (pending → success        (immutable
//!    failure counter)          | failed)                   payload)
//! ```
//!
//! An [`Event`] is fanned out into one [`DeliveryAttempt`] per subscribed,
//! enabled [`WebhookEndpoint`]. Attempt status only ever moves forward.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, Row};
use uuid::Uuid;

use crate::error::CoreError;

/// Event type wildcard that subscribes an endpoint to everything.
pub const WILDCARD_EVENT_TYPE: &str = "*";

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl sqlx::Type<sqlx::Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <Uuid as sqlx::Type<sqlx::Postgres>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $name {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                <Uuid as sqlx::Decode<sqlx::Postgres>>::decode(value).map(Self)
            }
        }

        impl sqlx::Encode<'_, sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <Uuid as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

define_id!(
    /// Identifier of a registered webhook endpoint.
    WebhookEndpointId
);
define_id!(
    /// Identifier of an immutable event.
    EventId
);
define_id!(
    /// Identifier of a delivery attempt record. Also the idempotency key for
    /// every worker-side update.
    DeliveryAttemptId
);

/// A third-party receiver that has subscribed to event types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    /// Endpoint identifier.
    pub id: WebhookEndpointId,
    /// Owner of the registration, opaque to the delivery layer.
    pub owner: String,
    /// Destination URL. Re-validated before every send.
    pub url: String,
    /// Shared HMAC secret used to sign payloads.
    #[serde(skip_serializing)]
    pub secret: String,
    /// Subscribed event types. `*` matches every type.
    pub event_types: Vec<String>,
    /// Disabled endpoints are skipped at dequeue time.
    pub enabled: bool,
    /// Failed deliveries since the last success.
    pub consecutive_failures: u32,
    /// Free-form registration metadata.
    pub metadata: serde_json::Value,
    /// When the endpoint was registered.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    /// Creates an enabled endpoint with a zeroed failure counter.
    pub fn new(
        owner: impl Into<String>,
        url: impl Into<String>,
        secret: impl Into<String>,
        event_types: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WebhookEndpointId::new(),
            owner: owner.into(),
            url: url.into(),
            secret: secret.into(),
            event_types,
            enabled: true,
            consecutive_failures: 0,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether events of `event_type` should be delivered here.
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|t| t == WILDCARD_EVENT_TYPE || t == event_type)
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for WebhookEndpoint {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let failures: i32 = row.try_get("consecutive_failures")?;
        Ok(Self {
            id: row.try_get("id")?,
            owner: row.try_get("owner")?,
            url: row.try_get("url")?,
            secret: row.try_get("secret")?,
            event_types: row.try_get("event_types")?,
            enabled: row.try_get("enabled")?,
            consecutive_failures: non_negative(failures, "consecutive_failures")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Something that happened and that subscribers should hear about.
///
/// Events are immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier.
    pub id: EventId,
    /// Dotted event type, e.g. `conversation.completed`.
    pub event_type: String,
    /// Opaque JSON payload delivered as the envelope's `data`.
    pub payload: serde_json::Value,
    /// When the event occurred.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Creates a new event stamped with the current time.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Event {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Lifecycle state of a delivery attempt.
///
/// Transitions are monotonic: `Pending` moves to `Success` or `Failed`, and
/// terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    /// Waiting for (another) delivery attempt.
    Pending,
    /// Delivered with a 2xx response.
    Success,
    /// Terminally failed.
    Failed,
}

impl AttemptStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::InvalidInput(format!("unknown attempt status: {other}"))),
        }
    }
}

/// One event's delivery to one endpoint, across all of its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Attempt record identifier.
    pub id: DeliveryAttemptId,
    /// Target endpoint.
    pub webhook_id: WebhookEndpointId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Copied from the event for cheap filtering.
    pub event_type: String,
    /// Current status.
    pub status: AttemptStatus,
    /// 1-based number of the attempt that is pending or was last made.
    pub attempt: u32,
    /// Upper bound on `attempt`.
    pub max_attempts: u32,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the current attempt is due.
    pub scheduled_at: DateTime<Utc>,
    /// When the record reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// HTTP status of the most recent response.
    pub response_status: Option<u16>,
    /// Truncated body of the most recent response.
    pub response_body: Option<String>,
    /// Error of the most recent failed attempt.
    pub error: Option<String>,
    /// Set while a retry is scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl DeliveryAttempt {
    /// Creates the initial pending record for `event` to `webhook_id`.
    pub fn first(webhook_id: WebhookEndpointId, event: &Event, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: DeliveryAttemptId::new(),
            webhook_id,
            event_id: event.id,
            event_type: event.event_type.clone(),
            status: AttemptStatus::Pending,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            created_at: now,
            scheduled_at: now,
            completed_at: None,
            response_status: None,
            response_body: None,
            error: None,
            next_retry_at: None,
        }
    }

    /// Whether the retry budget allows another attempt after this one.
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryAttempt {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let attempt: i32 = row.try_get("attempt")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;
        let response_status: Option<i32> = row.try_get("response_status")?;

        Ok(Self {
            id: row.try_get("id")?,
            webhook_id: row.try_get("webhook_id")?,
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            status: status.parse().map_err(|e: CoreError| sqlx::Error::Decode(e.into()))?,
            attempt: non_negative(attempt, "attempt")?,
            max_attempts: non_negative(max_attempts, "max_attempts")?,
            created_at: row.try_get("created_at")?,
            scheduled_at: row.try_get("scheduled_at")?,
            completed_at: row.try_get("completed_at")?,
            response_status: response_status
                .map(|s| {
                    u16::try_from(s)
                        .map_err(|_| sqlx::Error::Decode("response_status out of range".into()))
                })
                .transpose()?,
            response_body: row.try_get("response_body")?,
            error: row.try_get("error")?,
            next_retry_at: row.try_get("next_retry_at")?,
        })
    }
}

fn non_negative(value: i32, column: &str) -> Result<u32, sqlx::Error> {
    u32::try_from(value).map_err(|_| sqlx::Error::Decode(format!("{column} is negative").into()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn wildcard_subscription_matches_everything() {
        let endpoint =
            WebhookEndpoint::new("acme", "https://hooks.example.com", "s3cret", vec!["*".into()]);
        assert!(endpoint.subscribes_to("conversation.completed"));
        assert!(endpoint.subscribes_to("anything"));
    }

    #[test]
    fn exact_subscription_matches_only_listed_types() {
        let endpoint = WebhookEndpoint::new(
            "acme",
            "https://hooks.example.com",
            "s3cret",
            vec!["conversation.completed".into()],
        );
        assert!(endpoint.subscribes_to("conversation.completed"));
        assert!(!endpoint.subscribes_to("conversation.started"));
    }

    #[test]
    fn secret_is_never_serialized() {
        let endpoint =
            WebhookEndpoint::new("acme", "https://hooks.example.com", "s3cret", vec!["*".into()]);
        let value = serde_json::to_value(&endpoint).unwrap();
        assert!(value.get("secret").is_none());
        assert_eq!(value["enabled"], json!(true));
    }

    #[test]
    fn first_attempt_is_pending_with_budget() {
        let event = Event::new("tool.invoked", json!({"tool": "search"}));
        let attempt = DeliveryAttempt::first(WebhookEndpointId::new(), &event, 3);

        assert_eq!(attempt.status, AttemptStatus::Pending);
        assert_eq!(attempt.attempt, 1);
        assert_eq!(attempt.event_type, "tool.invoked");
        assert!(attempt.has_attempts_remaining());
    }

    #[test]
    fn zero_budget_is_clamped_to_single_attempt() {
        let event = Event::new("tool.invoked", json!({}));
        let attempt = DeliveryAttempt::first(WebhookEndpointId::new(), &event, 0);
        assert_eq!(attempt.max_attempts, 1);
        assert!(!attempt.has_attempts_remaining());
    }

    #[test]
    fn attempt_status_round_trips_through_text() {
        for status in [AttemptStatus::Pending, AttemptStatus::Success, AttemptStatus::Failed] {
            assert_eq!(status.as_str().parse::<AttemptStatus>().unwrap(), status);
        }
        assert!("delivering".parse::<AttemptStatus>().is_err());
        assert!(AttemptStatus::Failed.is_terminal());
        assert!(!AttemptStatus::Pending.is_terminal());
    }

    #[test]
    fn ids_parse_from_strings() {
        let id = DeliveryAttemptId::new();
        let parsed: DeliveryAttemptId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<EventId>().is_err());
    }
}
