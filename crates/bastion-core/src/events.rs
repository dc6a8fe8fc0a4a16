//! Delivery outcome notifications.
//!
//! The delivery worker publishes a [`DeliveryEvent`] whenever an attempt
//! settles or an endpoint is auto-disabled. Subscribers (audit logs, owner
//! notifications, metrics exporters) implement [`EventHandler`] and are
//! fanned out through [`MulticastEventHandler`].
//!
//! ```text
//! ┌────────────────┐  DeliveryEvent  ┌──────────────────────┐
//! │ DeliveryWorker │ ───────────────▶│ MulticastEventHandler│──▶ subscriber A
//! └────────────────┘                 └──────────────────────┘──▶ subscriber B
//! ```
//!
//! Handlers observe only. A slow or failing handler never changes the
//! outcome of a delivery.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DeliveryAttemptId, EventId, WebhookEndpointId};

/// Outcome notifications emitted by the delivery worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// An attempt received a 2xx response.
    Succeeded(DeliverySucceededEvent),
    /// An attempt failed terminally.
    Failed(DeliveryFailedEvent),
    /// An endpoint crossed its consecutive-failure threshold.
    EndpointDisabled(EndpointDisabledEvent),
}

/// Emitted when a webhook delivery succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySucceededEvent {
    /// Attempt record that settled.
    pub delivery_id: DeliveryAttemptId,
    /// Event that was delivered.
    pub event_id: EventId,
    /// Receiving endpoint.
    pub webhook_id: WebhookEndpointId,
    /// HTTP status returned by the receiver.
    pub response_status: u16,
    /// Attempt number that succeeded (1-based).
    pub attempt: u32,
    /// When the response was received.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted when a webhook delivery fails with no further retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFailedEvent {
    /// Attempt record that settled.
    pub delivery_id: DeliveryAttemptId,
    /// Event that could not be delivered.
    pub event_id: EventId,
    /// Target endpoint.
    pub webhook_id: WebhookEndpointId,
    /// Last HTTP status, if a response was received.
    pub response_status: Option<u16>,
    /// Final attempt number.
    pub attempt: u32,
    /// Why the attempt failed.
    pub error: String,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

/// Emitted when an endpoint is automatically disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDisabledEvent {
    /// Endpoint that was disabled.
    pub webhook_id: WebhookEndpointId,
    /// Consecutive failures at the time of disabling.
    pub consecutive_failures: u32,
    /// Delivery whose failure crossed the threshold.
    pub triggered_by: DeliveryAttemptId,
    /// When the endpoint was disabled.
    pub disabled_at: DateTime<Utc>,
}

/// Receives delivery outcome notifications.
///
/// Implementations must not block delivery processing and must swallow
/// their own errors.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a single event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Handler that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEventHandler;

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Forwards each event to every registered subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    subscribers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a multicast handler with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber.
    pub fn subscribe(&mut self, handler: Arc<dyn EventHandler>) {
        self.subscribers.push(handler);
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether no subscriber is registered.
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let deliveries = self.subscribers.iter().map(|subscriber| {
            let event = event.clone();
            async move { subscriber.handle_event(event).await }
        });
        futures::future::join_all(deliveries).await;
    }
}
