//! Shared domain types for the bastion resilience layer.
//!
//! Holds the webhook delivery data model, strongly-typed identifiers, the
//! clock abstraction used for deterministic tests, and the delivery outcome
//! events that downstream subscribers observe. Every other bastion crate
//! builds on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    DeliveryEvent, DeliveryFailedEvent, DeliverySucceededEvent, EndpointDisabledEvent,
    EventHandler, MulticastEventHandler, NoOpEventHandler,
};
pub use models::{
    AttemptStatus, DeliveryAttempt, DeliveryAttemptId, Event, EventId, WebhookEndpoint,
    WebhookEndpointId,
};
pub use time::{Clock, RealClock, TestClock};
