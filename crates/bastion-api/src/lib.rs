//! Configuration and operational HTTP surface for bastion.
//!
//! The router exposes liveness, readiness and health probes, delivery status
//! read-back, and circuit breaker snapshots. Readiness reports `degraded`
//! separately from `unavailable` so orchestrators keep routing traffic to an
//! instance that is serving sessions from its in-memory fallback.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use bastion_circuit::CircuitBreakerManager;
use bastion_core::Clock;
use bastion_delivery::DeliveryStorage;
use bastion_session::ReadinessCheck;

pub mod config;
pub mod handlers;
pub mod readiness;
pub mod server;

pub use config::Config;
pub use readiness::DatabaseCheck;
pub use server::{create_router, shutdown_signal, start_server};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Delivery records for status read-back.
    pub deliveries: Arc<dyn DeliveryStorage>,
    /// Breakers guarding outbound dependencies.
    pub circuits: Arc<CircuitBreakerManager>,
    /// Components whose readiness gates traffic.
    pub checks: Arc<[Arc<dyn ReadinessCheck>]>,
    /// Time source for response timestamps and probe timing.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Bundles the shared handles.
    pub fn new(
        deliveries: Arc<dyn DeliveryStorage>,
        circuits: Arc<CircuitBreakerManager>,
        checks: Vec<Arc<dyn ReadinessCheck>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { deliveries, circuits, checks: checks.into(), clock }
    }
}
