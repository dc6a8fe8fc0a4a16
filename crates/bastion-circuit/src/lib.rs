//! Circuit breakers for calls to unreliable upstream dependencies.
//!
//! Each dependency key (typically one LLM provider) gets its own
//! [`CircuitBreaker`]. Call sites ask the breaker before invoking the
//! provider and report the outcome afterwards. The
//! [`CircuitBreakerManager`] hands out one breaker per key.
//!
//! # State Machine
//!
//! ```text
//!                 failure_threshold consecutive failures
//!     ┌────────┐ ─────────────────────────────────────▶ ┌────────┐
//!     │ CLOSED │                                        │  OPEN  │
//!     └────────┘ ◀──────────┐                           └────────┘
//!                           │ success_threshold             │   ▲
//!                           │ consecutive successes         │   │ any failure
//!                           │                   timeout     │   │
//!                      ┌───────────┐   elapsed, checked     │   │
//!                      │ HALF_OPEN │ ◀──────────────────────┘   │
//!                      └───────────┘ ───────────────────────────┘
//! ```
//!
//! While `HALF_OPEN`, at most `half_open_max_calls` probes are in flight at
//! once. Slots are released when a probe reports its outcome or is dropped.
//!
//! # Usage
//!
//! ```
//! use bastion_circuit::{CircuitBreakerManager, CircuitConfig};
//!
//! let manager = CircuitBreakerManager::new(CircuitConfig::default());
//!
//! if manager.should_allow_request("anthropic") {
//!     let upstream: Result<(), &str> = Ok(());
//!     match upstream {
//!         Ok(()) => manager.record_success("anthropic"),
//!         Err(_) => manager.record_failure("anthropic"),
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod breaker;
pub mod config;
pub mod error;
pub mod guard;
pub mod manager;

pub use breaker::{CircuitBreaker, CircuitStats, MetricsCallback, HALF_OPEN_RETRY_AFTER};
pub use config::{CircuitConfig, CircuitState};
pub use error::{CallError, CircuitBreakerError};
pub use guard::GuardedStream;
pub use manager::CircuitBreakerManager;
