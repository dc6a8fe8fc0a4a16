//! Session state storage that survives an outage of its backing store.
//!
//! [`SessionStore`] is the key-value capability. [`PostgresSessionStore`]
//! is the durable backend and [`MemorySessionStore`] the process-local one.
//! [`ResilientSessionStore`] puts them behind one interface, serving from
//! memory while the primary is down and probing for its recovery at a
//! bounded rate. Its [`Readiness`] distinguishes degraded from unavailable.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod memory;
pub mod postgres;
pub mod readiness;
pub mod resilient;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::MemorySessionStore;
pub use postgres::PostgresSessionStore;
pub use readiness::{Readiness, ReadinessCheck};
pub use resilient::{ResilientConfig, ResilientSessionStore, SessionStoreStats, StoreMode};
pub use store::SessionStore;
