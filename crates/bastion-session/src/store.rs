//! The session key-value capability shared by every backend.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, StoreError};

/// Longest accepted session key, in bytes.
pub const MAX_KEY_LEN: usize = 512;

/// Key-value storage for session state with optional expiry.
///
/// Expired records behave as absent for `load` and `exists`, are omitted
/// from `list`, and are physically removed by `cleanup`.
#[async_trait]
pub trait SessionStore: Send + Sync + std::fmt::Debug {
    /// Checks that the store is reachable and ready for use.
    async fn connect(&self) -> Result<()>;

    /// Writes `value` under `key`, replacing any previous value.
    async fn save(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()>;

    /// Reads the value under `key`.
    async fn load(&self, key: &str) -> Result<Option<Value>>;

    /// Removes `key`. Returns whether a live record was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether a live record exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Removes expired records and returns how many were removed.
    async fn cleanup(&self) -> Result<u64>;

    /// Live keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Rejects keys no backend can store.
///
/// # Errors
///
/// Returns `StoreError::InvalidKey` for empty or oversized keys.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidKey(format!("key exceeds {MAX_KEY_LEN} bytes")));
    }
    Ok(())
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! A store whose availability tests can switch off and on.

    use std::sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    };

    use super::*;
    use crate::memory::MemorySessionStore;

    /// In-memory store that fails every call with `Unavailable` while down.
    #[derive(Debug, Clone)]
    pub struct ToggleStore {
        inner: MemorySessionStore,
        available: Arc<AtomicBool>,
        connects: Arc<AtomicU32>,
    }

    impl ToggleStore {
        /// Wraps `inner`, initially available.
        pub fn new(inner: MemorySessionStore) -> Self {
            Self {
                inner,
                available: Arc::new(AtomicBool::new(true)),
                connects: Arc::new(AtomicU32::new(0)),
            }
        }

        /// Simulates an outage or a recovery.
        pub fn set_available(&self, available: bool) {
            self.available.store(available, Ordering::SeqCst);
        }

        /// Number of `connect` calls so far.
        pub fn connect_attempts(&self) -> u32 {
            self.connects.load(Ordering::SeqCst)
        }

        /// The wrapped store, bypassing availability.
        pub fn inner(&self) -> &MemorySessionStore {
            &self.inner
        }

        /// Suspends once before answering, so concurrent callers interleave
        /// the way they would on a real connection.
        async fn check(&self) -> Result<()> {
            tokio::task::yield_now().await;
            if self.available.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::unavailable("connection refused"))
            }
        }
    }

    #[async_trait]
    impl SessionStore for ToggleStore {
        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.check().await
        }

        async fn save(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
            self.check().await?;
            self.inner.save(key, value, ttl).await
        }

        async fn load(&self, key: &str) -> Result<Option<Value>> {
            self.check().await?;
            self.inner.load(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.check().await?;
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            self.check().await?;
            self.inner.exists(key).await
        }

        async fn cleanup(&self) -> Result<u64> {
            self.check().await?;
            self.inner.cleanup().await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.check().await?;
            self.inner.list(prefix).await
        }
    }
}
