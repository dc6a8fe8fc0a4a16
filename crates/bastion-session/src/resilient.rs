//! Session store with automatic failover to process-local storage.
//!
//! [`ResilientSessionStore`] fronts a durable primary and an in-memory
//! fallback. It is always in exactly one [`StoreMode`]:
//!
//! ```text
//!            primary call fails (fallback enabled)
//!   ┌─────────┐ ─────────────────────────────────▶ ┌──────────┐
//!   │ Primary │                                    │ Fallback │
//!   └─────────┘ ◀───────────────────────────────── └──────────┘
//!              probe succeeds, at most once per
//!              reconnect_interval
//! ```
//!
//! Records written while in fallback stay there when the primary comes
//! back and are no longer reachable through this store. Degradation and
//! recovery are logged with distinct messages and counted in
//! [`SessionStoreStats`].

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bastion_core::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, StoreError},
    memory::MemorySessionStore,
    readiness::{Readiness, ReadinessCheck},
    store::SessionStore,
};

/// Default time between recovery probes.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Failover behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResilientConfig {
    /// Serve from the in-memory store while the primary is down. When false,
    /// primary failures propagate and construction fails if the primary is
    /// unreachable.
    pub fallback_enabled: bool,
    /// Minimum time between recovery probes.
    pub reconnect_interval: Duration,
}

impl Default for ResilientConfig {
    fn default() -> Self {
        Self { fallback_enabled: true, reconnect_interval: DEFAULT_RECONNECT_INTERVAL }
    }
}

/// Which store currently serves calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    /// The durable primary.
    Primary,
    /// The process-local fallback, while the primary is down.
    Degraded,
}

impl StoreMode {
    /// Lowercase name used in logs and health output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Degraded => "degraded",
        }
    }
}

/// Failover counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStoreStats {
    /// Current mode.
    pub mode: StoreMode,
    /// Times the store entered fallback mode.
    pub degradations: u64,
    /// Times the store returned to the primary.
    pub recoveries: u64,
    /// Recovery probes sent to the primary.
    pub probes: u64,
}

enum Active<'a, P> {
    Primary(&'a P),
    Fallback(&'a MemorySessionStore),
}

macro_rules! dispatch {
    ($active:expr, $method:ident($($arg:expr),*)) => {
        match $active {
            Active::Primary(store) => store.$method($($arg),*).await,
            Active::Fallback(store) => store.$method($($arg),*).await,
        }
    };
}

/// Probes for recovery, runs the call on the active store and, if the
/// primary fails it with an unavailability error, fails over and runs it
/// once more on whatever store is active then.
macro_rules! with_failover {
    ($self:ident . $method:ident($($arg:expr),*)) => {{
        $self.maybe_recover().await;
        let active = $self.active();
        let ran_on_primary = matches!(active, Active::Primary(_));
        match dispatch!(active, $method($($arg),*)) {
            Err(error) if ran_on_primary && error.is_unavailable() => {
                $self.fail_over(error)?;
                dispatch!($self.active(), $method($($arg),*))
            },
            other => other,
        }
    }};
}

/// Primary store with an in-memory fallback and rate-limited recovery.
#[derive(Debug)]
pub struct ResilientSessionStore<P> {
    primary: P,
    fallback: MemorySessionStore,
    config: ResilientConfig,
    clock: Arc<dyn Clock>,
    degraded: AtomicBool,
    last_probe: Mutex<Instant>,
    degradations: AtomicU64,
    recoveries: AtomicU64,
    probes: AtomicU64,
}

impl<P: SessionStore> ResilientSessionStore<P> {
    /// Connects to `primary`, falling back when it is unreachable.
    ///
    /// # Errors
    ///
    /// Returns the primary's error if it is unreachable and fallback is
    /// disabled.
    pub async fn new(
        primary: P,
        fallback: MemorySessionStore,
        config: ResilientConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = Self {
            primary,
            fallback,
            last_probe: Mutex::new(clock.now()),
            clock,
            config,
            degraded: AtomicBool::new(false),
            degradations: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            probes: AtomicU64::new(0),
        };

        match store.primary.connect().await {
            Ok(()) => info!("session store connected to primary"),
            Err(error) => store.fail_over(error)?,
        }
        Ok(store)
    }

    /// Current mode.
    pub fn mode(&self) -> StoreMode {
        if self.degraded.load(Ordering::Acquire) {
            StoreMode::Degraded
        } else {
            StoreMode::Primary
        }
    }

    /// Whether calls are being served by the fallback.
    pub fn is_degraded(&self) -> bool {
        self.mode() == StoreMode::Degraded
    }

    /// Failover counters.
    pub fn stats(&self) -> SessionStoreStats {
        SessionStoreStats {
            mode: self.mode(),
            degradations: self.degradations.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            probes: self.probes.load(Ordering::Relaxed),
        }
    }

    /// Failover configuration.
    pub fn config(&self) -> &ResilientConfig {
        &self.config
    }

    fn active(&self) -> Active<'_, P> {
        match self.mode() {
            StoreMode::Primary => Active::Primary(&self.primary),
            StoreMode::Degraded => Active::Fallback(&self.fallback),
        }
    }

    /// Switches to the fallback after a primary failure, or returns the
    /// error when fallback is disabled. Succeeds without a second switch when
    /// a concurrent call already failed over.
    fn fail_over(&self, error: StoreError) -> Result<()> {
        if !self.config.fallback_enabled {
            return Err(error);
        }

        // Restart the probe timer so recovery waits a full interval.
        if let Ok(mut last_probe) = self.last_probe.try_lock() {
            *last_probe = self.clock.now();
        }
        if !self.degraded.swap(true, Ordering::AcqRel) {
            self.degradations.fetch_add(1, Ordering::Relaxed);
            warn!(
                error = %error,
                reconnect_interval_secs = self.config.reconnect_interval.as_secs(),
                "session store entered degraded mode, serving from in-memory fallback"
            );
        }
        Ok(())
    }

    /// Probes the primary if degraded and the interval has elapsed. Callers
    /// that find a probe already running skip it.
    async fn maybe_recover(&self) {
        if !self.is_degraded() {
            return;
        }
        let Ok(mut last_probe) = self.last_probe.try_lock() else {
            return;
        };
        let now = self.clock.now();
        if now.saturating_duration_since(*last_probe) < self.config.reconnect_interval {
            return;
        }
        *last_probe = now;
        self.probes.fetch_add(1, Ordering::Relaxed);

        match self.primary.connect().await {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::AcqRel) {
                    self.recoveries.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "session store recovered, serving from primary; \
                         records written during the outage remain only in the fallback"
                    );
                }
            },
            Err(error) => debug!(error = %error, "session store recovery probe failed"),
        }
    }
}

#[async_trait]
impl<P: SessionStore> SessionStore for ResilientSessionStore<P> {
    async fn connect(&self) -> Result<()> {
        with_failover!(self.connect())
    }

    async fn save(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        with_failover!(self.save(key, value, ttl))
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        with_failover!(self.load(key))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        with_failover!(self.delete(key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        with_failover!(self.exists(key))
    }

    async fn cleanup(&self) -> Result<u64> {
        with_failover!(self.cleanup())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        with_failover!(self.list(prefix))
    }
}

#[async_trait]
impl<P: SessionStore> ReadinessCheck for ResilientSessionStore<P> {
    fn name(&self) -> &str {
        "session_store"
    }

    async fn readiness(&self) -> Readiness {
        match self.connect().await {
            Ok(()) if self.is_degraded() => Readiness::Degraded,
            Ok(()) => Readiness::Ready,
            Err(_) => Readiness::Unavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use bastion_core::TestClock;
    use serde_json::json;

    use super::*;
    use crate::store::mock::ToggleStore;

    struct Setup {
        store: ResilientSessionStore<ToggleStore>,
        primary: ToggleStore,
        clock: TestClock,
    }

    async fn setup(primary_up: bool, fallback_enabled: bool) -> Result<Setup> {
        let clock = TestClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let primary = ToggleStore::new(MemorySessionStore::new(shared.clone()));
        primary.set_available(primary_up);
        let config = ResilientConfig {
            fallback_enabled,
            reconnect_interval: Duration::from_secs(30),
        };
        let store = ResilientSessionStore::new(
            primary.clone(),
            MemorySessionStore::new(shared.clone()),
            config,
            shared,
        )
        .await?;
        Ok(Setup { store, primary, clock })
    }

    #[tokio::test]
    async fn unreachable_primary_is_fatal_without_fallback() {
        let err = setup(false, false).await.err().unwrap();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn unreachable_primary_degrades_with_fallback() {
        let s = setup(false, true).await.unwrap();
        assert_eq!(s.store.mode(), StoreMode::Degraded);
        assert_eq!(s.store.mode().as_str(), "degraded");
        assert_eq!(serde_json::to_value(s.store.stats()).unwrap()["mode"], "degraded");
        assert_eq!(s.store.stats().degradations, 1);

        s.store.save("k", &json!("v"), None).await.unwrap();
        assert_eq!(s.store.load("k").await.unwrap(), Some(json!("v")));
        assert!(s.store.exists("k").await.unwrap());
        assert!(s.store.delete("k").await.unwrap());
        assert!(s.primary.inner().is_empty().await);
    }

    #[tokio::test]
    async fn recovery_waits_for_interval_and_orphans_fallback_writes() {
        let s = setup(false, true).await.unwrap();
        s.store.save("during-outage", &json!(1), None).await.unwrap();
        s.primary.set_available(true);

        s.clock.advance(Duration::from_secs(29));
        s.store.exists("x").await.unwrap();
        assert!(s.store.is_degraded());

        s.clock.advance(Duration::from_secs(1));
        assert_eq!(s.store.load("during-outage").await.unwrap(), None);
        assert_eq!(s.store.mode(), StoreMode::Primary);
        assert_eq!(s.store.stats().recoveries, 1);
    }

    #[tokio::test]
    async fn failed_probe_stays_degraded_and_rearms() {
        let s = setup(false, true).await.unwrap();
        let initial = s.primary.connect_attempts();

        s.clock.advance(Duration::from_secs(30));
        s.store.list("").await.unwrap();
        s.store.list("").await.unwrap();
        assert!(s.store.is_degraded());
        assert_eq!(s.primary.connect_attempts(), initial + 1);
        assert_eq!(s.store.stats().probes, 1);
    }

    #[tokio::test]
    async fn mid_run_failure_fails_over_and_retries_once() {
        let s = setup(true, true).await.unwrap();
        s.store.save("before", &json!(1), None).await.unwrap();
        assert_eq!(s.primary.inner().load("before").await.unwrap(), Some(json!(1)));

        s.primary.set_available(false);
        s.store.save("after", &json!(2), None).await.unwrap();

        assert!(s.store.is_degraded());
        assert_eq!(s.store.load("after").await.unwrap(), Some(json!(2)));
        assert_eq!(s.primary.inner().load("after").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mid_run_failure_propagates_without_fallback() {
        let s = setup(true, false).await.unwrap();
        s.primary.set_available(false);
        let err = s.store.load("k").await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(s.store.mode(), StoreMode::Primary);
    }

    #[tokio::test]
    async fn caller_errors_do_not_fail_over() {
        let s = setup(true, true).await.unwrap();
        let err = s.store.save("", &json!(1), None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
        assert_eq!(s.store.mode(), StoreMode::Primary);
    }

    #[tokio::test]
    async fn readiness_reports_degraded_separately() {
        let s = setup(true, true).await.unwrap();
        assert_eq!(s.store.readiness().await, Readiness::Ready);

        s.primary.set_available(false);
        assert_eq!(s.store.readiness().await, Readiness::Degraded);

        let strict = setup(true, false).await.unwrap();
        strict.primary.set_available(false);
        assert_eq!(strict.store.readiness().await, Readiness::Unavailable);
    }
}
