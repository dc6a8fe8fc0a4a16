//! Keyed registry of circuit breakers.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bastion_core::{Clock, RealClock};

use crate::{
    breaker::{CircuitBreaker, CircuitStats, MetricsCallback},
    config::CircuitConfig,
    error::CircuitBreakerError,
};

/// Hands out one [`CircuitBreaker`] per dependency key.
///
/// The registry lock only guards the key map. Each breaker serializes its
/// own state, so calls against different providers never contend.
pub struct CircuitBreakerManager {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    metrics: Option<MetricsCallback>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl std::fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("config", &self.config)
            .field("breakers", &self.registry().len())
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerManager {
    /// Creates an empty registry using the real clock.
    pub fn new(config: CircuitConfig) -> Self {
        Self::with_clock(config, Arc::new(RealClock::new()))
    }

    /// Creates an empty registry whose breakers use `clock`.
    pub fn with_clock(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, metrics: None, breakers: Mutex::new(HashMap::new()) }
    }

    /// Attaches a metrics callback to every breaker created afterwards.
    #[must_use]
    pub fn with_metrics(mut self, callback: MetricsCallback) -> Self {
        self.metrics = Some(callback);
        self
    }

    /// Returns the breaker for `key`, creating a closed one on first use.
    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.registry();
        if let Some(existing) = breakers.get(key) {
            return existing.clone();
        }

        let mut breaker = CircuitBreaker::with_clock(key, self.config.clone(), self.clock.clone());
        if let Some(callback) = &self.metrics {
            breaker = breaker.with_metrics(callback.clone());
        }
        let breaker = Arc::new(breaker);
        breakers.insert(key.to_string(), breaker.clone());
        breaker
    }

    /// Keyed [`CircuitBreaker::should_allow_request`].
    pub fn should_allow_request(&self, key: &str) -> bool {
        self.get_or_create(key).should_allow_request()
    }

    /// Keyed admission check that returns the rejection details.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitBreakerError`] when the breaker for `key` rejects.
    pub fn check(&self, key: &str) -> Result<(), CircuitBreakerError> {
        self.get_or_create(key).admit().map(|_| ())
    }

    /// Keyed [`CircuitBreaker::record_success`].
    pub fn record_success(&self, key: &str) {
        self.get_or_create(key).record_success();
    }

    /// Keyed [`CircuitBreaker::record_failure`].
    pub fn record_failure(&self, key: &str) {
        self.get_or_create(key).record_failure();
    }

    /// Resets one breaker. Returns false if the key was never used.
    pub fn reset(&self, key: &str) -> bool {
        let breaker = self.registry().get(key).cloned();
        match breaker {
            Some(breaker) => {
                breaker.reset();
                true
            },
            None => false,
        }
    }

    /// Resets every known breaker.
    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.registry().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Snapshot for one key, if it has been used.
    pub fn stats(&self, key: &str) -> Option<CircuitStats> {
        let breaker = self.registry().get(key).cloned();
        breaker.map(|b| b.stats())
    }

    /// Snapshots for every known key, ordered by key.
    pub fn all_stats(&self) -> BTreeMap<String, CircuitStats> {
        let breakers: Vec<_> = self.registry().values().cloned().collect();
        breakers.into_iter().map(|b| (b.key().to_string(), b.stats())).collect()
    }

    /// Configuration applied to new breakers.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
