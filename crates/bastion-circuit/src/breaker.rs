//! Single-dependency circuit breaker.
//!
//! All bookkeeping for one key lives behind one mutex, so
//! `should_allow_request`, `record_success` and `record_failure` observe and
//! mutate state atomically with respect to each other. The lock is never
//! held across an await point or while invoking the metrics callback.

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant, SystemTime},
};

use bastion_core::{Clock, RealClock};
use futures::Stream;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::{CircuitConfig, CircuitState},
    error::{CallError, CircuitBreakerError},
    guard::{GuardedStream, Probe},
};

/// Retry hint given to callers turned away because every half-open probe
/// slot is taken. Probe outcomes have no deadline, so this is a fixed pause.
pub const HALF_OPEN_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Observer invoked with the dependency key and resulting state when the
/// breaker opens, closes, or rejects a request.
pub type MetricsCallback = Arc<dyn Fn(&str, CircuitState) + Send + Sync>;

/// Point-in-time snapshot of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStats {
    /// Dependency key.
    pub key: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures recorded while closed.
    pub consecutive_failures: u32,
    /// Consecutive successes recorded while half-open.
    pub consecutive_successes: u32,
    /// Wall-clock time of the most recent counted failure.
    pub last_failure_at: Option<SystemTime>,
    /// Probes currently admitted while half-open.
    pub half_open_in_flight: u32,
    /// Times the breaker has opened.
    pub trips_total: u64,
    /// Requests rejected without being attempted.
    pub rejections_total: u64,
}

/// Proof that a call was admitted, used to attribute its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Admission {
    /// State epoch the call was admitted in.
    generation: u64,
    /// Whether the call holds a half-open probe slot.
    probe: bool,
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<(Instant, SystemTime)>,
    half_open_in_flight: u32,
    trips_total: u64,
    rejections_total: u64,
    // Bumped on every transition so late outcomes from an earlier state
    // cannot be mistaken for probe results.
    generation: u64,
}

/// Circuit breaker for one dependency key.
pub struct CircuitBreaker {
    key: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
    metrics: Option<MetricsCallback>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker using the real clock.
    pub fn new(key: impl Into<String>, config: CircuitConfig) -> Self {
        Self::with_clock(key, config, Arc::new(RealClock::new()))
    }

    /// Creates a closed breaker driven by `clock`.
    pub fn with_clock(
        key: impl Into<String>,
        config: CircuitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key: key.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState::default()),
            metrics: None,
        }
    }

    /// Attaches an observational metrics callback.
    #[must_use]
    pub fn with_metrics(mut self, callback: MetricsCallback) -> Self {
        self.metrics = Some(callback);
        self
    }

    /// Dependency key this breaker guards.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state. Does not apply the lazy open to half-open transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Asks whether a call may proceed.
    ///
    /// An `OPEN` breaker whose cooldown has elapsed moves to `HALF_OPEN` and
    /// admits the caller as its first probe. A `HALF_OPEN` breaker admits
    /// callers until `half_open_max_calls` probes are outstanding.
    pub fn should_allow_request(&self) -> bool {
        self.admit().is_ok()
    }

    /// Admits a call or explains why not.
    pub(crate) fn admit(&self) -> Result<Admission, CircuitBreakerError> {
        let now = self.clock.now();
        let (decision, notify) = {
            let mut s = self.lock();
            match s.state {
                CircuitState::Closed => {
                    (Ok(Admission { generation: s.generation, probe: false }), None)
                },
                CircuitState::Open => {
                    let waited = s.last_failure.map(|(at, _)| now.saturating_duration_since(at));
                    match waited {
                        Some(waited) if waited < self.config.timeout => {
                            s.rejections_total += 1;
                            let remaining = self.config.timeout - waited;
                            let rejection = self.rejection(CircuitState::Open, remaining);
                            (Err(rejection), Some(CircuitState::Open))
                        },
                        _ => {
                            self.enter_half_open(&mut s);
                            s.half_open_in_flight = 1;
                            (Ok(Admission { generation: s.generation, probe: true }), None)
                        },
                    }
                },
                CircuitState::HalfOpen => {
                    if s.half_open_in_flight < self.config.half_open_max_calls {
                        s.half_open_in_flight += 1;
                        (Ok(Admission { generation: s.generation, probe: true }), None)
                    } else {
                        s.rejections_total += 1;
                        let rejection =
                            self.rejection(CircuitState::HalfOpen, HALF_OPEN_RETRY_AFTER);
                        (Err(rejection), Some(CircuitState::HalfOpen))
                    }
                },
            }
        };

        if let Some(state) = notify {
            debug!(provider = %self.key, state = %state, "circuit breaker rejected request");
            self.emit(state);
        }
        decision
    }

    /// Records a successful call against the current state.
    pub fn record_success(&self) {
        self.settle(true, None);
    }

    /// Records a failed call against the current state.
    pub fn record_failure(&self) {
        self.settle(false, None);
    }

    /// Records the outcome of an admitted call.
    ///
    /// Outcomes from calls admitted before the last transition are ignored.
    pub(crate) fn record_admitted(&self, admission: Admission, success: bool) {
        self.settle(success, Some(admission));
    }

    /// Returns a probe slot held by an admitted call that never finished.
    pub(crate) fn release(&self, admission: Admission) {
        if !admission.probe {
            return;
        }
        let mut s = self.lock();
        if s.state == CircuitState::HalfOpen && s.generation == admission.generation {
            s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
        }
    }

    fn settle(&self, success: bool, admission: Option<Admission>) {
        let notify = {
            let mut s = self.lock();
            if let Some(admission) = admission {
                if admission.generation != s.generation {
                    debug!(provider = %self.key, "ignoring outcome from a previous state");
                    return;
                }
            }

            match (s.state, success) {
                (CircuitState::Closed, true) => {
                    s.consecutive_failures = 0;
                    None
                },
                (CircuitState::Closed, false) => {
                    s.consecutive_failures += 1;
                    s.last_failure = Some((self.clock.now(), self.clock.now_system()));
                    if s.consecutive_failures >= self.config.failure_threshold {
                        self.enter_open(&mut s);
                        Some(CircuitState::Open)
                    } else {
                        None
                    }
                },
                (CircuitState::HalfOpen, true) => {
                    s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
                    s.consecutive_successes += 1;
                    if s.consecutive_successes >= self.config.success_threshold {
                        self.enter_closed(&mut s);
                        Some(CircuitState::Closed)
                    } else {
                        None
                    }
                },
                (CircuitState::HalfOpen, false) => {
                    s.last_failure = Some((self.clock.now(), self.clock.now_system()));
                    self.enter_open(&mut s);
                    Some(CircuitState::Open)
                },
                (CircuitState::Open, _) => None,
            }
        };

        if let Some(state) = notify {
            self.emit(state);
        }
    }

    /// Returns the breaker to `CLOSED` and clears every counter.
    pub fn reset(&self) {
        let was = {
            let mut s = self.lock();
            let was = s.state;
            let generation = s.generation + 1;
            *s = BreakerState { generation, ..BreakerState::default() };
            was
        };
        info!(provider = %self.key, previous = %was, "circuit breaker reset");
        if was != CircuitState::Closed {
            self.emit(CircuitState::Closed);
        }
    }

    /// Snapshot of the breaker's bookkeeping.
    pub fn stats(&self) -> CircuitStats {
        let s = self.lock();
        CircuitStats {
            key: self.key.clone(),
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            consecutive_successes: s.consecutive_successes,
            last_failure_at: s.last_failure.map(|(_, wall)| wall),
            half_open_in_flight: s.half_open_in_flight,
            trips_total: s.trips_total,
            rejections_total: s.rejections_total,
        }
    }

    /// Runs `operation` if the breaker admits it and records the outcome.
    ///
    /// If the returned future is dropped before `operation` completes, the
    /// probe slot is released and no outcome is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Rejected`] without polling `operation` when the
    /// breaker is not admitting calls, or [`CallError::Inner`] when the
    /// operation itself fails.
    pub async fn call<F, T, E>(self: &Arc<Self>, operation: F) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let probe = Probe::admit(self.clone()).map_err(CallError::Rejected)?;
        match operation.await {
            Ok(value) => {
                probe.success();
                Ok(value)
            },
            Err(err) => {
                probe.failure();
                Err(CallError::Inner(err))
            },
        }
    }

    /// Gates a lazily consumed stream behind the breaker.
    ///
    /// Success is recorded only when the stream completes without yielding an
    /// error. The first `Err` item records a failure and ends the stream.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitBreakerError`] immediately if the breaker rejects
    /// the call. The stream is never polled in that case.
    pub fn guard_stream<S, T, E>(
        self: &Arc<Self>,
        stream: S,
    ) -> Result<GuardedStream<S>, CircuitBreakerError>
    where
        S: Stream<Item = Result<T, E>>,
    {
        let probe = Probe::admit(self.clone())?;
        Ok(GuardedStream::new(stream, probe))
    }

    fn enter_open(&self, s: &mut BreakerState) {
        s.state = CircuitState::Open;
        s.trips_total += 1;
        s.consecutive_successes = 0;
        s.half_open_in_flight = 0;
        s.generation += 1;
        warn!(
            provider = %self.key,
            consecutive_failures = s.consecutive_failures,
            trips_total = s.trips_total,
            cooldown_secs = self.config.timeout.as_secs(),
            "circuit breaker opened"
        );
    }

    fn enter_half_open(&self, s: &mut BreakerState) {
        s.state = CircuitState::HalfOpen;
        s.consecutive_successes = 0;
        s.half_open_in_flight = 0;
        s.generation += 1;
        info!(provider = %self.key, "circuit breaker half-open, probing upstream");
    }

    fn enter_closed(&self, s: &mut BreakerState) {
        s.state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.consecutive_successes = 0;
        s.half_open_in_flight = 0;
        s.generation += 1;
        info!(provider = %self.key, "circuit breaker closed, upstream recovered");
    }

    fn rejection(&self, state: CircuitState, retry_after: Duration) -> CircuitBreakerError {
        CircuitBreakerError { provider: self.key.clone(), state, retry_after }
    }

    fn emit(&self, state: CircuitState) {
        if let Some(callback) = &self.metrics {
            callback(&self.key, state);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use bastion_core::TestClock;

    use super::*;

    fn config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }

    fn breaker() -> (CircuitBreaker, TestClock) {
        let clock = TestClock::new();
        (CircuitBreaker::with_clock("anthropic", config(), Arc::new(clock.clone())), clock)
    }

    fn trip(breaker: &CircuitBreaker) {
        for _ in 0..breaker.config().failure_threshold {
            breaker.record_failure();
        }
    }

    #[test]
    fn starts_closed_and_allows() {
        let (breaker, _) = breaker();
        assert!(breaker.should_allow_request());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let (breaker, _) = breaker();

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.trips_total, 1);
        assert!(stats.last_failure_at.is_some());
    }

    #[test]
    fn success_in_closed_resets_failure_streak() {
        let (breaker, _) = breaker();

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 2);
    }

    #[test]
    fn open_rejects_until_timeout_then_half_opens() {
        let (breaker, clock) = breaker();
        trip(&breaker);

        clock.advance(Duration::from_secs(29));
        let rejection = breaker.admit().unwrap_err();
        assert_eq!(rejection.state, CircuitState::Open);
        assert_eq!(rejection.retry_after, Duration::from_secs(1));
        assert_eq!(breaker.stats().rejections_total, 1);

        clock.advance(Duration::from_secs(1));
        assert!(breaker.should_allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn failures_while_open_are_ignored() {
        let (breaker, clock) = breaker();
        trip(&breaker);
        clock.advance(Duration::from_secs(20));

        breaker.record_failure();

        // Cooldown still counts from the failure that tripped the breaker.
        clock.advance(Duration::from_secs(10));
        assert!(breaker.should_allow_request());
        assert_eq!(breaker.stats().trips_total, 1);
    }

    #[test]
    fn half_open_admits_bounded_probes() {
        let clock = TestClock::new();
        let config = CircuitConfig { half_open_max_calls: 2, ..config() };
        let breaker = CircuitBreaker::with_clock("openai", config, Arc::new(clock.clone()));
        trip(&breaker);
        clock.advance(Duration::from_secs(30));

        assert!(breaker.should_allow_request());
        assert!(breaker.should_allow_request());
        let rejection = breaker.admit().unwrap_err();
        assert_eq!(rejection.state, CircuitState::HalfOpen);
        assert_eq!(rejection.retry_after, HALF_OPEN_RETRY_AFTER);
        assert!(!rejection.retry_after.is_zero());
        assert_eq!(breaker.stats().half_open_in_flight, 2);

        breaker.record_success();
        assert_eq!(breaker.stats().half_open_in_flight, 1);
        assert!(breaker.should_allow_request());
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let (breaker, clock) = breaker();
        trip(&breaker);
        clock.advance(Duration::from_secs(30));

        assert!(breaker.should_allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.should_allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 0);
    }

    #[test]
    fn half_open_failure_reopens_and_counts_trip() {
        let (breaker, clock) = breaker();
        trip(&breaker);
        clock.advance(Duration::from_secs(30));
        assert!(breaker.should_allow_request());

        breaker.record_failure();

        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.trips_total, 2);
        assert!(!breaker.should_allow_request());
    }

    #[test]
    fn reset_clears_everything() {
        let (breaker, _) = breaker();
        trip(&breaker);
        let _ = breaker.should_allow_request();

        breaker.reset();

        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.trips_total, 0);
        assert_eq!(stats.rejections_total, 0);
        assert_eq!(stats.consecutive_failures, 0);
        assert!(stats.last_failure_at.is_none());
    }

    #[test]
    fn stale_outcomes_do_not_count_as_probes() {
        let (breaker, clock) = breaker();
        let admitted_closed = breaker.admit().unwrap();
        trip(&breaker);
        clock.advance(Duration::from_secs(30));
        assert!(breaker.should_allow_request());

        breaker.record_admitted(admitted_closed, true);

        let stats = breaker.stats();
        assert_eq!(stats.consecutive_successes, 0);
        assert_eq!(stats.half_open_in_flight, 1);
    }

    #[test]
    fn metrics_fire_on_open_close_and_rejection() {
        let seen: Arc<StdMutex<Vec<(String, CircuitState)>>> = Arc::default();
        let sink = seen.clone();
        let clock = TestClock::new();
        let breaker = CircuitBreaker::with_clock("gemini", config(), Arc::new(clock.clone()))
            .with_metrics(Arc::new(move |key, state| {
                sink.lock().unwrap().push((key.to_string(), state));
            }));

        trip(&breaker);
        assert!(!breaker.should_allow_request());
        clock.advance(Duration::from_secs(30));
        assert!(breaker.should_allow_request());
        breaker.record_success();
        assert!(breaker.should_allow_request());
        breaker.record_success();

        let seen = seen.lock().unwrap();
        let states: Vec<_> = seen.iter().map(|(_, s)| *s).collect();
        assert_eq!(states, vec![CircuitState::Open, CircuitState::Open, CircuitState::Closed]);
        assert!(seen.iter().all(|(key, _)| key == "gemini"));
    }

    #[tokio::test]
    async fn call_records_outcomes() {
        let clock = TestClock::new();
        let breaker = Arc::new(CircuitBreaker::with_clock("mistral", config(), Arc::new(clock)));

        for _ in 0..3 {
            let result: Result<(), CallError<&str>> = breaker.call(async { Err("503") }).await;
            assert!(matches!(result, Err(CallError::Inner("503"))));
        }

        let rejected: Result<u32, CallError<&str>> = breaker.call(async { Ok(1) }).await;
        let rejection = rejected.unwrap_err();
        assert_eq!(rejection.rejection().map(|r| r.state), Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn dropped_call_releases_probe_slot() {
        let clock = TestClock::new();
        let breaker =
            Arc::new(CircuitBreaker::with_clock("cohere", config(), Arc::new(clock.clone())));
        trip(&breaker);
        clock.advance(Duration::from_secs(30));

        {
            let pending = breaker.call(futures::future::pending::<Result<(), ()>>());
            futures::pin_mut!(pending);
            assert!(futures::poll!(pending.as_mut()).is_pending());
            assert_eq!(breaker.stats().half_open_in_flight, 1);
        }

        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::HalfOpen);
        assert_eq!(stats.half_open_in_flight, 0);
        assert!(breaker.should_allow_request());
    }
}
