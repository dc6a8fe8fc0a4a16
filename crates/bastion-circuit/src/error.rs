//! Errors surfaced to callers of a guarded dependency.

use std::time::Duration;

use thiserror::Error;

use crate::config::CircuitState;

/// Fail-fast rejection from a breaker that is not admitting calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker for {provider} is {state}, retry after {}s", self.retry_after_secs())]
pub struct CircuitBreakerError {
    /// Dependency key whose breaker rejected the call.
    pub provider: String,
    /// State at the time of rejection.
    pub state: CircuitState,
    /// Time until the breaker will next consider admitting a call. While
    /// half-open with every probe slot taken this is
    /// [`crate::breaker::HALF_OPEN_RETRY_AFTER`].
    pub retry_after: Duration,
}

impl CircuitBreakerError {
    /// Whole seconds until retry, rounded up and never zero.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        let rounded = if self.retry_after.subsec_nanos() > 0 { secs + 1 } else { secs };
        rounded.max(1)
    }
}

/// Failure of a call wrapped by [`crate::CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The breaker rejected the call before it started.
    #[error(transparent)]
    Rejected(CircuitBreakerError),
    /// The call ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CallError<E> {
    /// Returns the rejection, if the call never ran.
    pub fn rejection(&self) -> Option<&CircuitBreakerError> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            Self::Inner(_) => None,
        }
    }

    /// Returns the wrapped error, if the call ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(err) => Some(err),
            Self::Rejected(_) => None,
        }
    }
}
