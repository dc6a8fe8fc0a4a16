//! Outcome tracking for admitted calls.
//!
//! A [`Probe`] is created when the breaker admits a call. It must be settled
//! exactly once with a success or failure; dropping it unsettled releases
//! its half-open slot without recording anything. [`GuardedStream`] carries
//! a probe while a streaming response is consumed.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;

use crate::{
    breaker::{Admission, CircuitBreaker},
    error::CircuitBreakerError,
};

pub(crate) struct Probe {
    breaker: Arc<CircuitBreaker>,
    admission: Admission,
    settled: bool,
}

impl Probe {
    pub(crate) fn admit(breaker: Arc<CircuitBreaker>) -> Result<Self, CircuitBreakerError> {
        let admission = breaker.admit()?;
        Ok(Self { breaker, admission, settled: false })
    }

    pub(crate) fn success(mut self) {
        self.settle(true);
    }

    pub(crate) fn failure(mut self) {
        self.settle(false);
    }

    fn settle(&mut self, success: bool) {
        if !self.settled {
            self.settled = true;
            self.breaker.record_admitted(self.admission, success);
        }
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.admission);
        }
    }
}

/// Stream wrapper that reports its outcome to a circuit breaker.
///
/// Items pass through unchanged. Completion without errors records a
/// success; the first `Err` item records a failure and terminates the
/// stream.
pub struct GuardedStream<S> {
    inner: Pin<Box<S>>,
    probe: Option<Probe>,
}

impl<S> GuardedStream<S> {
    pub(crate) fn new(stream: S, probe: Probe) -> Self {
        Self { inner: Box::pin(stream), probe: Some(probe) }
    }

    /// Whether an outcome has already been recorded.
    pub fn is_settled(&self) -> bool {
        self.probe.is_none()
    }
}

impl<S, T, E> Stream for GuardedStream<S>
where
    S: Stream<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(probe) = this.probe.take() else {
            return Poll::Ready(None);
        };

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => {
                this.probe = Some(probe);
                Poll::Ready(Some(Ok(item)))
            },
            Poll::Ready(Some(Err(err))) => {
                probe.failure();
                Poll::Ready(Some(Err(err)))
            },
            Poll::Ready(None) => {
                probe.success();
                Poll::Ready(None)
            },
            Poll::Pending => {
                this.probe = Some(probe);
                Poll::Pending
            },
        }
    }
}

impl<S> std::fmt::Debug for GuardedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedStream").field("settled", &self.is_settled()).finish()
    }
}
