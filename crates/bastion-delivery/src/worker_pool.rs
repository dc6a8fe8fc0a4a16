//! Worker pool management with structured concurrency.
//!
//! Owns the join handles of spawned delivery workers and stops them through
//! a shared cancellation token.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    worker::{DeliveryWorker, WorkerContext},
};

/// Supervises a fixed set of delivery worker tasks.
pub struct WorkerPool {
    ctx: WorkerContext,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Creates a pool that has not spawned anything yet.
    pub fn new(ctx: WorkerContext, cancellation_token: CancellationToken) -> Self {
        Self { ctx, cancellation_token, worker_handles: Vec::new() }
    }

    /// Spawns `config.worker_count` workers. Returns once they are running.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the worker count is zero.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        let worker_count = self.ctx.config.worker_count;
        if worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }

        info!(worker_count, "spawning delivery workers");
        self.ctx.stats.write().await.active_workers = worker_count;

        for worker_id in 0..worker_count {
            let worker =
                DeliveryWorker::new(worker_id, self.ctx.clone(), self.cancellation_token.clone());

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }
                result
            });

            self.worker_handles.push(handle);
        }

        info!(spawned_workers = self.worker_handles.len(), "all delivery workers spawned");
        Ok(())
    }

    /// Cancels every worker and waits up to `timeout` for them to finish
    /// their current job.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if workers are still running
    /// when the timeout elapses, or `DeliveryError::WorkerPanic` for the first
    /// worker that panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.ctx.stats.clone();

        let shutdown = async move {
            let mut first_panic = None;
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker failed during shutdown");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked");
                        first_panic.get_or_insert(DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }
            stats.write().await.active_workers = 0;
            first_panic
        };

        match tokio::time::timeout(timeout, shutdown).await {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Whether any spawned worker is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|handle| !handle.is_finished())
    }

    /// Number of spawned workers.
    pub fn worker_count(&self) -> usize {
        self.worker_handles.len()
    }
}
