//! Worker pool management with structured concurrency.
//!
//! Spawns the configured number of pipeline workers, tracks their join
//! handles, and shuts them down together.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{PipelineError, Result},
    worker::{Dispatcher, PipelineWorker},
};

/// Supervised set of pipeline workers.
///
/// Dropping a pool with running workers cancels them; call
/// [`WorkerPool::shutdown_graceful`] to wait for in-flight jobs instead.
pub(crate) struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    worker_count: usize,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Creates a pool that will run `worker_count` workers.
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, worker_count: usize) -> Self {
        let cancellation_token = dispatcher.cancellation_token.clone();
        Self { dispatcher, worker_count, cancellation_token, worker_handles: Vec::new() }
    }

    /// Spawns all workers. Returns immediately.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the pool has no workers.
    pub(crate) async fn spawn_workers(&mut self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(PipelineError::configuration("worker_count must be at least 1"));
        }

        info!(worker_count = self.worker_count, "spawning pipeline workers");
        self.dispatcher.metrics.set_active_workers(self.worker_count).await;

        for worker_id in 0..self.worker_count {
            let worker = PipelineWorker::new(
                worker_id,
                self.dispatcher.clone(),
                self.cancellation_token.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "pipeline worker terminated with error");
                } else {
                    info!(worker_id, "pipeline worker stopped gracefully");
                }

                result
            });

            self.worker_handles.push(handle);
        }

        info!(spawned_workers = self.worker_handles.len(), "all pipeline workers spawned");
        Ok(())
    }

    /// Cancels all workers and waits for them to finish their current job.
    ///
    /// # Errors
    ///
    /// Returns error if the timeout is exceeded. Panicked workers are
    /// logged but do not fail the shutdown.
    pub(crate) async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let metrics = self.dispatcher.metrics.clone();
        let shutdown_future = async move {
            let mut failures = Vec::new();

            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(
                            worker_id,
                            error = %error,
                            "worker completed with error during shutdown"
                        );
                        failures.push(error);
                    },
                    Err(join_error) => {
                        error!(
                            worker_id,
                            error = %join_error,
                            "worker task panicked during shutdown"
                        );
                        failures.push(PipelineError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }

            metrics.set_active_workers(0).await;
            failures
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(failures) => {
                if !failures.is_empty() {
                    warn!(error_count = failures.len(), "some workers failed during shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(PipelineError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Returns true while any worker task is still running.
    pub(crate) fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active,
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
