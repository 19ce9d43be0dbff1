//! Worker pool management with structured concurrency.
//!
//! Runs `worker_count` dispatch loops over one shared engine. This is the
//! in-process form of running several dispatcher processes: the loops do
//! not coordinate, and exclusivity still comes from the claim protocol.

use std::{sync::Arc, time::Duration};

use herald_core::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    engine::{DeliveryConfig, DeliveryEngine},
    error::{DeliveryError, Result},
};

/// Supervises the dispatch loops of one process.
pub struct WorkerPool {
    engine: Arc<DeliveryEngine>,
    config: DeliveryConfig,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Creates a pool; no loops run until [`WorkerPool::spawn_workers`].
    pub fn new(
        engine: Arc<DeliveryEngine>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { engine, config, clock, cancellation_token, worker_handles: Vec::new() }
    }

    /// Spawns `worker_count` dispatch loops.
    ///
    /// Returns once every loop is spawned. Loops run until the cancellation
    /// token fires.
    pub async fn spawn_workers(&mut self) {
        info!(worker_count = self.config.worker_count, "spawning dispatchers");

        for worker_id in 0..self.config.worker_count {
            let dispatcher = Dispatcher::new(
                worker_id,
                self.engine.clone(),
                self.clock.clone(),
                self.cancellation_token.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = dispatcher.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "dispatcher terminated with error");
                }

                result
            });

            self.worker_handles.push(handle);
        }

        let spawned = self.worker_handles.len();
        self.engine.set_active_workers(spawned).await;

        info!(spawned_workers = spawned, "all dispatchers spawned");
    }

    /// Number of spawned loops, finished or not.
    pub fn worker_count(&self) -> usize {
        self.worker_handles.len()
    }

    /// Cancels every loop and waits for in-flight batches to finish.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::WorkerPanic` if a loop panicked, and
    /// `DeliveryError::ShutdownTimeout` if the loops do not stop within
    /// `timeout`.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful dispatcher shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let shutdown_future = async {
            let mut first_panic = None;

            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(
                            worker_id,
                            error = %error,
                            "dispatcher completed with error during shutdown"
                        );
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "dispatcher panicked");
                        if first_panic.is_none() {
                            first_panic = Some(DeliveryError::WorkerPanic {
                                worker_id,
                                error: join_error.to_string(),
                            });
                        }
                    },
                }
            }

            self.engine.set_active_workers(0).await;
            first_panic
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(None) => {
                info!("dispatcher shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "dispatcher shutdown timed out, some batches may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Returns true while any loop is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active_count,
                "worker pool dropped without graceful shutdown, cancelling dispatchers"
            );
            self.cancellation_token.cancel();
        }
    }
}
