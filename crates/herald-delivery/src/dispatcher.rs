//! Dispatch loop: the outermost fault boundary of the engine.
//!
//! A dispatcher runs one cycle as soon as it starts and then starts a cycle
//! at every multiple of the poll interval, so the period does not stretch
//! with batch duration. A cycle that overruns its interval skips the ticks
//! it missed instead of running them back to back. A failed cycle is logged
//! and the next one runs on schedule; the loop holds no task state between
//! cycles.

use std::{sync::Arc, time::Duration};

use herald_core::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{engine::DeliveryEngine, error::Result};

/// A single dispatch loop over a shared engine.
pub struct Dispatcher {
    id: usize,
    engine: Arc<DeliveryEngine>,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl Dispatcher {
    /// Creates a dispatcher that polls at the engine's configured interval.
    pub fn new(
        id: usize,
        engine: Arc<DeliveryEngine>,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let poll_interval = engine.config().poll_interval;
        Self { id, engine, poll_interval, clock, cancellation_token }
    }

    /// Identifier used in logs.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Runs cycles until the cancellation token fires.
    ///
    /// Cancellation is observed between cycles: a batch that has started is
    /// always finished.
    ///
    /// # Errors
    ///
    /// Never returns an error today; cycle failures are logged and the loop
    /// continues.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker_id = self.id,
            poll_interval_ms = self.poll_interval.as_millis(),
            "dispatcher starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "dispatcher received shutdown signal");
                break;
            }

            let cycle_started = self.clock.now();
            self.run_cycle().await;
            let elapsed = self.clock.now().saturating_duration_since(cycle_started);

            if elapsed > self.poll_interval {
                warn!(
                    worker_id = self.id,
                    cycle_ms = elapsed.as_millis(),
                    poll_interval_ms = self.poll_interval.as_millis(),
                    "dispatch cycle overran the poll interval, skipping missed ticks"
                );
            }

            tokio::select! {
                () = self.clock.sleep(next_tick_delay(self.poll_interval, elapsed)) => {},
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!(worker_id = self.id, "dispatcher stopped");
        Ok(())
    }

    /// Runs one claim-and-deliver cycle, logging any failure.
    ///
    /// Returns the number of tasks processed, or `None` if the cycle failed.
    pub async fn run_cycle(&self) -> Option<usize> {
        match self.engine.fetch_and_process_batch().await {
            Ok(processed) => {
                if processed > 0 {
                    debug!(worker_id = self.id, processed, "dispatch cycle completed");
                }
                Some(processed)
            },
            Err(error) => {
                error!(worker_id = self.id, error = %error, "dispatch cycle failed");
                None
            },
        }
    }
}

/// Time from the end of a cycle that took `elapsed` to the next tick of a
/// `period` schedule anchored at the cycle's start.
fn next_tick_delay(period: Duration, elapsed: Duration) -> Duration {
    if elapsed < period {
        return period - elapsed;
    }
    let period_ns = period.as_nanos();
    if period_ns == 0 {
        return Duration::ZERO;
    }
    let into_tick = elapsed.as_nanos() % period_ns;
    if into_tick == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(u64::try_from(period_ns - into_tick).unwrap_or(u64::MAX))
}
