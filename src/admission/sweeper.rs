//! Periodic background eviction of expired counters.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use super::controller::AdmissionController;
use super::key::KeyExtractor;
use super::window::Clock;

/// Runs [`AdmissionController::sweep`] on a fixed period, off the request path.
pub struct Sweeper;

impl Sweeper {
    /// Spawn the sweep loop on the current tokio runtime.
    ///
    /// The loop runs until [`SweeperHandle::stop`] is called or the handle is
    /// dropped.
    pub fn spawn<K, C>(
        controller: Arc<AdmissionController<K>>,
        clock: C,
        period: Duration,
    ) -> SweeperHandle
    where
        K: KeyExtractor,
        C: Clock,
    {
        let period = period.max(Duration::from_millis(1));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks = IntervalStream::new(interval);

            info!(period_ms = period.as_millis() as u64, "Admission sweeper started");

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    tick = ticks.next() => {
                        if tick.is_none() {
                            break;
                        }
                        controller.sweep(clock.now());
                    }
                }
            }

            debug!("Admission sweeper stopped");
        });

        SweeperHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

/// Handle to a running [`Sweeper`]. Dropping it aborts the loop.
pub struct SweeperHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.task).await;
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
