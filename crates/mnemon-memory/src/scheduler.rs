//! Background maintenance loops.
//!
//! Each loop wakes on a fixed interval and runs one job. A single `watch`
//! channel stops every loop; a job already running finishes before its loop
//! exits. Failures are logged and the schedule continues.

use mnemon_types::error::MnemonResult;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Owns the maintenance tasks and their shutdown signal.
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// A receiver that observes the shutdown signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Spawn a loop running `job` every `period`. The first run happens one
    /// period after spawning.
    ///
    /// `job` receives a shutdown receiver so long passes can stop between
    /// batches.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, job: F)
    where
        F: Fn(watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MnemonResult<()>> + Send + 'static,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        info!(task = name, interval_secs = period.as_secs_f64(), "Starting maintenance loop");

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        info!(task = name, "Maintenance loop: shutdown signal received");
                        break;
                    }
                }
                if *shutdown.borrow() {
                    break;
                }

                debug!(task = name, "Maintenance tick");
                if let Err(e) = job(shutdown.clone()).await {
                    warn!(task = name, error = %e, "Maintenance tick failed; will retry next interval");
                }
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push((name, handle));
        }
    }

    /// Signal every loop to stop. Idempotent.
    pub fn signal_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Signal shutdown and wait for every loop to exit.
    pub async fn shutdown(&self) {
        self.signal_shutdown();
        let tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Maintenance loop ended abnormally");
            }
        }
    }

    /// Number of loops not yet joined.
    pub fn active_count(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
