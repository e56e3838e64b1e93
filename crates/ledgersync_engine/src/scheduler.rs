//! Background scheduling of sync cycles.
//!
//! One tokio task owns the timing: a startup cycle, a fixed interval, and
//! on-demand triggers. Cycles themselves are blocking and run on the
//! blocking pool, so the foreground never waits on network I/O.

use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::local::LocalStore;
use crate::remote::RemoteAdapter;
use crate::status::SyncStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Starts background sync loops.
#[derive(Debug)]
pub struct Scheduler;

impl Scheduler {
    /// Spawns the scheduling loop for `engine` on the current tokio runtime.
    ///
    /// Timing comes from the engine's [`SyncConfig`](crate::SyncConfig).
    pub fn start<R, L>(engine: Arc<SyncEngine<R, L>>) -> SchedulerHandle<R, L>
    where
        R: RemoteAdapter + 'static,
        L: LocalStore + 'static,
    {
        engine.reset_cancel();
        let trigger = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(
            Arc::clone(&engine),
            Arc::clone(&trigger),
            shutdown_rx,
        ));
        info!(
            interval_secs = engine.config().interval.as_secs(),
            sync_on_startup = engine.config().sync_on_startup,
            "Sync scheduler started"
        );
        SchedulerHandle {
            engine,
            trigger,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Control surface for a running scheduler.
pub struct SchedulerHandle<R: RemoteAdapter, L: LocalStore> {
    engine: Arc<SyncEngine<R, L>>,
    trigger: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl<R: RemoteAdapter, L: LocalStore> SchedulerHandle<R, L> {
    /// Requests a cycle as soon as possible without waiting for it.
    ///
    /// Requests made while a cycle runs collapse into one follow-up cycle.
    pub fn sync_now(&self) {
        debug!("Sync requested");
        self.trigger.notify_one();
    }

    /// Returns the current sync status.
    pub fn get_status(&self) -> SyncStatus {
        self.engine.get_status()
    }

    /// Returns the scheduled engine.
    pub fn engine(&self) -> &Arc<SyncEngine<R, L>> {
        &self.engine
    }

    /// Returns true while the loop is alive.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the loop. A running cycle finishes its current batch first.
    pub async fn shutdown(self) {
        self.engine.cancel();
        // Fails only if the loop already exited.
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Sync scheduler task failed");
        }
        info!("Sync scheduler stopped");
    }
}

async fn run_loop<R, L>(
    engine: Arc<SyncEngine<R, L>>,
    trigger: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: RemoteAdapter + 'static,
    L: LocalStore + 'static,
{
    let config = engine.config().clone();
    let mut delay = if config.sync_on_startup {
        config.startup_delay
    } else {
        config.interval
    };
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = trigger.notified() => debug!("Running requested sync"),
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        let cycle_engine = Arc::clone(&engine);
        let result = tokio::task::spawn_blocking(move || cycle_engine.sync()).await;
        delay = match result {
            Ok(Ok(_)) => {
                failures = 0;
                config.interval
            }
            Ok(Err(SyncError::Disabled)) => config.interval,
            Ok(Err(SyncError::Cancelled)) => break,
            Ok(Err(e)) => {
                failures = failures.saturating_add(1);
                let backoff = next_delay(config.interval, config.backoff.delay_for_attempt(failures));
                warn!(
                    error = %e,
                    kind = %e.kind(),
                    failures,
                    retry_in_secs = backoff.as_secs(),
                    "Sync cycle failed, backing off"
                );
                backoff
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                error!(error = %e, "Sync cycle panicked");
                next_delay(config.interval, config.backoff.delay_for_attempt(failures))
            }
        };
    }
}

fn next_delay(interval: Duration, backoff: Duration) -> Duration {
    interval.max(backoff)
}
