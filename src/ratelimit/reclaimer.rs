//! Background reclamation of idle ledgers.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::policy::fits_after_now;
use super::registry::Registry;
use crate::error::{Result, TurnstileError};

/// Periodic task that evicts idle ledgers from one registry.
///
/// Owned by whoever owns the registry. The task stops when [`shutdown`] is
/// awaited, when the `Reclaimer` is dropped, or when the registry itself is
/// gone (the task only holds a weak reference).
///
/// [`shutdown`]: Reclaimer::shutdown
pub struct Reclaimer {
    /// Time between reclamation passes
    interval: Duration,
    /// Flipped to `true` to stop the task
    shutdown_tx: watch::Sender<bool>,
    /// The spawned task, taken on shutdown
    handle: Option<JoinHandle<()>>,
}

impl Reclaimer {
    /// Spawn the reclamation task for `registry` on the current Tokio
    /// runtime.
    pub fn spawn<C: Clock + 'static>(
        registry: &Arc<Registry<C>>,
        interval: Duration,
    ) -> Result<Self> {
        if interval.is_zero() || !fits_after_now(interval.saturating_mul(2)) {
            return Err(TurnstileError::InvalidCleanupInterval(interval));
        }
        let runtime = Handle::try_current()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = runtime.spawn(run(Arc::downgrade(registry), interval, shutdown_rx));

        info!(
            interval_ms = interval.as_millis() as u64,
            horizon_ms = registry.policy().eviction_horizon().as_millis() as u64,
            "Reclaimer started"
        );

        Ok(Self {
            interval,
            shutdown_tx,
            handle: Some(handle),
        })
    }

    /// Time between reclamation passes.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the background task is still alive.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reclaimer task ended abnormally");
            }
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        // The task may already be gone, in which case nobody is listening.
        let _ = self.shutdown_tx.send(true);
    }
}

impl std::fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reclaimer")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run<C: Clock>(
    registry: Weak<Registry<C>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now();
    let mut ticker = interval_at(start.checked_add(period).unwrap_or(start), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(registry) = registry.upgrade() else {
                    debug!("Registry dropped, reclaimer exiting");
                    break;
                };
                registry.reclaim_idle();
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }

    info!("Reclaimer stopped");
}
