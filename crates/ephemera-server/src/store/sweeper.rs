//! Background expiry of secrets nobody retrieved.
//!
//! The sweeper is an owned handle rather than process-wide state: whoever
//! spawns it keeps the [`Sweeper`] and stops it during shutdown. Stopping
//! only prevents future runs; a sweep already in progress finishes.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::Store;

/// Time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Age after which an unretrieved secret is deleted.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval: Duration,
    pub ttl: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
            ttl: DEFAULT_TTL,
        }
    }
}

/// Handle to the running sweep task.
pub struct Sweeper {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn the sweep loop on the current Tokio runtime. The first sweep
    /// runs one `interval` after spawning.
    pub fn spawn(store: Store, config: SweepConfig) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sweep_loop(store, config, cancel.clone()));
        Self { cancel, task }
    }

    /// Cancel future sweeps.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop and wait for the loop to exit, letting an in-flight sweep finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            warn!(error = %e, "expiry sweeper task failed");
        }
    }
}

async fn run_sweep_loop(store: Store, config: SweepConfig, cancel: CancellationToken) {
    let mut ticker = time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // skip first immediate tick

    info!(
        interval_secs = config.interval.as_secs(),
        ttl_secs = config.ttl.as_secs(),
        backend = store.backend_name(),
        "expiry sweeper started"
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("expiry sweeper stopped");
                break;
            }
            _ = ticker.tick() => {
                // Awaited inside the loop, so sweeps never overlap.
                sweep_once(&store, config.ttl).await;
            }
        }
    }
}

/// Run one sweep on the blocking pool. Failures are logged and left for the
/// next tick.
async fn sweep_once(store: &Store, ttl: Duration) {
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.sweep_expired(ttl)).await {
        Ok(Ok(0)) => debug!("expiry sweep: nothing to remove"),
        Ok(Ok(removed)) => info!(removed, "expiry sweep completed"),
        Ok(Err(e)) => warn!(error = %e, "expiry sweep failed"),
        Err(e) => warn!(error = %e, "expiry sweep task panicked"),
    }
}
