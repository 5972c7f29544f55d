use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::store::JobStore;

/// How often the retention sweep runs. Retention windows are measured in
/// days, so an hourly cadence is plenty.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the periodic task that prunes terminal jobs past their retention
/// window. Pruning is deliberately not part of the worker loop — workers
/// should only ever spend their poll budget on due jobs.
pub fn spawn_retention_sweeper(
    store: Arc<JobStore>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        // The first tick fires immediately; that doubles as a startup sweep.
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match store.prune() {
                        Ok((0, 0)) => {}
                        Ok((completed, failed)) => {
                            debug!(completed, failed, "retention sweep pruned jobs");
                        }
                        Err(e) => error!("retention sweep failed: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("retention sweeper shutting down");
                        break;
                    }
                }
            }
        }
    })
}
