//! Periodic maintenance: fail stalled jobs and expire old ones.

use crate::registry::JobRegistry;
use crate::storage::Storage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct Sweeper {
    registry: Arc<JobRegistry>,
    storage: Arc<dyn Storage>,
    stall_timeout: Duration,
    retention: Option<Duration>,
}

impl Sweeper {
    pub fn new(
        registry: Arc<JobRegistry>,
        storage: Arc<dyn Storage>,
        stall_timeout: Duration,
        retention: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            storage,
            stall_timeout,
            retention,
        }
    }

    /// Run one sweep: stall detection first, then retention.
    pub async fn sweep(&self) {
        let stalled = self.registry.fail_stalled(self.stall_timeout).await;
        if !stalled.is_empty() {
            info!("Failed {} stalled jobs", stalled.len());
        }

        let Some(retention) = self.retention else {
            return;
        };
        let _exclusive = self.registry.content_write().await;
        let orphaned = self.registry.expire(retention).await;
        for id in &orphaned {
            if let Err(e) = self.storage.delete(id).await {
                warn!("Could not delete expired blob {}: {}", id, e);
            }
        }
        if !orphaned.is_empty() {
            debug!("Deleted {} expired blobs", orphaned.len());
        }
    }

    /// Sweep every `every` until `shutdown` flips.
    pub async fn run(self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => self.sweep().await,
            }
        }
        debug!("Sweeper stopped");
    }
}
