//! Periodic expiry sweep and time-based rule checks

use crate::cache::invalidation::CacheInvalidator;
use crate::cache::manager::CacheManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Background sweep owned by the scope that spawned it
///
/// The task is aborted when this handle is dropped.
#[derive(Debug)]
pub struct MaintenanceTask {
    handle: JoinHandle<()>,
}

impl MaintenanceTask {
    /// Run `cleanup()` and `check_time_based_rules()` every `interval`
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        manager: Arc<CacheManager>,
        invalidator: Option<Arc<CacheInvalidator>>,
        interval: Duration,
    ) -> Self {
        info!("Starting cache maintenance task (interval: {:?})", interval);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let report = manager.cleanup().await;
                let refreshed = match &invalidator {
                    Some(invalidator) => invalidator.check_time_based_rules().await,
                    None => 0,
                };

                if report.total() > 0 || refreshed > 0 {
                    debug!(
                        "Maintenance sweep: {} expired, {} refreshed by time rules",
                        report.total(),
                        refreshed
                    );
                }
            }
        });

        Self { handle }
    }

    /// Spawn with the manager's configured sweep interval
    pub fn spawn_default(
        manager: Arc<CacheManager>,
        invalidator: Option<Arc<CacheInvalidator>>,
    ) -> Self {
        let interval = manager.config().sweep_interval;
        Self::spawn(manager, invalidator, interval)
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the sweep
    pub fn stop(self) {
        drop(self)
    }
}

impl Drop for MaintenanceTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
