use dashmap::DashSet;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use crate::executor::SyncExecutor;
use crate::watch::WatchManager;

/// In-process triggers: periodic auto-sync of due connections and renewal of
/// expiring watches.
pub struct Scheduler {
    executor: SyncExecutor,
    watches: WatchManager,
    active_syncs: Arc<DashSet<String>>,
    auto_sync_tick: Duration,
    renewal_interval: Duration,
}

impl Scheduler {
    pub fn new(
        executor: SyncExecutor,
        watches: WatchManager,
        active_syncs: Arc<DashSet<String>>,
        auto_sync_tick_seconds: u64,
        renewal_interval_seconds: u64,
    ) -> Self {
        Self {
            executor,
            watches,
            active_syncs,
            auto_sync_tick: Duration::from_secs(auto_sync_tick_seconds.max(1)),
            renewal_interval: Duration::from_secs(renewal_interval_seconds.max(1)),
        }
    }

    pub async fn run_auto_sync(&self) {
        let mut ticker = interval(self.auto_sync_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Auto-sync scheduler started, checking every {:?}",
            self.auto_sync_tick
        );

        loop {
            ticker.tick().await;
            debug!("Auto-sync tick");
            self.executor.sync_due_connections(&self.active_syncs).await;
        }
    }

    pub async fn run_watch_renewal(&self) {
        let mut ticker = interval(self.renewal_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Watch renewal loop started, checking every {:?}",
            self.renewal_interval
        );

        loop {
            ticker.tick().await;
            debug!("Running watch renewal check");
            self.watches.renew_expiring_watches().await;
        }
    }
}
