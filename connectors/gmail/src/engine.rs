use shared::{
    BatchOptions, BatchProcessor, ConnectionStore, EmailStore, PerformanceMonitor, RateLimiter,
    RetryOptions, WatchSubscriptionStore,
};
use std::sync::Arc;

use crate::auth::CredentialManager;
use crate::client::MailProvider;
use crate::executor::{AutoSyncSettings, SyncExecutor};
use crate::fetch::MessageFetcher;
use crate::history::HistorySync;
use crate::migration::MigrationManager;
use crate::processor::MessageProcessor;
use crate::watch::WatchManager;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub pubsub_topic: String,
    pub requests_per_second: u32,
    pub retry: RetryOptions,
    pub batch: BatchOptions,
    pub auto_sync: AutoSyncSettings,
}

/// External collaborators the engine runs against.
#[derive(Clone)]
pub struct EngineDeps {
    pub provider: Arc<dyn MailProvider>,
    pub connections: Arc<dyn ConnectionStore>,
    pub subscriptions: Arc<dyn WatchSubscriptionStore>,
    pub emails: Arc<dyn EmailStore>,
    pub processor: Arc<dyn MessageProcessor>,
}

/// All sync components wired to one limiter and one monitor.
#[derive(Clone)]
pub struct SyncEngine {
    pub limiter: RateLimiter,
    pub monitor: PerformanceMonitor,
    pub watches: WatchManager,
    pub executor: SyncExecutor,
    pub history: HistorySync,
    pub migration: MigrationManager,
}

impl SyncEngine {
    pub fn new(deps: EngineDeps, options: EngineOptions) -> Self {
        let limiter = RateLimiter::new(options.requests_per_second);
        let monitor = PerformanceMonitor::new();

        let credentials = CredentialManager::new(
            Arc::clone(&deps.provider),
            Arc::clone(&deps.connections),
            options.retry.clone(),
        );
        let fetcher = MessageFetcher::new(
            Arc::clone(&deps.provider),
            Arc::clone(&deps.emails),
            limiter.clone(),
            options.retry.clone(),
            BatchProcessor::new(options.batch.clone()),
        );

        let watches = WatchManager::new(
            Arc::clone(&deps.provider),
            Arc::clone(&deps.connections),
            Arc::clone(&deps.subscriptions),
            credentials.clone(),
            limiter.clone(),
            options.retry.clone(),
            monitor.clone(),
            options.pubsub_topic.clone(),
        );
        let executor = SyncExecutor::new(
            Arc::clone(&deps.provider),
            Arc::clone(&deps.connections),
            Arc::clone(&deps.emails),
            credentials.clone(),
            fetcher.clone(),
            Arc::clone(&deps.processor),
            monitor.clone(),
            options.auto_sync.clone(),
        );
        let history = HistorySync::new(
            Arc::clone(&deps.provider),
            Arc::clone(&deps.connections),
            Arc::clone(&deps.emails),
            credentials,
            fetcher,
            Arc::clone(&deps.processor),
            executor.clone(),
            monitor.clone(),
        );
        let migration = MigrationManager::new(
            Arc::clone(&deps.connections),
            Arc::clone(&deps.subscriptions),
            watches.clone(),
        );

        Self {
            limiter,
            monitor,
            watches,
            executor,
            history,
            migration,
        }
    }
}
