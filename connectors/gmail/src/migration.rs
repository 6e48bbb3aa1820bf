use serde::Serialize;
use shared::models::WatchStatus;
use shared::{ConnectionStore, DatabaseError, WatchSubscriptionStore};
use std::sync::Arc;
use tracing::{error, info};

use crate::watch::{WatchManager, WatchSetupResult};

/// Failure of one connection during a migration or rollback.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MigrationError {
    pub connection_id: String,
    pub error: String,
}

impl MigrationError {
    fn new(connection_id: &str, error: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MigrationResult {
    pub success: bool,
    pub total_connections: usize,
    pub watches_setup: usize,
    pub failed: usize,
    pub errors: Vec<MigrationError>,
    /// Set when the connections could not be loaded at all.
    pub load_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RollbackResult {
    pub success: bool,
    pub total_connections: usize,
    pub disabled: usize,
    pub failed: usize,
    pub errors: Vec<MigrationError>,
    /// Set when the connections could not be loaded at all.
    pub load_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MigrationStatus {
    pub total_connections: usize,
    pub watch_enabled: usize,
    pub polling_only: usize,
    pub needs_reauth: usize,
    pub active_subscriptions: i64,
    pub failed_subscriptions: i64,
    pub expired_subscriptions: i64,
}

/// Moves connections between polling-only and push-notification mode.
/// Connections are handled one at a time; one failure never aborts the rest
/// and successful connections stay migrated.
#[derive(Clone)]
pub struct MigrationManager {
    connections: Arc<dyn ConnectionStore>,
    subscriptions: Arc<dyn WatchSubscriptionStore>,
    watches: WatchManager,
}

impl MigrationManager {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        subscriptions: Arc<dyn WatchSubscriptionStore>,
        watches: WatchManager,
    ) -> Self {
        Self {
            connections,
            subscriptions,
            watches,
        }
    }

    pub async fn migrate_all_connections(&self) -> MigrationResult {
        let pending = match self.connections.find_by_watch_enabled(false).await {
            Ok(pending) => pending,
            Err(e) => {
                error!("Failed to load connections for migration: {}", e);
                return MigrationResult {
                    load_error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let mut result = MigrationResult {
            total_connections: pending.len(),
            ..Default::default()
        };
        for connection in &pending {
            let setup = self.watches.setup_watch(&connection.id).await;
            if setup.success {
                result.watches_setup += 1;
            } else {
                result.failed += 1;
                result
                    .errors
                    .push(MigrationError::new(&connection.id, setup_error(&setup)));
            }
        }
        result.success = result.failed == 0;

        info!(
            "Migration finished: {} of {} connections on push notifications, {} failed",
            result.watches_setup, result.total_connections, result.failed
        );
        result
    }

    pub async fn rollback_migration(&self) -> RollbackResult {
        let enabled = match self.connections.find_by_watch_enabled(true).await {
            Ok(enabled) => enabled,
            Err(e) => {
                error!("Failed to load connections for rollback: {}", e);
                return RollbackResult {
                    load_error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let mut result = RollbackResult {
            total_connections: enabled.len(),
            ..Default::default()
        };
        for connection in &enabled {
            let stop = self.watches.stop_watch(&connection.id).await;
            if stop.success {
                result.disabled += 1;
            } else {
                result.failed += 1;
                result.errors.push(MigrationError::new(
                    &connection.id,
                    stop.error.as_deref().unwrap_or("unknown error"),
                ));
            }
        }
        result.success = result.failed == 0;

        info!(
            "Rollback finished: {} of {} connections back on polling, {} failed",
            result.disabled, result.total_connections, result.failed
        );
        result
    }

    pub async fn get_migration_status(&self) -> Result<MigrationStatus, DatabaseError> {
        let connections = self.connections.find_all().await?;
        let watch_enabled = connections.iter().filter(|c| c.watch_enabled).count();

        Ok(MigrationStatus {
            total_connections: connections.len(),
            watch_enabled,
            polling_only: connections.len() - watch_enabled,
            needs_reauth: connections.iter().filter(|c| c.needs_reauth).count(),
            active_subscriptions: self
                .subscriptions
                .count_by_status(WatchStatus::Active)
                .await?,
            failed_subscriptions: self
                .subscriptions
                .count_by_status(WatchStatus::Failed)
                .await?,
            expired_subscriptions: self
                .subscriptions
                .count_by_status(WatchStatus::Expired)
                .await?,
        })
    }

    pub async fn migrate_connection(&self, connection_id: &str) -> WatchSetupResult {
        self.watches.setup_watch(connection_id).await
    }
}

fn setup_error(setup: &WatchSetupResult) -> &str {
    setup.error.as_deref().unwrap_or("unknown error")
}
