use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use shared::models::{Connection, WatchStatus, WatchSubscription};
use shared::{
    ApiError, ConnectionStore, DatabaseError, PerformanceMonitor, RateLimiter, RetryOptions,
    WatchSubscriptionStore,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::auth::{CredentialError, CredentialManager, REAUTH_MESSAGE};
use crate::client::MailProvider;
use crate::fetch::{call_remote, limiter_key};

pub const WATCH_LABEL: &str = "INBOX";
/// Subscriptions expiring within this window are renewed by the sweep.
pub const EXPIRING_SOON_HOURS: i64 = 24;
/// Used when the provider returns an unparseable expiration.
const DEFAULT_WATCH_LIFETIME_DAYS: i64 = 7;

#[derive(Debug, Error)]
enum WatchError {
    #[error("Connection {0} not found")]
    ConnectionNotFound(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] DatabaseError),
}

impl WatchError {
    fn is_reauth(&self) -> bool {
        matches!(self, Self::Credential(e) if e.is_reauth())
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct WatchSetupResult {
    pub success: bool,
    pub history_id: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub reauth_required: bool,
}

impl WatchSetupResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    fn from_error(e: &WatchError) -> Self {
        if e.is_reauth() {
            Self {
                error: Some(REAUTH_MESSAGE.to_string()),
                reauth_required: true,
                ..Default::default()
            }
        } else {
            Self::failed(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct WatchStopResult {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RenewalSweep {
    pub checked: usize,
    pub renewed: usize,
    pub failed: usize,
    pub expired: usize,
}

/// Registers, renews and stops push-notification watches.
#[derive(Clone)]
pub struct WatchManager {
    provider: Arc<dyn MailProvider>,
    connections: Arc<dyn ConnectionStore>,
    subscriptions: Arc<dyn WatchSubscriptionStore>,
    credentials: CredentialManager,
    limiter: RateLimiter,
    retry: RetryOptions,
    monitor: PerformanceMonitor,
    topic: String,
}

impl WatchManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn MailProvider>,
        connections: Arc<dyn ConnectionStore>,
        subscriptions: Arc<dyn WatchSubscriptionStore>,
        credentials: CredentialManager,
        limiter: RateLimiter,
        retry: RetryOptions,
        monitor: PerformanceMonitor,
        topic: String,
    ) -> Self {
        Self {
            provider,
            connections,
            subscriptions,
            credentials,
            limiter,
            retry,
            monitor,
            topic,
        }
    }

    pub async fn setup_watch(&self, connection_id: &str) -> WatchSetupResult {
        let timer = self.monitor.start("watch_setup");

        let mut connection = match self.load_connection(connection_id).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Watch setup for {} failed: {}", connection_id, e);
                timer.finish(false);
                return WatchSetupResult::from_error(&e);
            }
        };

        let result = match self.register_or_renew(&mut connection).await {
            Ok(subscription) => {
                info!(
                    "Watch active for connection {} (history {}, expires {})",
                    connection_id, subscription.history_id, subscription.expiration
                );
                WatchSetupResult {
                    success: true,
                    history_id: Some(subscription.history_id),
                    expiration: Some(subscription.expiration),
                    ..Default::default()
                }
            }
            Err(e) => {
                error!("Watch setup for {} failed: {}", connection_id, e);
                if !e.is_reauth() {
                    self.record_connection_error(connection_id, &e.to_string())
                        .await;
                }
                WatchSetupResult::from_error(&e)
            }
        };

        timer.finish(result.success);
        result
    }

    pub async fn renew_watch(&self, subscription_id: &str) -> WatchSetupResult {
        let timer = self.monitor.start("watch_renewal");

        let subscription = match self.subscriptions.find_by_id(subscription_id).await {
            Ok(Some(subscription)) => subscription,
            Ok(None) => {
                timer.finish(false);
                return WatchSetupResult::failed(format!(
                    "Watch subscription {} not found",
                    subscription_id
                ));
            }
            Err(e) => {
                timer.finish(false);
                return WatchSetupResult::failed(e.to_string());
            }
        };

        if let Err(e) = self
            .subscriptions
            .update_status(&subscription.id, WatchStatus::Renewing)
            .await
        {
            warn!("Failed to mark subscription {} renewing: {}", subscription.id, e);
        }

        let renewed = match self.load_connection(&subscription.connection_id).await {
            Ok(mut connection) => self.register_or_renew(&mut connection).await,
            Err(e) => Err(e),
        };

        let result = match renewed {
            Ok(renewed) => {
                info!(
                    "Renewed watch {} for connection {} (expires {})",
                    renewed.id, renewed.connection_id, renewed.expiration
                );
                WatchSetupResult {
                    success: true,
                    history_id: Some(renewed.history_id),
                    expiration: Some(renewed.expiration),
                    ..Default::default()
                }
            }
            Err(e) => {
                error!("Renewal of watch {} failed: {}", subscription.id, e);
                if let Err(store_err) = self
                    .subscriptions
                    .record_renewal_failure(&subscription.id, &e.to_string())
                    .await
                {
                    warn!(
                        "Failed to record renewal failure for {}: {}",
                        subscription.id, store_err
                    );
                }
                if !e.is_reauth() {
                    self.record_connection_error(&subscription.connection_id, &e.to_string())
                        .await;
                }
                WatchSetupResult::from_error(&e)
            }
        };

        timer.finish(result.success);
        result
    }

    pub async fn stop_watch(&self, connection_id: &str) -> WatchStopResult {
        let timer = self.monitor.start("watch_stop");
        let result = match self.stop_inner(connection_id).await {
            Ok(()) => WatchStopResult {
                success: true,
                error: None,
            },
            Err(e) => {
                error!("Stopping watch for {} failed: {}", connection_id, e);
                WatchStopResult {
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        };
        timer.finish(result.success);
        result
    }

    /// Active subscriptions expiring within the next 24 hours, soonest first.
    pub async fn find_expiring_soon(&self) -> Result<Vec<WatchSubscription>, DatabaseError> {
        let deadline = Utc::now() + Duration::hours(EXPIRING_SOON_HOURS);
        self.subscriptions.find_active_expiring_before(deadline).await
    }

    /// Renews every expiring subscription, one at a time. Subscriptions that
    /// fail to renew after their expiration has passed are marked expired.
    pub async fn renew_expiring_watches(&self) -> RenewalSweep {
        let mut sweep = RenewalSweep::default();
        let expiring = match self.find_expiring_soon().await {
            Ok(expiring) => expiring,
            Err(e) => {
                error!("Failed to load expiring watches: {}", e);
                return sweep;
            }
        };

        for subscription in expiring {
            sweep.checked += 1;
            if self.renew_watch(&subscription.id).await.success {
                sweep.renewed += 1;
                continue;
            }

            sweep.failed += 1;
            if subscription.expiration <= Utc::now() {
                match self.expire_lapsed(&subscription.connection_id).await {
                    Ok(()) => sweep.expired += 1,
                    Err(e) => warn!(
                        "Failed to mark watch {} expired: {}",
                        subscription.id, e
                    ),
                }
            }
        }

        if sweep.checked > 0 {
            info!(
                "Watch renewal sweep: {} checked, {} renewed, {} failed, {} expired",
                sweep.checked, sweep.renewed, sweep.failed, sweep.expired
            );
        }
        sweep
    }

    /// Puts the connection back on polling so a later migration registers
    /// it again.
    async fn expire_lapsed(&self, connection_id: &str) -> Result<(), DatabaseError> {
        self.subscriptions.mark_expired(connection_id).await?;
        self.connections
            .set_watch_enabled(connection_id, false)
            .await
    }

    /// Registration and renewal are the same remote call; the provider has no
    /// separate renew operation.
    async fn register_or_renew(
        &self,
        connection: &mut Connection,
    ) -> Result<WatchSubscription, WatchError> {
        self.credentials
            .ensure_fresh(connection, Duration::zero())
            .await?;
        let token = connection.access_token.clone().unwrap_or_default();

        let labels = vec![WATCH_LABEL.to_string()];
        let key = limiter_key(&connection.id);
        let response = call_remote(&self.limiter, &key, &self.retry, || {
            self.provider.register_watch(&token, &self.topic, &labels)
        })
        .await?;

        let expiration = response
            .expires_at()
            .unwrap_or_else(|| Utc::now() + Duration::days(DEFAULT_WATCH_LIFETIME_DAYS));
        let subscription = self
            .subscriptions
            .upsert_active(&connection.id, &response.history_id, expiration)
            .await?;
        self.connections
            .set_watch_enabled(&connection.id, true)
            .await?;
        connection.watch_enabled = true;
        connection.last_watch_error = None;

        if connection.last_history_id.is_none() {
            self.connections
                .record_history_checkpoint(&connection.id, &response.history_id)
                .await?;
            connection.last_history_id = Some(response.history_id.clone());
        }

        Ok(subscription)
    }

    async fn stop_inner(&self, connection_id: &str) -> Result<(), WatchError> {
        let mut connection = self.load_connection(connection_id).await?;

        if !connection.watch_enabled {
            // Nothing registered remotely; only tidy up local state.
            self.subscriptions.mark_expired(connection_id).await?;
            return Ok(());
        }

        match self
            .credentials
            .ensure_fresh(&mut connection, Duration::zero())
            .await
        {
            Ok(_) => {
                let token = connection.access_token.clone().unwrap_or_default();
                let key = limiter_key(connection_id);
                let stopped = call_remote(&self.limiter, &key, &self.retry, || {
                    self.provider.stop_watch(&token)
                })
                .await;
                match stopped {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        info!("Watch for {} was already gone remotely", connection_id);
                    }
                    Err(e) => {
                        self.record_connection_error(connection_id, &e.to_string())
                            .await;
                        return Err(e.into());
                    }
                }
            }
            Err(e) if e.is_reauth() => {
                // Revoked credentials cannot stop the remote watch; it lapses on its own.
                warn!(
                    "Stopping watch for {} locally only: credentials revoked",
                    connection_id
                );
            }
            Err(e) => return Err(e.into()),
        }

        self.subscriptions.mark_expired(connection_id).await?;
        self.connections
            .set_watch_enabled(connection_id, false)
            .await?;
        info!("Watch stopped for connection {}", connection_id);
        Ok(())
    }

    async fn load_connection(&self, connection_id: &str) -> Result<Connection, WatchError> {
        self.connections
            .find_by_id(connection_id)
            .await?
            .ok_or_else(|| WatchError::ConnectionNotFound(connection_id.to_string()))
    }

    async fn record_connection_error(&self, connection_id: &str, message: &str) {
        if let Err(e) = self
            .connections
            .set_watch_error(connection_id, message)
            .await
        {
            warn!("Failed to store watch error for {}: {}", connection_id, e);
        }
    }
}
