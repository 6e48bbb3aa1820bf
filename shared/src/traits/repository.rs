use crate::db::error::DatabaseError;
use crate::models::{Connection, NewEmail, StoredEmail, WatchStatus, WatchSubscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Connection>, DatabaseError>;
    async fn find_by_email(&self, email_address: &str)
        -> Result<Option<Connection>, DatabaseError>;
    async fn find_all(&self) -> Result<Vec<Connection>, DatabaseError>;
    async fn find_by_watch_enabled(&self, enabled: bool)
        -> Result<Vec<Connection>, DatabaseError>;

    /// Stores a refreshed access token. `refresh_token` is only written when
    /// the provider rotated it; `None` keeps the current one.
    async fn update_credentials(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Drops locally held tokens and flags the connection for re-authentication.
    async fn reset_credentials(&self, id: &str, reason: &str) -> Result<(), DatabaseError>;

    /// Enabling also clears `last_watch_error`.
    async fn set_watch_enabled(&self, id: &str, enabled: bool) -> Result<(), DatabaseError>;
    async fn set_watch_error(&self, id: &str, error: &str) -> Result<(), DatabaseError>;

    /// Writes the history cursor to the connection and to its watch
    /// subscription (if any) as one unit.
    async fn record_history_checkpoint(
        &self,
        id: &str,
        history_id: &str,
    ) -> Result<(), DatabaseError>;

    async fn mark_synced(&self, id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait WatchSubscriptionStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<WatchSubscription>, DatabaseError>;
    async fn find_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<WatchSubscription>, DatabaseError>;

    /// Inserts or overwrites the connection's subscription as `active` with
    /// zero renewal attempts.
    async fn upsert_active(
        &self,
        connection_id: &str,
        history_id: &str,
        expiration: DateTime<Utc>,
    ) -> Result<WatchSubscription, DatabaseError>;

    async fn update_status(&self, id: &str, status: WatchStatus) -> Result<(), DatabaseError>;

    /// Marks the subscription `failed`, increments `renewal_attempts` and keeps the error.
    async fn record_renewal_failure(&self, id: &str, error: &str) -> Result<(), DatabaseError>;

    async fn mark_expired(&self, connection_id: &str) -> Result<(), DatabaseError>;

    async fn find_active_expiring_before(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<WatchSubscription>, DatabaseError>;

    async fn count_by_status(&self, status: WatchStatus) -> Result<i64, DatabaseError>;
}

#[async_trait]
pub trait EmailStore: Send + Sync {
    /// Returns the subset of `message_ids` already stored for this user and account.
    async fn find_existing_message_ids(
        &self,
        user_id: &str,
        connection_id: &str,
        message_ids: &[String],
    ) -> Result<HashSet<String>, DatabaseError>;

    /// Inserts the email unless (user, account, message id) already exists.
    /// Returns `None` for a duplicate.
    async fn upsert(&self, email: NewEmail) -> Result<Option<StoredEmail>, DatabaseError>;

    async fn latest_processed_internal_date(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    /// Stored emails of one account that have not been processed yet,
    /// oldest first.
    async fn find_unprocessed(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<Vec<StoredEmail>, DatabaseError>;

    async fn mark_processed(&self, id: &str) -> Result<(), DatabaseError>;
}
