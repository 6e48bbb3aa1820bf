//! In-memory implementation of the store traits.
//!
//! Backs the integration tests and local runs without Postgres. Enforces the
//! same uniqueness rules as the SQL schema: one subscription per connection,
//! one email per (user, connection, message id).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::db::error::DatabaseError;
use crate::models::{Connection, NewEmail, StoredEmail, WatchStatus, WatchSubscription};
use crate::traits::{ConnectionStore, EmailStore, WatchSubscriptionStore};
use crate::utils::generate_ulid;

#[derive(Default)]
pub struct InMemoryStore {
    connections: RwLock<HashMap<String, Connection>>,
    subscriptions: RwLock<HashMap<String, WatchSubscription>>,
    emails: RwLock<HashMap<String, StoredEmail>>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, DatabaseError> {
    lock.read()
        .map_err(|e| DatabaseError::TransactionFailed(format!("poisoned lock: {}", e)))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, DatabaseError> {
    lock.write()
        .map_err(|e| DatabaseError::TransactionFailed(format!("poisoned lock: {}", e)))
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a connection. Connections are created outside the
    /// engine, so this is only used for seeding.
    pub fn insert_connection(&self, connection: Connection) -> Result<(), DatabaseError> {
        write(&self.connections)?.insert(connection.id.clone(), connection);
        Ok(())
    }

    pub fn emails_for_connection(
        &self,
        connection_id: &str,
    ) -> Result<Vec<StoredEmail>, DatabaseError> {
        let mut emails: Vec<StoredEmail> = read(&self.emails)?
            .values()
            .filter(|e| e.connection_id == connection_id)
            .cloned()
            .collect();
        emails.sort_by(|a, b| a.internal_date.cmp(&b.internal_date));
        Ok(emails)
    }

    fn update_connection<F>(&self, id: &str, apply: F) -> Result<(), DatabaseError>
    where
        F: FnOnce(&mut Connection),
    {
        let mut connections = write(&self.connections)?;
        let connection = connections.get_mut(id).ok_or(DatabaseError::NotFound)?;
        apply(connection);
        connection.updated_at = Utc::now();
        Ok(())
    }

    fn update_subscription<F>(&self, id: &str, apply: F) -> Result<(), DatabaseError>
    where
        F: FnOnce(&mut WatchSubscription),
    {
        let mut subscriptions = write(&self.subscriptions)?;
        let subscription = subscriptions
            .values_mut()
            .find(|s| s.id == id)
            .ok_or(DatabaseError::NotFound)?;
        apply(subscription);
        subscription.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ConnectionStore for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Connection>, DatabaseError> {
        Ok(read(&self.connections)?.get(id).cloned())
    }

    async fn find_by_email(
        &self,
        email_address: &str,
    ) -> Result<Option<Connection>, DatabaseError> {
        Ok(read(&self.connections)?
            .values()
            .find(|c| c.email_address.eq_ignore_ascii_case(email_address))
            .cloned())
    }

    async fn find_all(&self) -> Result<Vec<Connection>, DatabaseError> {
        let mut connections: Vec<Connection> =
            read(&self.connections)?.values().cloned().collect();
        connections.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(connections)
    }

    async fn find_by_watch_enabled(
        &self,
        enabled: bool,
    ) -> Result<Vec<Connection>, DatabaseError> {
        let all = ConnectionStore::find_all(self).await?;
        Ok(all.into_iter().filter(|c| c.watch_enabled == enabled).collect())
    }

    async fn update_credentials(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.update_connection(id, |c| {
            c.access_token = Some(access_token.to_string());
            if let Some(refresh_token) = refresh_token {
                c.refresh_token = Some(refresh_token.to_string());
            }
            c.token_expires_at = Some(expires_at);
            c.needs_reauth = false;
        })
    }

    async fn reset_credentials(&self, id: &str, reason: &str) -> Result<(), DatabaseError> {
        self.update_connection(id, |c| {
            c.access_token = None;
            c.refresh_token = None;
            c.token_expires_at = None;
            c.needs_reauth = true;
            c.watch_enabled = false;
            c.last_watch_error = Some(reason.to_string());
        })
    }

    async fn set_watch_enabled(&self, id: &str, enabled: bool) -> Result<(), DatabaseError> {
        self.update_connection(id, |c| {
            c.watch_enabled = enabled;
            if enabled {
                c.last_watch_error = None;
            }
        })
    }

    async fn set_watch_error(&self, id: &str, error: &str) -> Result<(), DatabaseError> {
        self.update_connection(id, |c| c.last_watch_error = Some(error.to_string()))
    }

    async fn record_history_checkpoint(
        &self,
        id: &str,
        history_id: &str,
    ) -> Result<(), DatabaseError> {
        // Both maps are locked before either is written so readers never see
        // the two copies disagree.
        let mut connections = write(&self.connections)?;
        let mut subscriptions = write(&self.subscriptions)?;

        let connection = connections.get_mut(id).ok_or(DatabaseError::NotFound)?;
        let now = Utc::now();
        connection.last_history_id = Some(history_id.to_string());
        connection.updated_at = now;

        if let Some(subscription) = subscriptions.get_mut(id) {
            subscription.history_id = history_id.to_string();
            subscription.updated_at = now;
        }
        Ok(())
    }

    async fn mark_synced(&self, id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.update_connection(id, |c| c.last_synced_at = Some(at))
    }
}

// Subscriptions are keyed by connection id, matching the unique constraint.
#[async_trait]
impl WatchSubscriptionStore for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<WatchSubscription>, DatabaseError> {
        Ok(read(&self.subscriptions)?
            .values()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn find_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<WatchSubscription>, DatabaseError> {
        Ok(read(&self.subscriptions)?.get(connection_id).cloned())
    }

    async fn upsert_active(
        &self,
        connection_id: &str,
        history_id: &str,
        expiration: DateTime<Utc>,
    ) -> Result<WatchSubscription, DatabaseError> {
        let now = Utc::now();
        let mut subscriptions = write(&self.subscriptions)?;
        let subscription = subscriptions
            .entry(connection_id.to_string())
            .or_insert_with(|| WatchSubscription {
                id: generate_ulid(),
                connection_id: connection_id.to_string(),
                history_id: history_id.to_string(),
                expiration,
                status: WatchStatus::Pending,
                renewal_attempts: 0,
                last_error: None,
                last_renewed_at: None,
                created_at: now,
                updated_at: now,
            });

        subscription.history_id = history_id.to_string();
        subscription.expiration = expiration;
        subscription.status = WatchStatus::Active;
        subscription.renewal_attempts = 0;
        subscription.last_error = None;
        subscription.last_renewed_at = Some(now);
        subscription.updated_at = now;

        Ok(subscription.clone())
    }

    async fn update_status(&self, id: &str, status: WatchStatus) -> Result<(), DatabaseError> {
        self.update_subscription(id, |s| s.status = status)
    }

    async fn record_renewal_failure(&self, id: &str, error: &str) -> Result<(), DatabaseError> {
        self.update_subscription(id, |s| {
            s.status = WatchStatus::Failed;
            s.renewal_attempts += 1;
            s.last_error = Some(error.to_string());
        })
    }

    async fn mark_expired(&self, connection_id: &str) -> Result<(), DatabaseError> {
        if let Some(subscription) = write(&self.subscriptions)?.get_mut(connection_id) {
            subscription.status = WatchStatus::Expired;
            subscription.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_active_expiring_before(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<WatchSubscription>, DatabaseError> {
        let mut expiring: Vec<WatchSubscription> = read(&self.subscriptions)?
            .values()
            .filter(|s| s.status == WatchStatus::Active && s.expiration <= deadline)
            .cloned()
            .collect();
        expiring.sort_by(|a, b| a.expiration.cmp(&b.expiration));
        Ok(expiring)
    }

    async fn count_by_status(&self, status: WatchStatus) -> Result<i64, DatabaseError> {
        Ok(read(&self.subscriptions)?
            .values()
            .filter(|s| s.status == status)
            .count() as i64)
    }
}

#[async_trait]
impl EmailStore for InMemoryStore {
    async fn find_existing_message_ids(
        &self,
        user_id: &str,
        connection_id: &str,
        message_ids: &[String],
    ) -> Result<HashSet<String>, DatabaseError> {
        let wanted: HashSet<&str> = message_ids.iter().map(String::as_str).collect();
        Ok(read(&self.emails)?
            .values()
            .filter(|e| {
                e.user_id == user_id
                    && e.connection_id == connection_id
                    && wanted.contains(e.message_id.as_str())
            })
            .map(|e| e.message_id.clone())
            .collect())
    }

    async fn upsert(&self, email: NewEmail) -> Result<Option<StoredEmail>, DatabaseError> {
        let mut emails = write(&self.emails)?;
        let duplicate = emails.values().any(|e| {
            e.user_id == email.user_id
                && e.connection_id == email.connection_id
                && e.message_id == email.message_id
        });
        if duplicate {
            return Ok(None);
        }

        let stored = StoredEmail {
            id: generate_ulid(),
            user_id: email.user_id,
            connection_id: email.connection_id,
            message_id: email.message_id,
            thread_id: email.thread_id,
            subject: email.subject,
            sender: email.sender,
            snippet: email.snippet,
            internal_date: email.internal_date,
            raw: email.raw,
            processed_at: None,
            created_at: Utc::now(),
        };
        emails.insert(stored.id.clone(), stored.clone());
        Ok(Some(stored))
    }

    async fn latest_processed_internal_date(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        Ok(read(&self.emails)?
            .values()
            .filter(|e| e.user_id == user_id && e.processed_at.is_some())
            .map(|e| e.internal_date)
            .max())
    }

    async fn find_unprocessed(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<Vec<StoredEmail>, DatabaseError> {
        let mut pending: Vec<StoredEmail> = read(&self.emails)?
            .values()
            .filter(|e| {
                e.user_id == user_id && e.connection_id == connection_id && e.processed_at.is_none()
            })
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.internal_date
                .cmp(&b.internal_date)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(pending)
    }

    async fn mark_processed(&self, id: &str) -> Result<(), DatabaseError> {
        let mut emails = write(&self.emails)?;
        let email = emails.get_mut(id).ok_or(DatabaseError::NotFound)?;
        email.processed_at = Some(Utc::now());
        Ok(())
    }
}
