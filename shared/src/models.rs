use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;

/// A linked mailbox account.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub email_address: String,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub watch_enabled: bool,
    pub auto_sync_interval_minutes: i32,
    pub last_history_id: Option<String>,
    pub last_watch_error: Option<String>,
    pub needs_reauth: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    /// True when the access token is missing or expires within `buffer` of `now`.
    pub fn token_expires_within(&self, buffer: Duration, now: DateTime<Utc>) -> bool {
        if self.access_token.as_deref().map_or(true, str::is_empty) {
            return true;
        }
        match self.token_expires_at {
            Some(expires_at) => expires_at <= now + buffer,
            None => true,
        }
    }

    /// A connection is due when auto-sync is enabled, it can still
    /// authenticate, and its interval has elapsed since the last pass.
    pub fn is_due_for_sync(&self, now: DateTime<Utc>) -> bool {
        if self.needs_reauth || self.auto_sync_interval_minutes <= 0 {
            return false;
        }
        match self.last_synced_at {
            Some(last) => last + Duration::minutes(self.auto_sync_interval_minutes as i64) <= now,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WatchStatus {
    Pending,
    Active,
    Renewing,
    Failed,
    Expired,
}

impl WatchStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, WatchStatus::Active | WatchStatus::Renewing)
    }
}

/// Push-notification registration for one connection. There is at most one
/// row per connection; re-registration overwrites it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WatchSubscription {
    pub id: String,
    pub connection_id: String,
    pub history_id: String,
    pub expiration: DateTime<Utc>,
    pub status: WatchStatus,
    pub renewal_attempts: i32,
    pub last_error: Option<String>,
    pub last_renewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredEmail {
    pub id: String,
    pub user_id: String,
    pub connection_id: String,
    pub message_id: String,
    pub thread_id: Option<String>,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub snippet: Option<String>,
    pub internal_date: DateTime<Utc>,
    pub raw: JsonValue,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEmail {
    pub user_id: String,
    pub connection_id: String,
    pub message_id: String,
    pub thread_id: Option<String>,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub snippet: Option<String>,
    pub internal_date: DateTime<Utc>,
    pub raw: JsonValue,
}
