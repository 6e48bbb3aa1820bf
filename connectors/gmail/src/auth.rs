use chrono::{Duration, Utc};
use shared::models::Connection;
use shared::{with_retry, ApiError, ConnectionStore, DatabaseError, RetryOptions};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::MailProvider;

/// Shown to the user whenever a connection must be linked again.
pub const REAUTH_MESSAGE: &str =
    "Your Gmail connection has expired or was revoked. Please reconnect your account.";

/// Lifetime assumed when the token endpoint reports no expiry.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("{0}")]
    ReauthRequired(String),
    #[error("token refresh failed: {0}")]
    Refresh(ApiError),
    #[error(transparent)]
    Store(#[from] DatabaseError),
}

impl CredentialError {
    pub fn is_reauth(&self) -> bool {
        matches!(self, Self::ReauthRequired(_))
    }
}

#[derive(Clone)]
pub struct CredentialManager {
    provider: Arc<dyn MailProvider>,
    connections: Arc<dyn ConnectionStore>,
    retry: RetryOptions,
}

impl CredentialManager {
    pub fn new(
        provider: Arc<dyn MailProvider>,
        connections: Arc<dyn ConnectionStore>,
        retry: RetryOptions,
    ) -> Self {
        Self {
            provider,
            connections,
            retry,
        }
    }

    /// Refreshes the access token when it expires within `buffer`.
    ///
    /// Returns whether a refresh happened. New tokens are persisted and
    /// written back into `connection`. A rejected refresh token resets the
    /// stored credentials and yields [`CredentialError::ReauthRequired`].
    pub async fn ensure_fresh(
        &self,
        connection: &mut Connection,
        buffer: Duration,
    ) -> Result<bool, CredentialError> {
        if connection.needs_reauth {
            return Err(CredentialError::ReauthRequired(REAUTH_MESSAGE.to_string()));
        }

        let now = Utc::now();
        if !connection.token_expires_within(buffer, now) {
            return Ok(false);
        }

        let refresh_token = match connection.refresh_token.clone().filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => {
                self.reset(connection, "missing refresh token").await?;
                return Err(CredentialError::ReauthRequired(REAUTH_MESSAGE.to_string()));
            }
        };

        debug!("Refreshing access token for connection {}", connection.id);
        let provider = Arc::clone(&self.provider);
        let grant = with_retry(
            || {
                let provider = Arc::clone(&provider);
                let refresh_token = refresh_token.clone();
                async move { provider.refresh_credential(&refresh_token).await }
            },
            &self.retry,
        )
        .await;

        let grant = match grant {
            Ok(grant) => grant,
            Err(e) if e.is_invalid_grant() => {
                warn!(
                    "Refresh token rejected for connection {}: {}",
                    connection.id, e
                );
                self.reset(connection, &e.to_string()).await?;
                return Err(CredentialError::ReauthRequired(REAUTH_MESSAGE.to_string()));
            }
            Err(e) => return Err(CredentialError::Refresh(e)),
        };

        let expires_at = grant.expiry_date.unwrap_or_else(|| {
            Utc::now()
                + Duration::seconds(grant.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS))
        });
        let rotated = grant.refresh_token.as_deref().filter(|t| !t.is_empty());

        self.connections
            .update_credentials(&connection.id, &grant.access_token, rotated, expires_at)
            .await?;

        connection.access_token = Some(grant.access_token.clone());
        if let Some(rotated) = rotated {
            connection.refresh_token = Some(rotated.to_string());
        }
        connection.token_expires_at = Some(expires_at);

        info!(
            "Refreshed access token for connection {} (rotated refresh token: {})",
            connection.id,
            rotated.is_some()
        );
        Ok(true)
    }

    async fn reset(&self, connection: &mut Connection, reason: &str) -> Result<(), DatabaseError> {
        self.connections
            .reset_credentials(&connection.id, reason)
            .await?;
        connection.access_token = None;
        connection.refresh_token = None;
        connection.token_expires_at = None;
        connection.needs_reauth = true;
        connection.watch_enabled = false;
        connection.last_watch_error = Some(reason.to_string());
        Ok(())
    }
}
