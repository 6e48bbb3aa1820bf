use chrono::Utc;
use serde_json::Value;
use shared::models::{Connection, NewEmail, StoredEmail};
use shared::retry::get_retry_delay;
use shared::{
    with_retry, ApiError, BatchProcessor, BatchStats, DatabaseError, EmailStore, RateLimiter,
    RetryOptions,
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::MailProvider;
use crate::models::GmailMessage;

/// Limiter key shared by every remote call made for one mailbox.
pub fn limiter_key(connection_id: &str) -> String {
    format!("gmail:{}", connection_id)
}

/// Runs one remote call under the limiter with retry. The limiter is waited on
/// inside every attempt, so retries are throttled too.
pub async fn call_remote<T, F, Fut>(
    limiter: &RateLimiter,
    key: &str,
    retry: &RetryOptions,
    mut operation: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    with_retry(
        || {
            let call = operation();
            async move {
                limiter.wait_for_limit(key).await;
                call.await
            }
        },
        retry,
    )
    .await
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("{0}")]
    Api(ApiError),
    #[error("{0}")]
    Store(#[from] DatabaseError),
}

#[derive(Debug, Default)]
pub struct FetchReport {
    pub attempted: usize,
    /// Newly stored emails, oldest first.
    pub stored: Vec<StoredEmail>,
    pub duplicates: usize,
    pub errors: Vec<String>,
    /// Set when a fetch failed on a rate limit or exhausted quota.
    pub retry_after: Option<Duration>,
}

impl FetchReport {
    pub fn stored_ids(&self) -> Vec<String> {
        self.stored.iter().map(|e| e.id.clone()).collect()
    }
}

/// Fetch-and-store step shared by history sync and auto-sync.
#[derive(Clone)]
pub struct MessageFetcher {
    provider: Arc<dyn MailProvider>,
    emails: Arc<dyn EmailStore>,
    limiter: RateLimiter,
    retry: RetryOptions,
    batch: BatchProcessor,
}

impl MessageFetcher {
    pub fn new(
        provider: Arc<dyn MailProvider>,
        emails: Arc<dyn EmailStore>,
        limiter: RateLimiter,
        retry: RetryOptions,
        batch: BatchProcessor,
    ) -> Self {
        Self {
            provider,
            emails,
            limiter,
            retry,
            batch,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn retry_options(&self) -> &RetryOptions {
        &self.retry
    }

    /// Drops repeated ids (first occurrence wins) and ids already stored for
    /// this connection.
    pub async fn filter_unseen(
        &self,
        connection: &Connection,
        message_ids: Vec<String>,
    ) -> Result<Vec<String>, DatabaseError> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = message_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if unique.is_empty() {
            return Ok(unique);
        }

        let existing = self
            .emails
            .find_existing_message_ids(&connection.user_id, &connection.id, &unique)
            .await?;
        Ok(unique
            .into_iter()
            .filter(|id| !existing.contains(id))
            .collect())
    }

    pub async fn fetch_and_store(
        &self,
        connection: &Connection,
        access_token: &str,
        message_ids: Vec<String>,
    ) -> FetchReport {
        let mut report = FetchReport {
            attempted: message_ids.len(),
            ..Default::default()
        };
        if message_ids.is_empty() {
            return report;
        }

        let key = limiter_key(&connection.id);
        let outcomes = self
            .batch
            .process_batch(message_ids, |message_id: String| {
                let provider = Arc::clone(&self.provider);
                let emails = Arc::clone(&self.emails);
                let limiter = self.limiter.clone();
                let retry = self.retry.clone();
                let key = key.clone();
                let token = access_token.to_string();
                let user_id = connection.user_id.clone();
                let connection_id = connection.id.clone();
                async move {
                    let message = call_remote(&limiter, &key, &retry, || {
                        provider.get_message(&token, &message_id)
                    })
                    .await
                    .map_err(FetchError::Api)?;

                    let stored = emails
                        .upsert(to_new_email(&user_id, &connection_id, message))
                        .await?;
                    Ok::<_, FetchError>(stored)
                }
            })
            .await;

        let stats = BatchStats::from_outcomes(&outcomes);
        for outcome in outcomes {
            match outcome.result {
                Ok(Some(stored)) => report.stored.push(stored),
                Ok(None) => report.duplicates += 1,
                Err(e) => {
                    if let FetchError::Api(api_error) = &e {
                        if let Some(delay) = get_retry_delay(api_error) {
                            report.retry_after = report.retry_after.max(Some(delay));
                        }
                    }
                    warn!("Failed to fetch message {}: {}", outcome.item, e);
                    report
                        .errors
                        .push(format!("Failed to fetch message {}: {}", outcome.item, e));
                }
            }
        }
        report.stored.sort_by(|a, b| a.internal_date.cmp(&b.internal_date));

        info!(
            "Fetched {} messages for connection {}: {} stored, {} duplicates, {} failed ({:.0}% success)",
            stats.total,
            connection.id,
            report.stored.len(),
            report.duplicates,
            stats.failed,
            stats.success_rate * 100.0
        );
        report
    }
}

fn to_new_email(user_id: &str, connection_id: &str, message: GmailMessage) -> NewEmail {
    let internal_date = message.received_at().unwrap_or_else(|| {
        debug!("Message {} has no internal date, using now", message.id);
        Utc::now()
    });

    NewEmail {
        user_id: user_id.to_string(),
        connection_id: connection_id.to_string(),
        message_id: message.id.clone(),
        thread_id: Some(message.thread_id.clone()),
        subject: message.header("Subject"),
        sender: message.header("From"),
        snippet: message.snippet.clone(),
        internal_date,
        raw: serde_json::to_value(&message).unwrap_or(Value::Null),
    }
}
