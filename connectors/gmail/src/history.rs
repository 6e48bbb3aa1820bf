use chrono::Duration;
use serde::Serialize;
use shared::models::Connection;
use shared::utils::cursor_advances;
use shared::{ApiError, ConnectionStore, EmailStore, PerformanceMonitor};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::auth::CredentialManager;
use crate::client::MailProvider;
use crate::executor::{AutoSyncResult, SyncExecutor};
use crate::fetch::{call_remote, limiter_key, MessageFetcher};
use crate::processor::{process_pending, MessageProcessor};
use crate::watch::WATCH_LABEL;

/// Upper bound on change-log pages read in one pass.
pub const MAX_HISTORY_PAGES: usize = 100;
const REFRESH_BUFFER_MINUTES: i64 = 5;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct HistorySyncResult {
    pub success: bool,
    pub new_messages: usize,
    pub processed_transactions: usize,
    pub new_history_id: Option<String>,
    pub email_ids: Vec<String>,
    pub transaction_ids: Vec<String>,
    pub error: Option<String>,
    pub used_full_sync: bool,
    /// The page limit was hit; the cursor only covers the changes listed.
    pub partial: bool,
}

impl HistorySyncResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Whether a change-log failure means the start cursor can no longer be
/// resolved. Any 404, or any provider message mentioning history, counts.
pub fn is_history_gap(error: &ApiError) -> bool {
    match error {
        ApiError::Http { status: 404, .. } => true,
        ApiError::Http { message, .. } => message.to_lowercase().contains("history"),
        _ => false,
    }
}

/// Delta sync driven by push notifications.
#[derive(Clone)]
pub struct HistorySync {
    provider: Arc<dyn MailProvider>,
    connections: Arc<dyn ConnectionStore>,
    emails: Arc<dyn EmailStore>,
    credentials: CredentialManager,
    fetcher: MessageFetcher,
    processor: Arc<dyn MessageProcessor>,
    executor: SyncExecutor,
    monitor: PerformanceMonitor,
}

impl HistorySync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn MailProvider>,
        connections: Arc<dyn ConnectionStore>,
        emails: Arc<dyn EmailStore>,
        credentials: CredentialManager,
        fetcher: MessageFetcher,
        processor: Arc<dyn MessageProcessor>,
        executor: SyncExecutor,
        monitor: PerformanceMonitor,
    ) -> Self {
        Self {
            provider,
            connections,
            emails,
            credentials,
            fetcher,
            processor,
            executor,
            monitor,
        }
    }

    /// Entry point for a push notification. Duplicate or stale deliveries
    /// (cursor not newer than the stored one) are acknowledged without work.
    pub async fn handle_notification(
        &self,
        email_address: &str,
        notified_history_id: &str,
    ) -> HistorySyncResult {
        let connection = match self.connections.find_by_email(email_address).await {
            Ok(Some(connection)) => connection,
            Ok(None) => {
                warn!("Notification for unknown mailbox {}", email_address);
                return HistorySyncResult::failed(format!(
                    "No connection for mailbox {}",
                    email_address
                ));
            }
            Err(e) => return HistorySyncResult::failed(e.to_string()),
        };

        match connection.last_history_id.clone() {
            None => {
                info!(
                    "Connection {} has no history cursor, running full resync",
                    connection.id
                );
                self.full_resync(&connection).await
            }
            Some(current) if !cursor_advances(Some(&current), notified_history_id) => {
                debug!(
                    "Skipping notification for {}: cursor {} is not newer than {}",
                    connection.id, notified_history_id, current
                );
                HistorySyncResult {
                    success: true,
                    new_history_id: Some(current),
                    ..Default::default()
                }
            }
            Some(current) => self.sync_from_history(&connection.id, &current).await,
        }
    }

    pub async fn sync_from_history(
        &self,
        connection_id: &str,
        start_history_id: &str,
    ) -> HistorySyncResult {
        let timer = self.monitor.start("history_sync");

        let connection = match self.connections.find_by_id(connection_id).await {
            Ok(Some(connection)) => connection,
            Ok(None) => {
                timer.finish(false);
                return HistorySyncResult::failed(format!(
                    "Connection {} not found",
                    connection_id
                ));
            }
            Err(e) => {
                timer.finish(false);
                return HistorySyncResult::failed(e.to_string());
            }
        };

        let result = self.run(connection, start_history_id).await;
        if result.success {
            info!(
                "History sync for {}: {} new messages, {} transactions (full sync: {})",
                connection_id,
                result.new_messages,
                result.processed_transactions,
                result.used_full_sync
            );
        } else {
            error!(
                "History sync for {} failed: {}",
                connection_id,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        timer.finish(result.success);
        result
    }

    async fn run(&self, mut connection: Connection, start_history_id: &str) -> HistorySyncResult {
        if let Err(e) = self
            .credentials
            .ensure_fresh(&mut connection, Duration::minutes(REFRESH_BUFFER_MINUTES))
            .await
        {
            return HistorySyncResult::failed(e.to_string());
        }
        let token = connection.access_token.clone().unwrap_or_default();
        let key = limiter_key(&connection.id);

        let mut message_ids = Vec::new();
        let mut latest_page_cursor = None;
        let mut last_record_id = None;
        let mut partial = false;
        let mut page_token: Option<String> = None;
        for page_number in 1..=MAX_HISTORY_PAGES {
            let page = call_remote(
                self.fetcher.limiter(),
                &key,
                self.fetcher.retry_options(),
                || {
                    self.provider.list_history(
                        &token,
                        start_history_id,
                        Some(WATCH_LABEL),
                        page_token.as_deref(),
                    )
                },
            )
            .await;

            let page = match page {
                Ok(page) => page,
                Err(e) if is_history_gap(&e) => {
                    warn!(
                        "History cursor {} unusable for {} ({}), falling back to full resync",
                        start_history_id, connection.id, e
                    );
                    return self.full_resync(&connection).await;
                }
                Err(e) => return HistorySyncResult::failed(format!("Failed to list history: {}", e)),
            };

            for record in page.history.unwrap_or_default() {
                for added in record.messages_added.unwrap_or_default() {
                    message_ids.push(added.message.id);
                }
                last_record_id = Some(record.id);
            }
            if page.history_id.is_some() {
                latest_page_cursor = page.history_id;
            }

            match page.next_page_token {
                Some(next) if !next.is_empty() => {
                    if page_number == MAX_HISTORY_PAGES {
                        warn!(
                            "History for {} exceeded {} pages, remaining changes wait for the next pass",
                            connection.id, MAX_HISTORY_PAGES
                        );
                        partial = true;
                        break;
                    }
                    page_token = Some(next);
                }
                _ => break,
            }
        }

        let unseen = match self.fetcher.filter_unseen(&connection, message_ids).await {
            Ok(unseen) => unseen,
            Err(e) => return HistorySyncResult::failed(e.to_string()),
        };

        let report = self
            .fetcher
            .fetch_and_store(&connection, &token, unseen)
            .await;
        let email_ids = report.stored_ids();
        let processing = process_pending(&self.processor, &self.emails, &connection).await;

        let mut result = HistorySyncResult {
            success: true,
            new_messages: email_ids.len(),
            processed_transactions: processing.transaction_ids.len(),
            new_history_id: connection.last_history_id.clone(),
            email_ids,
            transaction_ids: processing.transaction_ids,
            error: None,
            used_full_sync: false,
            partial,
        };

        // Keep the cursor where it is so unfetched messages are listed again.
        if !report.errors.is_empty() {
            result.success = false;
            result.error = Some(report.errors.join("; "));
            return result;
        }
        if !processing.errors.is_empty() {
            warn!(
                "{} emails for {} failed processing",
                processing.errors.len(),
                connection.id
            );
        }

        // A truncated listing may only advance to the last record it read.
        let new_cursor = if partial {
            last_record_id
        } else {
            match self.profile_cursor(&connection, &token).await {
                Some(cursor) => Some(cursor),
                None => latest_page_cursor,
            }
        };
        if let Some(cursor) = new_cursor {
            if cursor_advances(connection.last_history_id.as_deref(), &cursor) {
                if let Err(e) = self
                    .connections
                    .record_history_checkpoint(&connection.id, &cursor)
                    .await
                {
                    result.success = false;
                    result.error = Some(format!("Failed to store history cursor: {}", e));
                    return result;
                }
                result.new_history_id = Some(cursor);
            }
        }

        result
    }

    /// Time-windowed resync, then a fresh cursor from the profile written
    /// unconditionally, since the old one is known to be unusable.
    async fn full_resync(&self, connection: &Connection) -> HistorySyncResult {
        let sync = self.executor.execute_auto_sync(connection).await;
        let mut result = from_auto_sync(sync);
        if !result.success {
            return result;
        }

        let mut connection = match self.connections.find_by_id(&connection.id).await {
            Ok(Some(connection)) => connection,
            Ok(None) => return HistorySyncResult::failed("Connection disappeared during resync"),
            Err(e) => return HistorySyncResult::failed(e.to_string()),
        };
        if let Err(e) = self
            .credentials
            .ensure_fresh(&mut connection, Duration::minutes(REFRESH_BUFFER_MINUTES))
            .await
        {
            result.success = false;
            result.error = Some(e.to_string());
            return result;
        }
        let token = connection.access_token.clone().unwrap_or_default();

        match self.profile_cursor(&connection, &token).await {
            Some(cursor) => {
                if let Err(e) = self
                    .connections
                    .record_history_checkpoint(&connection.id, &cursor)
                    .await
                {
                    result.success = false;
                    result.error = Some(format!("Failed to store history cursor: {}", e));
                    return result;
                }
                result.new_history_id = Some(cursor);
            }
            None => {
                result.success = false;
                result.error = Some("Failed to read a fresh history cursor".to_string());
            }
        }
        result
    }

    async fn profile_cursor(&self, connection: &Connection, token: &str) -> Option<String> {
        let key = limiter_key(&connection.id);
        match call_remote(
            self.fetcher.limiter(),
            &key,
            self.fetcher.retry_options(),
            || self.provider.get_profile(token),
        )
        .await
        {
            Ok(profile) => Some(profile.history_id),
            Err(e) => {
                warn!("Failed to read profile for {}: {}", connection.id, e);
                None
            }
        }
    }
}

fn from_auto_sync(sync: AutoSyncResult) -> HistorySyncResult {
    HistorySyncResult {
        success: sync.success,
        new_messages: sync.emails_synced,
        processed_transactions: sync.transactions_processed,
        new_history_id: None,
        email_ids: sync.email_ids,
        transaction_ids: sync.transaction_ids,
        error: if sync.errors.is_empty() {
            None
        } else {
            Some(sync.errors.join("; "))
        },
        used_full_sync: true,
        partial: false,
    }
}
