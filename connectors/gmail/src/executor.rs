use chrono::{DateTime, Duration, Utc};
use dashmap::DashSet;
use serde::Serialize;
use shared::models::Connection;
use shared::retry::get_retry_delay;
use shared::{ConnectionStore, EmailStore, PerformanceMonitor};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::auth::{CredentialError, CredentialManager};
use crate::client::MailProvider;
use crate::fetch::{call_remote, limiter_key, MessageFetcher};
use crate::processor::{process_pending, MessageProcessor};

#[derive(Debug, Clone)]
pub struct AutoSyncSettings {
    pub page_size: u32,
    /// Upper bound on listing pages per pass.
    pub max_pages: usize,
    /// Re-scan this far before the newest processed email.
    pub overlap: Duration,
    /// Window used when nothing has been processed yet.
    pub initial_lookback: Duration,
    pub refresh_buffer: Duration,
    /// Extra search terms appended to the time filter.
    pub query: Option<String>,
}

impl Default for AutoSyncSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_pages: 10,
            overlap: Duration::minutes(10),
            initial_lookback: Duration::days(7),
            refresh_buffer: Duration::minutes(5),
            query: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AutoSyncResult {
    pub success: bool,
    pub emails_found: usize,
    pub emails_synced: usize,
    pub transactions_processed: usize,
    pub errors: Vec<String>,
    pub email_ids: Vec<String>,
    pub transaction_ids: Vec<String>,
    /// Suggested wait in seconds when the pass hit a rate limit or quota.
    pub retry_after: Option<u64>,
    pub reauth_required: bool,
}

impl AutoSyncResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DueSyncSummary {
    pub due: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub emails_synced: usize,
}

/// Start of the listing window: the newest processed email minus `overlap`,
/// or `now - initial_lookback` when nothing was processed yet.
pub fn sync_window_start(
    latest_processed: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    settings: &AutoSyncSettings,
) -> DateTime<Utc> {
    match latest_processed {
        Some(latest) => latest - settings.overlap,
        None => now - settings.initial_lookback,
    }
}

pub fn build_query(window_start: DateTime<Utc>, extra: Option<&str>) -> String {
    let mut query = format!("after:{}", window_start.timestamp());
    if let Some(extra) = extra.map(str::trim).filter(|q| !q.is_empty()) {
        query.push(' ');
        query.push_str(extra);
    }
    query
}

/// Time-windowed sync used by the scheduler and as the recovery path when
/// the change log cannot be read.
#[derive(Clone)]
pub struct SyncExecutor {
    provider: Arc<dyn MailProvider>,
    connections: Arc<dyn ConnectionStore>,
    emails: Arc<dyn EmailStore>,
    credentials: CredentialManager,
    fetcher: MessageFetcher,
    processor: Arc<dyn MessageProcessor>,
    monitor: PerformanceMonitor,
    settings: AutoSyncSettings,
}

impl SyncExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn MailProvider>,
        connections: Arc<dyn ConnectionStore>,
        emails: Arc<dyn EmailStore>,
        credentials: CredentialManager,
        fetcher: MessageFetcher,
        processor: Arc<dyn MessageProcessor>,
        monitor: PerformanceMonitor,
        settings: AutoSyncSettings,
    ) -> Self {
        Self {
            provider,
            connections,
            emails,
            credentials,
            fetcher,
            processor,
            monitor,
            settings,
        }
    }

    pub fn settings(&self) -> &AutoSyncSettings {
        &self.settings
    }

    pub async fn execute_auto_sync(&self, connection: &Connection) -> AutoSyncResult {
        let timer = self.monitor.start("auto_sync");
        let result = self.run(connection).await;

        if result.success {
            info!(
                "Auto-sync for {}: {} found, {} synced, {} transactions",
                connection.id,
                result.emails_found,
                result.emails_synced,
                result.transactions_processed
            );
        } else {
            error!(
                "Auto-sync for {} failed: {}",
                connection.id,
                result.errors.join("; ")
            );
        }
        timer.finish(result.success);
        result
    }

    /// Runs every connection whose interval has elapsed, one at a time.
    /// Connections present in `in_flight` are skipped; each one is held in
    /// the set while its pass runs.
    pub async fn sync_due_connections(&self, in_flight: &DashSet<String>) -> DueSyncSummary {
        let mut summary = DueSyncSummary::default();
        let connections = match self.connections.find_all().await {
            Ok(connections) => connections,
            Err(e) => {
                error!("Failed to load connections for auto-sync: {}", e);
                return summary;
            }
        };

        let now = Utc::now();
        for connection in connections.iter().filter(|c| c.is_due_for_sync(now)) {
            summary.due += 1;
            if !in_flight.insert(connection.id.clone()) {
                debug!("Connection {} is already syncing, skipping", connection.id);
                summary.skipped += 1;
                continue;
            }
            let result = self.execute_auto_sync(connection).await;
            in_flight.remove(&connection.id);
            summary.emails_synced += result.emails_synced;
            if result.success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }

        if summary.due > 0 {
            info!(
                "Auto-sync tick: {} due, {} succeeded, {} failed",
                summary.due, summary.succeeded, summary.failed
            );
        }
        summary
    }

    async fn run(&self, connection: &Connection) -> AutoSyncResult {
        let mut connection = connection.clone();

        match self
            .credentials
            .ensure_fresh(&mut connection, self.settings.refresh_buffer)
            .await
        {
            Ok(_) => {}
            Err(CredentialError::ReauthRequired(message)) => {
                return AutoSyncResult {
                    errors: vec![message],
                    reauth_required: true,
                    ..Default::default()
                };
            }
            Err(e) => return AutoSyncResult::failed(e.to_string()),
        }
        let token = connection.access_token.clone().unwrap_or_default();

        let latest = match self
            .emails
            .latest_processed_internal_date(&connection.user_id)
            .await
        {
            Ok(latest) => latest,
            Err(e) => return AutoSyncResult::failed(e.to_string()),
        };
        let window_start = sync_window_start(latest, Utc::now(), &self.settings);
        let query = build_query(window_start, self.settings.query.as_deref());

        let candidates = match self.list_candidates(&connection, &token, &query).await {
            Ok(candidates) => candidates,
            Err(result) => return result,
        };

        let unseen = match self
            .fetcher
            .filter_unseen(&connection, candidates.clone())
            .await
        {
            Ok(unseen) => unseen,
            Err(e) => return AutoSyncResult::failed(e.to_string()),
        };

        let report = self
            .fetcher
            .fetch_and_store(&connection, &token, unseen)
            .await;
        let email_ids = report.stored_ids();
        let processing = process_pending(&self.processor, &self.emails, &connection).await;

        // Only fetch failures fail the pass; processing failures are reported.
        let success = report.errors.is_empty();
        let mut errors = report.errors;
        errors.extend(processing.errors);

        if success {
            if let Err(e) = self.connections.mark_synced(&connection.id, Utc::now()).await {
                warn!("Failed to stamp sync time for {}: {}", connection.id, e);
            }
        }

        AutoSyncResult {
            success,
            emails_found: candidates.len(),
            emails_synced: report.stored.len(),
            transactions_processed: processing.transaction_ids.len(),
            errors,
            email_ids,
            transaction_ids: processing.transaction_ids,
            retry_after: report.retry_after.map(|d| d.as_secs()),
            reauth_required: false,
        }
    }

    async fn list_candidates(
        &self,
        connection: &Connection,
        token: &str,
        query: &str,
    ) -> Result<Vec<String>, AutoSyncResult> {
        let key = limiter_key(&connection.id);
        let mut candidates = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..self.settings.max_pages.max(1) {
            let page = call_remote(
                self.fetcher.limiter(),
                &key,
                self.fetcher.retry_options(),
                || {
                    self.provider.list_messages(
                        token,
                        query,
                        self.settings.page_size,
                        page_token.as_deref(),
                    )
                },
            )
            .await
            .map_err(|e| AutoSyncResult {
                errors: vec![format!("Failed to list messages: {}", e)],
                retry_after: get_retry_delay(&e).map(|d| d.as_secs()),
                ..Default::default()
            })?;

            candidates.extend(page.messages.unwrap_or_default().into_iter().map(|m| m.id));
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_starts_before_latest_processed() {
        let settings = AutoSyncSettings::default();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let latest = Utc.with_ymd_and_hms(2026, 3, 9, 8, 30, 0).unwrap();

        assert_eq!(
            sync_window_start(Some(latest), now, &settings),
            Utc.with_ymd_and_hms(2026, 3, 9, 8, 20, 0).unwrap()
        );
        assert_eq!(
            sync_window_start(None, now, &settings),
            Utc.with_ymd_and_hms(2026, 3, 3, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_build_query() {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        assert_eq!(build_query(start, None), "after:1700000000");
        assert_eq!(build_query(start, Some("  ")), "after:1700000000");
        assert_eq!(
            build_query(start, Some("category:primary")),
            "after:1700000000 category:primary"
        );
    }
}
