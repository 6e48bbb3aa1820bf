use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use shared::telemetry::http_client::RequestBuilderExt;
use shared::models::Connection;
use shared::EmailStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Downstream pipeline that turns a stored email into transactions.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Returns the ids of the transactions extracted from the email.
    async fn process_one(&self, stored_email_id: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct ProcessResponse {
    #[serde(default)]
    transaction_ids: Vec<String>,
}

/// Calls the extraction service over HTTP.
pub struct ExtractionClient {
    client: Client,
    base_url: String,
}

impl ExtractionClient {
    pub fn new(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build extraction HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MessageProcessor for ExtractionClient {
    async fn process_one(&self, stored_email_id: &str) -> Result<Vec<String>> {
        let url = format!("{}/emails/{}/process", self.base_url, stored_email_id);
        let response = self
            .client
            .post(&url)
            .with_trace_context()
            .send()
            .await
            .with_context(|| format!("Failed to reach extraction service for {}", stored_email_id))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Extraction failed for {}: HTTP {} - {}",
                stored_email_id,
                status,
                body
            ));
        }

        let parsed: ProcessResponse = response
            .json()
            .await
            .context("Failed to parse extraction response")?;
        Ok(parsed.transaction_ids)
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProcessingReport {
    pub processed: usize,
    pub transaction_ids: Vec<String>,
    pub errors: Vec<String>,
}

/// Hands emails to the processor one at a time, in order. An email is marked
/// processed only after its processor call succeeded.
pub async fn process_sequentially(
    processor: &Arc<dyn MessageProcessor>,
    emails: &Arc<dyn EmailStore>,
    stored_email_ids: &[String],
) -> ProcessingReport {
    let mut report = ProcessingReport::default();

    for id in stored_email_ids {
        match processor.process_one(id).await {
            Ok(transaction_ids) => {
                debug!("Email {} produced {} transactions", id, transaction_ids.len());
                if let Err(e) = emails.mark_processed(id).await {
                    warn!("Failed to mark email {} processed: {}", id, e);
                    report
                        .errors
                        .push(format!("Failed to mark email {} processed: {}", id, e));
                }
                report.processed += 1;
                report.transaction_ids.extend(transaction_ids);
            }
            Err(e) => {
                warn!("Processing email {} failed: {:#}", id, e);
                report
                    .errors
                    .push(format!("Failed to process email {}: {:#}", id, e));
            }
        }
    }

    report
}

/// Processes every stored email of the connection that has not been marked
/// processed, oldest first. This covers emails stored by the current pass as
/// well as ones whose processing failed in an earlier pass.
pub async fn process_pending(
    processor: &Arc<dyn MessageProcessor>,
    emails: &Arc<dyn EmailStore>,
    connection: &Connection,
) -> ProcessingReport {
    let pending = match emails
        .find_unprocessed(&connection.user_id, &connection.id)
        .await
    {
        Ok(pending) => pending,
        Err(e) => {
            warn!("Failed to load unprocessed emails for {}: {}", connection.id, e);
            return ProcessingReport {
                errors: vec![format!("Failed to load unprocessed emails: {}", e)],
                ..Default::default()
            };
        }
    };

    let ids: Vec<String> = pending.into_iter().map(|e| e.id).collect();
    process_sequentially(processor, emails, &ids).await
}
