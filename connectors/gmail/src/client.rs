use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header::RETRY_AFTER, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::ApiError;
use std::time::Duration;
use tracing::debug;

use crate::models::{
    GmailMessage, GmailProfile, HistoryListResponse, MessagesListResponse, TokenErrorResponse,
    TokenGrant, WatchRequest, WatchResponse,
};

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Remote mailbox operations the sync engine depends on. All calls act on the
/// mailbox that owns `access_token`.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn list_messages(
        &self,
        access_token: &str,
        query: &str,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<MessagesListResponse, ApiError>;

    async fn get_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<GmailMessage, ApiError>;

    /// Lists `messageAdded` changes after `start_history_id`.
    async fn list_history(
        &self,
        access_token: &str,
        start_history_id: &str,
        label_id: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<HistoryListResponse, ApiError>;

    async fn get_profile(&self, access_token: &str) -> Result<GmailProfile, ApiError>;

    async fn register_watch(
        &self,
        access_token: &str,
        topic: &str,
        label_ids: &[String],
    ) -> Result<WatchResponse, ApiError>;

    async fn stop_watch(&self, access_token: &str) -> Result<(), ApiError>;

    /// Exchanges a refresh token for a new access token. A revoked or expired
    /// refresh token yields [`ApiError::InvalidGrant`].
    async fn refresh_credential(&self, refresh_token: &str) -> Result<TokenGrant, ApiError>;
}

#[derive(Clone)]
pub struct GmailClient {
    client: Client,
    api_base: String,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl GmailClient {
    pub fn new(client_id: String, client_secret: String) -> Result<Self, ApiError> {
        Self::with_endpoints(
            client_id,
            client_secret,
            GMAIL_API_BASE.to_string(),
            GOOGLE_TOKEN_URL.to_string(),
        )
    }

    pub fn with_endpoints(
        client_id: String,
        client_secret: String,
        api_base: String,
        token_url: String,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ApiError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token_url,
            client_id,
            client_secret,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{}", self.api_base, path)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        operation: &str,
    ) -> Result<T, ApiError> {
        let response = request.send().await?;
        let response = check_status(response, operation).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("{}: {}. Raw response: {}", operation, e, text))
        })
    }
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    let value = response.headers().get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Converts a non-success response into [`ApiError::Http`]. The message is the
/// raw provider body, since rate-limit, quota and history-expiry reasons are
/// only reported there.
async fn check_status(response: Response, operation: &str) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    debug!("{} failed: HTTP {} - {}", operation, status, body);

    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("no response body").to_string()
    } else {
        body
    };
    Err(ApiError::Http {
        status: status.as_u16(),
        message,
        retry_after,
    })
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn list_messages(
        &self,
        access_token: &str,
        query: &str,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<MessagesListResponse, ApiError> {
        let mut params = vec![("maxResults", max_results.to_string())];
        if !query.is_empty() {
            params.push(("q", query.to_string()));
        }
        if let Some(page_token) = page_token {
            params.push(("pageToken", page_token.to_string()));
        }

        let request = self
            .client
            .get(self.url("messages"))
            .bearer_auth(access_token)
            .query(&params);
        self.send_json(request, "list messages").await
    }

    async fn get_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<GmailMessage, ApiError> {
        let request = self
            .client
            .get(self.url(&format!("messages/{}", message_id)))
            .bearer_auth(access_token)
            .query(&[("format", "full")]);
        self.send_json(request, "get message").await
    }

    async fn list_history(
        &self,
        access_token: &str,
        start_history_id: &str,
        label_id: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<HistoryListResponse, ApiError> {
        let mut params = vec![
            ("startHistoryId", start_history_id.to_string()),
            ("historyTypes", "messageAdded".to_string()),
            ("maxResults", "100".to_string()),
        ];
        if let Some(label_id) = label_id {
            params.push(("labelId", label_id.to_string()));
        }
        if let Some(page_token) = page_token {
            params.push(("pageToken", page_token.to_string()));
        }

        let request = self
            .client
            .get(self.url("history"))
            .bearer_auth(access_token)
            .query(&params);
        self.send_json(request, "list history").await
    }

    async fn get_profile(&self, access_token: &str) -> Result<GmailProfile, ApiError> {
        let request = self
            .client
            .get(self.url("profile"))
            .bearer_auth(access_token);
        self.send_json(request, "get profile").await
    }

    async fn register_watch(
        &self,
        access_token: &str,
        topic: &str,
        label_ids: &[String],
    ) -> Result<WatchResponse, ApiError> {
        let body = WatchRequest {
            topic_name: topic,
            label_ids,
            label_filter_behavior: "include",
        };
        let request = self
            .client
            .post(self.url("watch"))
            .bearer_auth(access_token)
            .json(&body);
        self.send_json(request, "register watch").await
    }

    async fn stop_watch(&self, access_token: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url("stop"))
            .bearer_auth(access_token)
            .send()
            .await?;
        check_status(response, "stop watch").await?;
        Ok(())
    }

    async fn refresh_credential(&self, refresh_token: &str) -> Result<TokenGrant, ApiError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let response = self.client.post(&self.token_url).form(&params).send().await?;

        let status = response.status();
        if status.is_success() {
            let text = response.text().await?;
            let mut grant: TokenGrant = serde_json::from_str(&text).map_err(|e| {
                ApiError::InvalidResponse(format!("refresh credential: {}", e))
            })?;
            grant.expiry_date = grant
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
            return Ok(grant);
        }

        let retry_after = parse_retry_after(&response);
        let body = response.text().await.unwrap_or_default();
        if let Ok(token_error) = serde_json::from_str::<TokenErrorResponse>(&body) {
            if token_error.error == "invalid_grant" {
                return Err(ApiError::InvalidGrant(
                    token_error
                        .error_description
                        .unwrap_or_else(|| "refresh token rejected".to_string()),
                ));
            }
        }

        Err(ApiError::Http {
            status: status.as_u16(),
            message: format!("refresh credential failed: {}", body),
            retry_after,
        })
    }
}
