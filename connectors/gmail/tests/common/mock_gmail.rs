use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use shared::ApiError;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use txmail_gmail_connector::models::{
    GmailMessage, GmailProfile, History, HistoryListResponse, HistoryMessage,
    HistoryMessageAdded, MessageInfo, MessagesListResponse, TokenGrant, WatchResponse,
};
use txmail_gmail_connector::{MailProvider, MessageProcessor};

pub const FRESH_TOKEN: &str = "fresh-access-token";
pub const FIRST_HISTORY_ID: u64 = 101;

pub fn gmail_message(id: &str, internal_date_ms: i64) -> GmailMessage {
    serde_json::from_value(json!({
        "id": id,
        "threadId": format!("thread-{}", id),
        "snippet": format!("Your receipt {}", id),
        "internalDate": internal_date_ms.to_string(),
        "payload": {
            "headers": [
                {"name": "Subject", "value": format!("Receipt {}", id)},
                {"name": "From", "value": "billing@shop.example.com"}
            ]
        }
    }))
    .unwrap()
}

/// Scripted mailbox. Messages are listed in insertion order.
pub struct MockGmailState {
    pub messages: Vec<GmailMessage>,
    pub list_error: Option<ApiError>,
    /// `get_message` fails for these ids.
    pub message_errors: HashMap<String, ApiError>,
    /// Change log, one record per id. Record `n` has history id `FIRST_HISTORY_ID + n`.
    pub history_message_ids: Vec<String>,
    /// Records per history page; `None` serves everything in one page.
    pub history_page_size: Option<usize>,
    pub history_page_cursor: Option<String>,
    pub history_error: Option<ApiError>,
    pub profile_history_id: String,
    pub watch_history_id: String,
    pub invalid_grant: bool,
    /// `register_watch` fails for these access tokens.
    pub failing_tokens: HashSet<String>,
    pub stop_error: Option<ApiError>,
    pub calls: Vec<String>,
}

impl Default for MockGmailState {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            list_error: None,
            message_errors: HashMap::new(),
            history_message_ids: Vec::new(),
            history_page_size: None,
            history_page_cursor: None,
            history_error: None,
            profile_history_id: "1000".to_string(),
            watch_history_id: "900".to_string(),
            invalid_grant: false,
            failing_tokens: HashSet::new(),
            stop_error: None,
            calls: Vec::new(),
        }
    }
}

#[derive(Default)]
pub struct MockGmail {
    state: Mutex<MockGmailState>,
}

impl MockGmail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<F: FnOnce(&mut MockGmailState)>(&self, apply: F) {
        apply(&mut self.state.lock().unwrap());
    }

    pub fn add_messages(&self, ids: &[&str]) {
        let base = Utc::now().timestamp_millis() - 60_000;
        self.update(|state| {
            for (offset, id) in ids.iter().enumerate() {
                state
                    .messages
                    .push(gmail_message(id, base + offset as i64 * 1000));
            }
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl MailProvider for MockGmail {
    async fn list_messages(
        &self,
        _access_token: &str,
        query: &str,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<MessagesListResponse, ApiError> {
        self.record(format!("list_messages:{}", query));
        let state = self.state.lock().unwrap();
        if let Some(error) = &state.list_error {
            return Err(error.clone());
        }
        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (offset + max_results as usize).min(state.messages.len());

        let messages = state.messages[offset..end]
            .iter()
            .map(|m| MessageInfo {
                id: m.id.clone(),
                thread_id: m.thread_id.clone(),
            })
            .collect();
        Ok(MessagesListResponse {
            messages: Some(messages),
            next_page_token: (end < state.messages.len()).then(|| end.to_string()),
            result_size_estimate: Some(state.messages.len() as u64),
        })
    }

    async fn get_message(
        &self,
        _access_token: &str,
        message_id: &str,
    ) -> Result<GmailMessage, ApiError> {
        self.record(format!("get_message:{}", message_id));
        let state = self.state.lock().unwrap();
        if let Some(error) = state.message_errors.get(message_id) {
            return Err(error.clone());
        }
        state
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or_else(|| ApiError::http(404, "Requested entity was not found."))
    }

    async fn list_history(
        &self,
        _access_token: &str,
        start_history_id: &str,
        _label_id: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<HistoryListResponse, ApiError> {
        self.record(format!("list_history:{}", start_history_id));
        let state = self.state.lock().unwrap();
        if let Some(error) = &state.history_error {
            return Err(error.clone());
        }

        let start: u64 = start_history_id.parse().unwrap_or(0);
        let records: Vec<History> = state
            .history_message_ids
            .iter()
            .enumerate()
            .map(|(n, id)| (FIRST_HISTORY_ID + n as u64, id))
            .filter(|(history_id, _)| *history_id > start)
            .map(|(history_id, id)| History {
                id: history_id.to_string(),
                messages_added: Some(vec![HistoryMessageAdded {
                    message: HistoryMessage {
                        id: id.clone(),
                        thread_id: format!("thread-{}", id),
                    },
                }]),
            })
            .collect();

        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let page_size = state.history_page_size.unwrap_or(records.len()).max(1);
        let end = (offset + page_size).min(records.len());
        let offset = offset.min(end);
        Ok(HistoryListResponse {
            history: Some(records[offset..end].to_vec()),
            next_page_token: (end < records.len()).then(|| end.to_string()),
            history_id: state.history_page_cursor.clone(),
        })
    }

    async fn get_profile(&self, _access_token: &str) -> Result<GmailProfile, ApiError> {
        self.record("get_profile".to_string());
        let state = self.state.lock().unwrap();
        Ok(GmailProfile {
            email_address: "mailbox@example.com".to_string(),
            messages_total: Some(state.messages.len() as u64),
            history_id: state.profile_history_id.clone(),
        })
    }

    async fn register_watch(
        &self,
        access_token: &str,
        _topic: &str,
        _label_ids: &[String],
    ) -> Result<WatchResponse, ApiError> {
        self.record("register_watch".to_string());
        let state = self.state.lock().unwrap();
        if state.failing_tokens.contains(access_token) {
            return Err(ApiError::http(403, "User not authorized to publish to topic"));
        }
        Ok(WatchResponse {
            history_id: state.watch_history_id.clone(),
            expiration: (Utc::now() + Duration::days(7))
                .timestamp_millis()
                .to_string(),
        })
    }

    async fn stop_watch(&self, _access_token: &str) -> Result<(), ApiError> {
        self.record("stop_watch".to_string());
        match &self.state.lock().unwrap().stop_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn refresh_credential(&self, _refresh_token: &str) -> Result<TokenGrant, ApiError> {
        self.record("refresh_credential".to_string());
        if self.state.lock().unwrap().invalid_grant {
            return Err(ApiError::InvalidGrant(
                "Token has been expired or revoked.".to_string(),
            ));
        }
        Ok(TokenGrant {
            access_token: FRESH_TOKEN.to_string(),
            refresh_token: None,
            expires_in: Some(3600),
            expiry_date: None,
        })
    }
}

/// Extraction stand-in that yields one transaction per email.
#[derive(Default)]
pub struct MockProcessor {
    processed: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    outage_calls: Mutex<usize>,
}

impl MockProcessor {
    pub fn processed(&self) -> Vec<String> {
        self.processed.lock().unwrap().clone()
    }

    pub fn fail_for(&self, stored_email_id: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(stored_email_id.to_string());
    }

    /// The next `calls` calls fail, whatever the email.
    pub fn fail_next(&self, calls: usize) {
        *self.outage_calls.lock().unwrap() = calls;
    }
}

#[async_trait]
impl MessageProcessor for MockProcessor {
    async fn process_one(&self, stored_email_id: &str) -> Result<Vec<String>> {
        {
            let mut outage = self.outage_calls.lock().unwrap();
            if *outage > 0 {
                *outage -= 1;
                return Err(anyhow!("extraction service 503"));
            }
        }
        if self.failing.lock().unwrap().contains(stored_email_id) {
            return Err(anyhow!("extraction rejected {}", stored_email_id));
        }
        self.processed
            .lock()
            .unwrap()
            .push(stored_email_id.to_string());
        Ok(vec![format!("txn-{}", stored_email_id)])
    }
}
