use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesListResponse {
    pub messages: Option<Vec<MessageInfo>>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
    #[serde(rename = "resultSizeEstimate")]
    pub result_size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailMessage {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
    #[serde(rename = "labelIds")]
    pub label_ids: Option<Vec<String>>,
    pub snippet: Option<String>,
    #[serde(rename = "historyId")]
    pub history_id: Option<String>,
    #[serde(rename = "internalDate")]
    pub internal_date: Option<String>,
    pub payload: Option<MessagePart>,
    #[serde(rename = "sizeEstimate")]
    pub size_estimate: Option<u64>,
}

impl GmailMessage {
    pub fn header(&self, name: &str) -> Option<String> {
        self.payload
            .as_ref()?
            .headers
            .as_ref()?
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    }

    /// `internalDate` is epoch milliseconds as a string.
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        let millis = self.internal_date.as_deref()?.parse::<i64>().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(rename = "partId")]
    pub part_id: Option<String>,
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    pub filename: Option<String>,
    pub headers: Option<Vec<Header>>,
    pub body: Option<MessagePartBody>,
    pub parts: Option<Vec<MessagePart>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePartBody {
    #[serde(rename = "attachmentId")]
    pub attachment_id: Option<String>,
    pub size: Option<u64>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryListResponse {
    pub history: Option<Vec<History>>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
    #[serde(rename = "historyId")]
    pub history_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub id: String,
    #[serde(rename = "messagesAdded")]
    pub messages_added: Option<Vec<HistoryMessageAdded>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessageAdded {
    pub message: HistoryMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailProfile {
    #[serde(rename = "emailAddress")]
    pub email_address: String,
    #[serde(rename = "messagesTotal")]
    pub messages_total: Option<u64>,
    #[serde(rename = "historyId")]
    pub history_id: String,
}

#[derive(Debug, Serialize)]
pub struct WatchRequest<'a> {
    #[serde(rename = "topicName")]
    pub topic_name: &'a str,
    #[serde(rename = "labelIds")]
    pub label_ids: &'a [String],
    #[serde(rename = "labelFilterBehavior")]
    pub label_filter_behavior: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchResponse {
    #[serde(rename = "historyId")]
    pub history_id: String,
    /// Epoch milliseconds, serialized by the API as a string.
    pub expiration: String,
}

impl WatchResponse {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let millis = self.expiration.parse::<i64>().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }
}

/// Successful response of the OAuth token endpoint for a refresh grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Only present when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    #[serde(skip)]
    pub expiry_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct TokenErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
}

/// Pub/Sub push delivery envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    /// Base64-encoded JSON `{"emailAddress": .., "historyId": ..}`.
    pub data: String,
    #[serde(rename = "messageId")]
    pub message_id: Option<String>,
    #[serde(rename = "publishTime")]
    pub publish_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxNotification {
    #[serde(rename = "emailAddress")]
    pub email_address: String,
    #[serde(rename = "historyId", deserialize_with = "string_or_number")]
    pub history_id: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

impl PushEnvelope {
    pub fn decode(&self) -> Result<MailboxNotification, String> {
        let data = self.message.data.trim();
        let bytes = STANDARD
            .decode(data)
            .or_else(|_| URL_SAFE.decode(data))
            .map_err(|e| format!("invalid base64 payload: {}", e))?;
        serde_json::from_slice(&bytes).map_err(|e| format!("invalid notification payload: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_push_envelope() {
        let payload = json!({"emailAddress": "someone@example.com", "historyId": 9876});
        let envelope = PushEnvelope {
            message: PushMessage {
                data: STANDARD.encode(payload.to_string()),
                message_id: Some("1".to_string()),
                publish_time: None,
            },
            subscription: None,
        };

        let notification = envelope.decode().unwrap();
        assert_eq!(notification.email_address, "someone@example.com");
        assert_eq!(notification.history_id, "9876");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let envelope = PushEnvelope {
            message: PushMessage {
                data: "%%%".to_string(),
                message_id: None,
                publish_time: None,
            },
            subscription: None,
        };
        assert!(envelope.decode().is_err());
    }

    #[test]
    fn test_message_helpers() {
        let message: GmailMessage = serde_json::from_value(json!({
            "id": "m1",
            "threadId": "t1",
            "internalDate": "1700000000000",
            "payload": {
                "headers": [
                    {"name": "Subject", "value": "Receipt #42"},
                    {"name": "From", "value": "shop@example.com"}
                ]
            }
        }))
        .unwrap();

        assert_eq!(message.header("subject").as_deref(), Some("Receipt #42"));
        assert_eq!(message.received_at().unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_watch_expiration() {
        let response = WatchResponse {
            history_id: "1".to_string(),
            expiration: "1700000000000".to_string(),
        };
        assert_eq!(response.expires_at().unwrap().timestamp(), 1_700_000_000);
    }
}
