#![allow(dead_code)]

pub mod mock_gmail;

use chrono::{Duration, Utc};
use shared::models::{Connection, NewEmail};
use shared::{BatchOptions, ConnectionStore, EmailStore, InMemoryStore, RetryOptions};
use std::sync::Arc;

use mock_gmail::{MockGmail, MockProcessor};
use txmail_gmail_connector::{AutoSyncSettings, EngineDeps, EngineOptions, SyncEngine};

pub const TEST_TOPIC: &str = "projects/txmail-test/topics/gmail";

pub fn test_options() -> EngineOptions {
    EngineOptions {
        pubsub_topic: TEST_TOPIC.to_string(),
        requests_per_second: 1000,
        retry: RetryOptions {
            max_retries: 0,
            initial_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
        batch: BatchOptions {
            batch_size: 50,
            concurrency: 10,
            delay_between_batches: std::time::Duration::ZERO,
        },
        auto_sync: AutoSyncSettings::default(),
    }
}

/// Connection with a token valid for another hour and no history cursor.
pub fn connection(id: &str, email_address: &str) -> Connection {
    let now = Utc::now();
    Connection {
        id: id.to_string(),
        user_id: format!("user-{}", id),
        email_address: email_address.to_string(),
        access_token: Some(format!("token-{}", id)),
        refresh_token: Some(format!("refresh-{}", id)),
        token_expires_at: Some(now + Duration::hours(1)),
        watch_enabled: false,
        auto_sync_interval_minutes: 15,
        last_history_id: None,
        last_watch_error: None,
        needs_reauth: false,
        last_synced_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Engine wired to the in-memory store, a scripted mailbox and a recording
/// processor.
pub struct TestEngine {
    pub store: Arc<InMemoryStore>,
    pub gmail: Arc<MockGmail>,
    pub processor: Arc<MockProcessor>,
    pub engine: SyncEngine,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_options(test_options())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let gmail = Arc::new(MockGmail::new());
        let processor = Arc::new(MockProcessor::default());

        let engine = SyncEngine::new(
            EngineDeps {
                provider: gmail.clone(),
                connections: store.clone(),
                subscriptions: store.clone(),
                emails: store.clone(),
                processor: processor.clone(),
            },
            options,
        );

        Self {
            store,
            gmail,
            processor,
            engine,
        }
    }

    pub fn seed(&self, connection: Connection) -> Connection {
        self.store.insert_connection(connection.clone()).unwrap();
        connection
    }

    pub async fn reload(&self, id: &str) -> Connection {
        ConnectionStore::find_by_id(self.store.as_ref(), id)
            .await
            .unwrap()
            .expect("connection should exist")
    }

    /// Stores an email as if an earlier pass had fetched and processed it.
    pub async fn store_email(&self, connection: &Connection, message_id: &str) {
        let stored = self
            .store
            .upsert(NewEmail {
                user_id: connection.user_id.clone(),
                connection_id: connection.id.clone(),
                message_id: message_id.to_string(),
                thread_id: None,
                subject: None,
                sender: None,
                snippet: None,
                internal_date: Utc::now() - Duration::hours(1),
                raw: serde_json::Value::Null,
            })
            .await
            .unwrap()
            .expect("email should be new");
        self.store.mark_processed(&stored.id).await.unwrap();
    }
}
