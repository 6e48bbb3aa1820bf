use chrono::{Duration, Utc};
use serde_json::json;
use shared::db::repositories::{ConnectionRepository, EmailRepository, WatchSubscriptionRepository};
use shared::models::{NewEmail, WatchStatus};
use shared::test_environment::{TestEnvironment, TEST_USER_ID};
use shared::traits::{ConnectionStore, EmailStore, WatchSubscriptionStore};

fn new_email(connection_id: &str, message_id: &str) -> NewEmail {
    NewEmail {
        user_id: TEST_USER_ID.to_string(),
        connection_id: connection_id.to_string(),
        message_id: message_id.to_string(),
        thread_id: Some(format!("thread-{}", message_id)),
        subject: Some("Your receipt".to_string()),
        sender: Some("shop@example.com".to_string()),
        snippet: None,
        internal_date: Utc::now(),
        raw: json!({ "id": message_id }),
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_history_checkpoint_updates_both_tables() {
    let env = TestEnvironment::new().await.unwrap();
    env.seed_connection("conn-1", "someone@example.com")
        .await
        .unwrap();
    let connections = ConnectionRepository::new(env.pool());
    let subscriptions = WatchSubscriptionRepository::new(env.pool());

    let sub = subscriptions
        .upsert_active("conn-1", "100", Utc::now() + Duration::days(7))
        .await
        .unwrap();
    assert_eq!(sub.status, WatchStatus::Active);

    connections
        .record_history_checkpoint("conn-1", "200")
        .await
        .unwrap();

    let conn = ConnectionStore::find_by_id(&connections, "conn-1")
        .await
        .unwrap()
        .unwrap();
    let sub = subscriptions
        .find_by_connection("conn-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn.last_history_id.as_deref(), Some("200"));
    assert_eq!(sub.history_id, "200");

    let missing = connections.record_history_checkpoint("nope", "1").await;
    assert!(missing.is_err());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_upsert_active_keeps_single_row() {
    let env = TestEnvironment::new().await.unwrap();
    env.seed_connection("conn-1", "someone@example.com")
        .await
        .unwrap();
    let subscriptions = WatchSubscriptionRepository::new(env.pool());

    let first = subscriptions
        .upsert_active("conn-1", "1", Utc::now() + Duration::days(7))
        .await
        .unwrap();
    subscriptions
        .record_renewal_failure(&first.id, "remote said no")
        .await
        .unwrap();
    assert_eq!(
        subscriptions.count_by_status(WatchStatus::Failed).await.unwrap(),
        1
    );

    let second = subscriptions
        .upsert_active("conn-1", "2", Utc::now() + Duration::days(7))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.renewal_attempts, 0);
    assert_eq!(
        subscriptions.count_by_status(WatchStatus::Active).await.unwrap(),
        1
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_email_upsert_ignores_duplicates() {
    let env = TestEnvironment::new().await.unwrap();
    env.seed_connection("conn-1", "someone@example.com")
        .await
        .unwrap();
    let emails = EmailRepository::new(env.pool());

    let stored = emails.upsert(new_email("conn-1", "m1")).await.unwrap();
    assert!(stored.is_some());
    assert!(emails
        .upsert(new_email("conn-1", "m1"))
        .await
        .unwrap()
        .is_none());

    let existing = emails
        .find_existing_message_ids(
            TEST_USER_ID,
            "conn-1",
            &["m1".to_string(), "m2".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(existing.len(), 1);
    assert!(existing.contains("m1"));

    assert!(emails
        .latest_processed_internal_date(TEST_USER_ID)
        .await
        .unwrap()
        .is_none());
    let stored = stored.unwrap();
    let pending = emails
        .find_unprocessed(TEST_USER_ID, "conn-1")
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, stored.id);

    emails.mark_processed(&stored.id).await.unwrap();
    assert!(emails
        .find_unprocessed(TEST_USER_ID, "conn-1")
        .await
        .unwrap()
        .is_empty());
    assert!(emails
        .latest_processed_internal_date(TEST_USER_ID)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_reset_credentials_flags_reauth() {
    let env = TestEnvironment::new().await.unwrap();
    env.seed_connection("conn-1", "someone@example.com")
        .await
        .unwrap();
    let connections = ConnectionRepository::new(env.pool());

    connections.set_watch_enabled("conn-1", true).await.unwrap();
    connections
        .reset_credentials("conn-1", "invalid_grant")
        .await
        .unwrap();

    let conn = connections
        .find_by_email("SOMEONE@example.com")
        .await
        .unwrap()
        .unwrap();
    assert!(conn.needs_reauth);
    assert!(!conn.watch_enabled);
    assert!(conn.access_token.is_none());
    assert!(conn.refresh_token.is_none());
}
