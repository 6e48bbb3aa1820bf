mod common;

use chrono::{Duration, Utc};
use common::{connection, TestEngine};
use shared::models::WatchStatus;
use shared::{ApiError, WatchSubscriptionStore};
use txmail_gmail_connector::REAUTH_MESSAGE;

#[tokio::test]
async fn test_setup_watch_activates_subscription_and_seeds_cursor() {
    let env = TestEngine::new();
    env.seed(connection("conn-1", "alice@example.com"));
    env.gmail.update(|s| s.watch_history_id = "4242".to_string());

    let result = env.engine.watches.setup_watch("conn-1").await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.history_id.as_deref(), Some("4242"));
    assert!(result.expiration.unwrap() > Utc::now() + Duration::days(6));

    let stored = env.reload("conn-1").await;
    assert!(stored.watch_enabled);
    assert_eq!(stored.last_history_id.as_deref(), Some("4242"));

    let subscription = env
        .store
        .find_by_connection("conn-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.status, WatchStatus::Active);
    assert_eq!(subscription.history_id, "4242");
    assert_eq!(subscription.renewal_attempts, 0);
}

#[tokio::test]
async fn test_setup_watch_keeps_existing_cursor() {
    let env = TestEngine::new();
    let mut conn = connection("conn-1", "alice@example.com");
    conn.last_history_id = Some("10".to_string());
    env.seed(conn);

    let result = env.engine.watches.setup_watch("conn-1").await;

    assert!(result.success);
    assert_eq!(
        env.reload("conn-1").await.last_history_id.as_deref(),
        Some("10")
    );
}

#[tokio::test]
async fn test_setup_watch_with_revoked_credentials_requires_reauth() {
    let env = TestEngine::new();
    let mut conn = connection("conn-1", "alice@example.com");
    conn.token_expires_at = Some(Utc::now() - Duration::minutes(1));
    env.seed(conn);
    env.gmail.update(|s| s.invalid_grant = true);

    let result = env.engine.watches.setup_watch("conn-1").await;

    assert!(!result.success);
    assert!(result.reauth_required);
    assert_eq!(result.error.as_deref(), Some(REAUTH_MESSAGE));
    assert_eq!(env.gmail.count_calls("register_watch"), 0);

    let stored = env.reload("conn-1").await;
    assert!(stored.needs_reauth);
    assert!(stored.access_token.is_none());
    assert!(stored.refresh_token.is_none());
    assert!(!stored.watch_enabled);
}

#[tokio::test]
async fn test_setup_watch_for_unknown_connection_fails() {
    let env = TestEngine::new();

    let result = env.engine.watches.setup_watch("missing").await;

    assert!(!result.success);
    assert!(!result.reauth_required);
    assert!(result.error.unwrap().contains("missing"));
}

#[tokio::test]
async fn test_failed_renewal_marks_subscription_failed() {
    let env = TestEngine::new();
    env.seed(connection("conn-1", "alice@example.com"));
    assert!(env.engine.watches.setup_watch("conn-1").await.success);
    let subscription = env
        .store
        .find_by_connection("conn-1")
        .await
        .unwrap()
        .unwrap();

    env.gmail.update(|s| {
        s.failing_tokens.insert("token-conn-1".to_string());
    });
    let result = env.engine.watches.renew_watch(&subscription.id).await;

    assert!(!result.success);
    let failed = WatchSubscriptionStore::find_by_id(env.store.as_ref(), &subscription.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, WatchStatus::Failed);
    assert_eq!(failed.renewal_attempts, 1);
    assert!(failed.last_error.unwrap().contains("not authorized"));
    assert!(env.reload("conn-1").await.last_watch_error.is_some());
}

#[tokio::test]
async fn test_renewal_resets_subscription_to_active() {
    let env = TestEngine::new();
    env.seed(connection("conn-1", "alice@example.com"));
    assert!(env.engine.watches.setup_watch("conn-1").await.success);
    let subscription = env
        .store
        .find_by_connection("conn-1")
        .await
        .unwrap()
        .unwrap();

    env.gmail.update(|s| s.watch_history_id = "950".to_string());
    let result = env.engine.watches.renew_watch(&subscription.id).await;

    assert!(result.success);
    let renewed = env
        .store
        .find_by_connection("conn-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(renewed.id, subscription.id);
    assert_eq!(renewed.status, WatchStatus::Active);
    assert_eq!(renewed.history_id, "950");
    assert_eq!(env.gmail.count_calls("register_watch"), 2);
}

#[tokio::test]
async fn test_stop_watch_is_idempotent() {
    let env = TestEngine::new();
    env.seed(connection("conn-1", "alice@example.com"));
    assert!(env.engine.watches.setup_watch("conn-1").await.success);

    let first = env.engine.watches.stop_watch("conn-1").await;
    let second = env.engine.watches.stop_watch("conn-1").await;

    assert!(first.success);
    assert!(second.success);
    assert_eq!(env.gmail.count_calls("stop_watch"), 1);
    assert!(!env.reload("conn-1").await.watch_enabled);
    let subscription = env
        .store
        .find_by_connection("conn-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.status, WatchStatus::Expired);
}

#[tokio::test]
async fn test_stop_watch_treats_missing_remote_watch_as_stopped() {
    let env = TestEngine::new();
    env.seed(connection("conn-1", "alice@example.com"));
    assert!(env.engine.watches.setup_watch("conn-1").await.success);
    env.gmail
        .update(|s| s.stop_error = Some(ApiError::http(404, "Not Found")));

    let result = env.engine.watches.stop_watch("conn-1").await;

    assert!(result.success);
    assert!(!env.reload("conn-1").await.watch_enabled);
}

#[tokio::test]
async fn test_stop_watch_surfaces_provider_failure() {
    let env = TestEngine::new();
    env.seed(connection("conn-1", "alice@example.com"));
    assert!(env.engine.watches.setup_watch("conn-1").await.success);
    env.gmail
        .update(|s| s.stop_error = Some(ApiError::http(403, "Forbidden")));

    let result = env.engine.watches.stop_watch("conn-1").await;

    assert!(!result.success);
    assert!(env.reload("conn-1").await.watch_enabled);
}

#[tokio::test]
async fn test_find_expiring_soon_only_returns_near_expirations() {
    let env = TestEngine::new();
    env.seed(connection("conn-1", "alice@example.com"));
    env.seed(connection("conn-2", "bob@example.com"));
    env.store
        .upsert_active("conn-1", "100", Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    env.store
        .upsert_active("conn-2", "200", Utc::now() + Duration::days(3))
        .await
        .unwrap();

    let expiring = env.engine.watches.find_expiring_soon().await.unwrap();

    assert_eq!(expiring.len(), 1);
    assert_eq!(expiring[0].connection_id, "conn-1");
}

#[tokio::test]
async fn test_renewal_sweep_expires_lapsed_subscriptions() {
    let env = TestEngine::new();
    for (id, email) in [("conn-1", "alice@example.com"), ("conn-2", "bob@example.com")] {
        let mut conn = connection(id, email);
        conn.watch_enabled = true;
        env.seed(conn);
    }
    env.store
        .upsert_active("conn-1", "100", Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    env.store
        .upsert_active("conn-2", "200", Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    env.gmail.update(|s| {
        s.failing_tokens.insert("token-conn-2".to_string());
    });

    let sweep = env.engine.watches.renew_expiring_watches().await;

    assert_eq!(sweep.checked, 2);
    assert_eq!(sweep.renewed, 1);
    assert_eq!(sweep.failed, 1);
    assert_eq!(sweep.expired, 1);
    let lapsed = env
        .store
        .find_by_connection("conn-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lapsed.status, WatchStatus::Expired);
    let renewed = env
        .store
        .find_by_connection("conn-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(renewed.status, WatchStatus::Active);
    assert!(renewed.expiration > Utc::now() + Duration::days(6));
    assert!(env.reload("conn-1").await.watch_enabled);
    assert!(!env.reload("conn-2").await.watch_enabled);

    // The lapsed connection is back on polling and gets migrated again
    env.gmail.update(|s| s.failing_tokens.clear());
    let migration = env.engine.migration.migrate_all_connections().await;
    assert_eq!(migration.total_connections, 1);
    assert_eq!(migration.watches_setup, 1);
    assert!(env.reload("conn-2").await.watch_enabled);
}
