mod common;

use common::{connection, TestEngine};
use shared::models::WatchStatus;
use shared::WatchSubscriptionStore;

fn env_with_two_connections() -> TestEngine {
    let env = TestEngine::new();
    env.seed(connection("conn-a", "alice@example.com"));
    env.seed(connection("conn-b", "bob@example.com"));
    env.gmail.update(|s| {
        s.failing_tokens.insert("token-conn-b".to_string());
    });
    env
}

#[tokio::test]
async fn test_migration_continues_past_failures() {
    let env = env_with_two_connections();

    let result = env.engine.migration.migrate_all_connections().await;

    assert!(!result.success);
    assert_eq!(result.total_connections, 2);
    assert_eq!(result.watches_setup, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].connection_id, "conn-b");
    assert!(result.errors[0]
        .error
        .contains("User not authorized to publish to topic"));

    // The successful connection stays migrated
    assert!(env.reload("conn-a").await.watch_enabled);
    let subscription = env
        .store
        .find_by_connection("conn-a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscription.status, WatchStatus::Active);

    let failed = env.reload("conn-b").await;
    assert!(!failed.watch_enabled);
    assert!(failed.last_watch_error.is_some());
}

#[tokio::test]
async fn test_migration_only_touches_polling_connections() {
    let env = env_with_two_connections();
    env.engine.migration.migrate_all_connections().await;

    env.gmail.update(|s| s.failing_tokens.clear());
    let second = env.engine.migration.migrate_all_connections().await;

    assert!(second.success);
    assert_eq!(second.total_connections, 1);
    assert_eq!(second.watches_setup, 1);
    assert_eq!(env.gmail.count_calls("register_watch"), 3);
}

#[tokio::test]
async fn test_migration_status_counts() {
    let env = env_with_two_connections();
    let mut revoked = connection("conn-c", "carol@example.com");
    revoked.needs_reauth = true;
    env.seed(revoked);

    env.engine.migration.migrate_all_connections().await;
    let status = env.engine.migration.get_migration_status().await.unwrap();

    assert_eq!(status.total_connections, 3);
    assert_eq!(status.watch_enabled, 1);
    assert_eq!(status.polling_only, 2);
    assert_eq!(status.needs_reauth, 1);
    assert_eq!(status.active_subscriptions, 1);
    assert_eq!(status.failed_subscriptions, 0);
}

#[tokio::test]
async fn test_rollback_disables_watches() {
    let env = env_with_two_connections();
    env.engine.migration.migrate_all_connections().await;

    let result = env.engine.migration.rollback_migration().await;

    assert!(result.success);
    assert_eq!(result.total_connections, 1);
    assert_eq!(result.disabled, 1);
    assert!(result.errors.is_empty());
    assert!(!env.reload("conn-a").await.watch_enabled);
    assert_eq!(env.gmail.count_calls("stop_watch"), 1);

    let status = env.engine.migration.get_migration_status().await.unwrap();
    assert_eq!(status.watch_enabled, 0);
    assert_eq!(status.active_subscriptions, 0);
    assert_eq!(status.expired_subscriptions, 1);
}

#[tokio::test]
async fn test_migrate_single_connection() {
    let env = env_with_two_connections();

    let ok = env.engine.migration.migrate_connection("conn-a").await;
    let failed = env.engine.migration.migrate_connection("conn-b").await;

    assert!(ok.success);
    assert!(!failed.success);
    assert!(!failed.reauth_required);
}

#[tokio::test]
async fn test_rollback_reports_failing_connection() {
    let env = env_with_two_connections();
    env.engine.migration.migrate_all_connections().await;
    env.gmail.update(|s| {
        s.stop_error = Some(shared::ApiError::http(403, "Insufficient Permission"));
    });

    let result = env.engine.migration.rollback_migration().await;

    assert!(!result.success);
    assert_eq!(result.failed, 1);
    assert_eq!(result.errors[0].connection_id, "conn-a");
    assert!(result.errors[0].error.contains("Insufficient Permission"));
}
