use crate::{
    db::error::DatabaseError,
    models::{WatchStatus, WatchSubscription},
    traits::WatchSubscriptionStore,
    utils::generate_ulid,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[derive(Clone)]
pub struct WatchSubscriptionRepository {
    pool: PgPool,
}

impl WatchSubscriptionRepository {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }
}

#[async_trait]
impl WatchSubscriptionStore for WatchSubscriptionRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<WatchSubscription>, DatabaseError> {
        let subscription = sqlx::query_as::<_, WatchSubscription>(
            "SELECT * FROM watch_subscriptions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn find_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<WatchSubscription>, DatabaseError> {
        let subscription = sqlx::query_as::<_, WatchSubscription>(
            "SELECT * FROM watch_subscriptions WHERE connection_id = $1",
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn upsert_active(
        &self,
        connection_id: &str,
        history_id: &str,
        expiration: DateTime<Utc>,
    ) -> Result<WatchSubscription, DatabaseError> {
        let subscription = sqlx::query_as::<_, WatchSubscription>(
            r#"
            INSERT INTO watch_subscriptions
                (id, connection_id, history_id, expiration, status, renewal_attempts,
                 last_error, last_renewed_at)
            VALUES ($1, $2, $3, $4, $5, 0, NULL, CURRENT_TIMESTAMP)
            ON CONFLICT (connection_id) DO UPDATE
            SET history_id = EXCLUDED.history_id,
                expiration = EXCLUDED.expiration,
                status = EXCLUDED.status,
                renewal_attempts = 0,
                last_error = NULL,
                last_renewed_at = CURRENT_TIMESTAMP,
                updated_at = CURRENT_TIMESTAMP
            RETURNING *
            "#,
        )
        .bind(generate_ulid())
        .bind(connection_id)
        .bind(history_id)
        .bind(expiration)
        .bind(WatchStatus::Active)
        .fetch_one(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn update_status(&self, id: &str, status: WatchStatus) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE watch_subscriptions
             SET status = $2, updated_at = CURRENT_TIMESTAMP
             WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound);
        }
        Ok(())
    }

    async fn record_renewal_failure(&self, id: &str, error: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE watch_subscriptions
             SET status = $2,
                 renewal_attempts = renewal_attempts + 1,
                 last_error = $3,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = $1",
        )
        .bind(id)
        .bind(WatchStatus::Failed)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound);
        }
        Ok(())
    }

    async fn mark_expired(&self, connection_id: &str) -> Result<(), DatabaseError> {
        // No row means nothing was ever registered; stopping stays idempotent.
        sqlx::query(
            "UPDATE watch_subscriptions
             SET status = $2, updated_at = CURRENT_TIMESTAMP
             WHERE connection_id = $1",
        )
        .bind(connection_id)
        .bind(WatchStatus::Expired)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_active_expiring_before(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<WatchSubscription>, DatabaseError> {
        let subscriptions = sqlx::query_as::<_, WatchSubscription>(
            "SELECT * FROM watch_subscriptions
             WHERE status = $1 AND expiration <= $2
             ORDER BY expiration ASC",
        )
        .bind(WatchStatus::Active)
        .bind(deadline)
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    async fn count_by_status(&self, status: WatchStatus) -> Result<i64, DatabaseError> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM watch_subscriptions WHERE status = $1")
                .bind(status)
                .fetch_one(&self.pool)
                .await?;

        Ok(count.0)
    }
}
