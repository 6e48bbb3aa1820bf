use crate::{db::error::DatabaseError, models::Connection, traits::ConnectionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

const CONNECTION_COLUMNS: &str = r#"
    id, user_id, email_address, access_token, refresh_token, token_expires_at,
    watch_enabled, auto_sync_interval_minutes, last_history_id, last_watch_error,
    needs_reauth, last_synced_at, created_at, updated_at
"#;

#[derive(Clone)]
pub struct ConnectionRepository {
    pool: PgPool,
}

impl ConnectionRepository {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }

    async fn execute_update(&self, query: PgQuery<'_>) -> Result<(), DatabaseError> {
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionStore for ConnectionRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<Connection>, DatabaseError> {
        let connection = sqlx::query_as::<_, Connection>(&format!(
            "SELECT {} FROM gmail_connections WHERE id = $1",
            CONNECTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(connection)
    }

    async fn find_by_email(
        &self,
        email_address: &str,
    ) -> Result<Option<Connection>, DatabaseError> {
        let connection = sqlx::query_as::<_, Connection>(&format!(
            "SELECT {} FROM gmail_connections WHERE LOWER(email_address) = LOWER($1)",
            CONNECTION_COLUMNS
        ))
        .bind(email_address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(connection)
    }

    async fn find_all(&self) -> Result<Vec<Connection>, DatabaseError> {
        let connections = sqlx::query_as::<_, Connection>(&format!(
            "SELECT {} FROM gmail_connections ORDER BY created_at ASC",
            CONNECTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(connections)
    }

    async fn find_by_watch_enabled(
        &self,
        enabled: bool,
    ) -> Result<Vec<Connection>, DatabaseError> {
        let connections = sqlx::query_as::<_, Connection>(&format!(
            "SELECT {} FROM gmail_connections WHERE watch_enabled = $1 ORDER BY created_at ASC",
            CONNECTION_COLUMNS
        ))
        .bind(enabled)
        .fetch_all(&self.pool)
        .await?;

        Ok(connections)
    }

    async fn update_credentials(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.execute_update(
            sqlx::query(
                "UPDATE gmail_connections
                 SET access_token = $2,
                     refresh_token = COALESCE($3, refresh_token),
                     token_expires_at = $4,
                     needs_reauth = FALSE,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = $1",
            )
            .bind(id)
            .bind(access_token)
            .bind(refresh_token)
            .bind(expires_at),
        )
        .await
    }

    async fn reset_credentials(&self, id: &str, reason: &str) -> Result<(), DatabaseError> {
        self.execute_update(
            sqlx::query(
                "UPDATE gmail_connections
                 SET access_token = NULL,
                     refresh_token = NULL,
                     token_expires_at = NULL,
                     needs_reauth = TRUE,
                     watch_enabled = FALSE,
                     last_watch_error = $2,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = $1",
            )
            .bind(id)
            .bind(reason),
        )
        .await
    }

    async fn set_watch_enabled(&self, id: &str, enabled: bool) -> Result<(), DatabaseError> {
        self.execute_update(
            sqlx::query(
                "UPDATE gmail_connections
                 SET watch_enabled = $2,
                     last_watch_error = CASE WHEN $2 THEN NULL ELSE last_watch_error END,
                     updated_at = CURRENT_TIMESTAMP
                 WHERE id = $1",
            )
            .bind(id)
            .bind(enabled),
        )
        .await
    }

    async fn set_watch_error(&self, id: &str, error: &str) -> Result<(), DatabaseError> {
        self.execute_update(
            sqlx::query(
                "UPDATE gmail_connections
                 SET last_watch_error = $2, updated_at = CURRENT_TIMESTAMP
                 WHERE id = $1",
            )
            .bind(id)
            .bind(error),
        )
        .await
    }

    async fn record_history_checkpoint(
        &self,
        id: &str,
        history_id: &str,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE gmail_connections
             SET last_history_id = $2, updated_at = CURRENT_TIMESTAMP
             WHERE id = $1",
        )
        .bind(id)
        .bind(history_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(DatabaseError::NotFound);
        }

        sqlx::query(
            "UPDATE watch_subscriptions
             SET history_id = $2, updated_at = CURRENT_TIMESTAMP
             WHERE connection_id = $1",
        )
        .bind(id)
        .bind(history_id)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(e.to_string()))?;

        Ok(())
    }

    async fn mark_synced(&self, id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.execute_update(
            sqlx::query(
                "UPDATE gmail_connections
                 SET last_synced_at = $2, updated_at = CURRENT_TIMESTAMP
                 WHERE id = $1",
            )
            .bind(id)
            .bind(at),
        )
        .await
    }
}
