use crate::{
    db::error::DatabaseError,
    models::{NewEmail, StoredEmail},
    traits::EmailStore,
    utils::generate_ulid,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashSet;

#[derive(Clone)]
pub struct EmailRepository {
    pool: PgPool,
}

impl EmailRepository {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }
}

#[async_trait]
impl EmailStore for EmailRepository {
    async fn find_existing_message_ids(
        &self,
        user_id: &str,
        connection_id: &str,
        message_ids: &[String],
    ) -> Result<HashSet<String>, DatabaseError> {
        if message_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT message_id FROM emails
             WHERE user_id = $1 AND connection_id = $2 AND message_id = ANY($3)",
        )
        .bind(user_id)
        .bind(connection_id)
        .bind(message_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn upsert(&self, email: NewEmail) -> Result<Option<StoredEmail>, DatabaseError> {
        let stored = sqlx::query_as::<_, StoredEmail>(
            r#"
            INSERT INTO emails
                (id, user_id, connection_id, message_id, thread_id, subject, sender,
                 snippet, internal_date, raw)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id, connection_id, message_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(generate_ulid())
        .bind(&email.user_id)
        .bind(&email.connection_id)
        .bind(&email.message_id)
        .bind(&email.thread_id)
        .bind(&email.subject)
        .bind(&email.sender)
        .bind(&email.snippet)
        .bind(email.internal_date)
        .bind(&email.raw)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stored)
    }

    async fn latest_processed_internal_date(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let latest: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT internal_date FROM emails
             WHERE user_id = $1 AND processed_at IS NOT NULL
             ORDER BY internal_date DESC
             LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(latest.map(|(date,)| date))
    }

    async fn find_unprocessed(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<Vec<StoredEmail>, DatabaseError> {
        let emails = sqlx::query_as::<_, StoredEmail>(
            "SELECT * FROM emails
             WHERE user_id = $1 AND connection_id = $2 AND processed_at IS NULL
             ORDER BY internal_date ASC, id ASC",
        )
        .bind(user_id)
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(emails)
    }

    async fn mark_processed(&self, id: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE emails SET processed_at = CURRENT_TIMESTAMP WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound);
        }
        Ok(())
    }
}
