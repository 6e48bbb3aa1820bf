use crate::config::DatabaseConfig;
use crate::db::error::DatabaseError;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
    database_url: String,
}

impl DatabasePool {
    pub async fn new(database_url: &str) -> Result<Self, DatabaseError> {
        Self::new_with_options(database_url, 10, 3).await
    }

    pub async fn new_with_options(
        database_url: &str,
        max_connections: u32,
        timeout_seconds: u64,
    ) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(timeout_seconds))
            .connect(database_url)
            .await?;

        Ok(Self {
            pool,
            database_url: database_url.to_string(),
        })
    }

    pub async fn from_config(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        Self::new_with_options(
            &config.database_url,
            config.max_connections,
            config.acquire_timeout_seconds,
        )
        .await
    }

    /// Applies the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
