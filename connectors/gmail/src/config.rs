use shared::config::{get_optional_env, get_required_env, parse_env_or, parse_port, validate_url};
use shared::rate_limiter::DEFAULT_REQUESTS_PER_SECOND;
use shared::{BatchOptions, DatabaseConfig, RetryOptions};
use std::env;
use std::time::Duration;

use crate::client::{GMAIL_API_BASE, GOOGLE_TOKEN_URL};
use crate::engine::EngineOptions;
use crate::executor::AutoSyncSettings;

#[derive(Debug, Clone)]
pub struct GmailConnectorConfig {
    pub database: DatabaseConfig,
    pub port: u16,
    pub google_client_id: String,
    pub google_client_secret: String,
    pub pubsub_topic: String,
    pub extraction_service_url: String,
    pub gmail_api_base_url: String,
    pub google_token_url: String,
    pub rate_limit_per_second: u32,
    pub max_retries: u32,
    pub fetch_batch_size: usize,
    pub fetch_concurrency: usize,
    pub batch_delay_ms: u64,
    pub sync_page_size: u32,
    pub sync_query: Option<String>,
    pub auto_sync_tick_seconds: u64,
    pub watch_renewal_interval_seconds: u64,
}

impl GmailConnectorConfig {
    pub fn from_env() -> Self {
        let database = DatabaseConfig::from_env();

        let port_str = get_optional_env("PORT", "3000");
        let port = parse_port(&port_str, "PORT");

        let extraction_service_url = get_required_env("EXTRACTION_SERVICE_URL");
        let extraction_service_url =
            validate_url(&extraction_service_url, "EXTRACTION_SERVICE_URL");

        let gmail_api_base_url = get_optional_env("GMAIL_API_BASE_URL", GMAIL_API_BASE);
        let gmail_api_base_url = validate_url(&gmail_api_base_url, "GMAIL_API_BASE_URL");
        let google_token_url = get_optional_env("GOOGLE_TOKEN_URL", GOOGLE_TOKEN_URL);
        let google_token_url = validate_url(&google_token_url, "GOOGLE_TOKEN_URL");

        let sync_query = env::var("GMAIL_SYNC_QUERY")
            .ok()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());

        Self {
            database,
            port,
            google_client_id: get_required_env("GOOGLE_CLIENT_ID"),
            google_client_secret: get_required_env("GOOGLE_CLIENT_SECRET"),
            pubsub_topic: get_required_env("GMAIL_PUBSUB_TOPIC"),
            extraction_service_url,
            gmail_api_base_url,
            google_token_url,
            rate_limit_per_second: parse_env_or(
                "GMAIL_RATE_LIMIT_PER_SECOND",
                DEFAULT_REQUESTS_PER_SECOND,
            ),
            max_retries: parse_env_or("GMAIL_MAX_RETRIES", 3),
            fetch_batch_size: parse_env_or("GMAIL_FETCH_BATCH_SIZE", 50),
            fetch_concurrency: parse_env_or("GMAIL_FETCH_CONCURRENCY", 10),
            batch_delay_ms: parse_env_or("GMAIL_BATCH_DELAY_MS", 100),
            sync_page_size: parse_env_or("GMAIL_SYNC_PAGE_SIZE", 50),
            sync_query,
            auto_sync_tick_seconds: parse_env_or("AUTO_SYNC_TICK_SECONDS", 60),
            watch_renewal_interval_seconds: parse_env_or("WATCH_RENEWAL_INTERVAL_SECONDS", 3600),
        }
    }

    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions::default().with_max_retries(self.max_retries)
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            batch_size: self.fetch_batch_size,
            concurrency: self.fetch_concurrency,
            delay_between_batches: Duration::from_millis(self.batch_delay_ms),
        }
    }

    pub fn auto_sync_settings(&self) -> AutoSyncSettings {
        AutoSyncSettings {
            page_size: self.sync_page_size,
            query: self.sync_query.clone(),
            ..Default::default()
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            pubsub_topic: self.pubsub_topic.clone(),
            requests_per_second: self.rate_limit_per_second,
            retry: self.retry_options(),
            batch: self.batch_options(),
            auto_sync: self.auto_sync_settings(),
        }
    }
}
