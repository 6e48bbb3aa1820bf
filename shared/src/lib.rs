pub mod batch;
pub mod config;
pub mod db;
pub mod models;
pub mod monitor;
pub mod rate_limiter;
pub mod retry;
pub mod telemetry;
pub mod test_environment;
pub mod traits;
pub mod utils;

pub use batch::{BatchOptions, BatchOutcome, BatchProcessor, BatchStats};
pub use config::DatabaseConfig;
pub use db::{DatabaseError, DatabasePool, InMemoryStore};
pub use models::*;
pub use monitor::PerformanceMonitor;
pub use rate_limiter::RateLimiter;
pub use retry::{with_retry, ApiError, RetryOptions, Retryable};
pub use traits::{ConnectionStore, EmailStore, WatchSubscriptionStore};
