use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

const RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(60);
const QUOTA_FALLBACK: Duration = Duration::from_secs(300);

/// Failure of a call to a remote mailbox or credential provider.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, Self::InvalidGrant(_))
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else if let Some(status) = e.status() {
            Self::http(status.as_u16(), e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Classification used by [`with_retry`].
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ApiError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidGrant(_) => false,
            Self::Http { status, .. } => match status {
                400 | 401 | 403 | 404 => {
                    is_rate_limit_error(self) || is_quota_exceeded_error(self)
                }
                _ => true,
            },
            Self::Network(_) | Self::InvalidResponse(_) => true,
        }
    }
}

fn message_of(error: &ApiError) -> String {
    error.to_string().to_lowercase()
}

pub fn is_rate_limit_error(error: &ApiError) -> bool {
    if error.status() == Some(429) {
        return true;
    }
    let message = message_of(error);
    message.contains("ratelimitexceeded") || message.contains("rate limit")
}

pub fn is_quota_exceeded_error(error: &ApiError) -> bool {
    let message = message_of(error);
    message.contains("quotaexceeded")
        || message.contains("quota exceeded")
        || message.contains("dailylimitexceeded")
}

/// Suggested wait before the caller tries again, for rate-limit and quota
/// failures only.
pub fn get_retry_delay(error: &ApiError) -> Option<Duration> {
    if is_quota_exceeded_error(error) {
        return Some(error.retry_after().unwrap_or(QUOTA_FALLBACK));
    }
    if is_rate_limit_error(error) {
        return Some(error.retry_after().unwrap_or(RATE_LIMIT_FALLBACK));
    }
    None
}

#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before retry `attempt` (0-based): `initial * multiplier^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64)
    }
}

/// Runs `operation` up to `max_retries + 1` times, sleeping with exponential
/// backoff between attempts. Non-retryable errors are returned at once; after
/// the last attempt the last error is returned.
pub async fn with_retry<T, E, F, Fut>(mut operation: F, options: &RetryOptions) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => {
                debug!("Non-retryable error: {}", e);
                return Err(e);
            }
            Err(e) => {
                if attempt >= options.max_retries {
                    return Err(e);
                }
                let delay = options.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    "Transient error: {}, retry {} of {}, waiting {:?}",
                    e, attempt, options.max_retries, delay
                );
                sleep(delay).await;
            }
        }
    }
}
