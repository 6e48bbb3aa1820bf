use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 10;

/// Keyed sliding-window limiter.
///
/// Each key keeps a log of admission instants. A request is admitted when
/// fewer than `max_requests` admissions fall inside the trailing window, so no
/// window of that length ever contains more than `max_requests` admissions for
/// one key. All clones share the same counters.
#[derive(Clone)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    entries: Arc<DashMap<String, VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_REQUESTS_PER_SECOND)
    }
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        Self::with_window(requests_per_second, Duration::from_secs(1))
    }

    pub fn with_window(max_requests: u32, window: Duration) -> Self {
        let max_requests = max_requests.max(1) as usize;
        debug!(
            "Creating rate limiter with limit of {} requests per {:?}",
            max_requests, window
        );
        Self {
            max_requests,
            window,
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Admits one request under `key` if the window has room and records it.
    pub fn check_limit(&self, key: &str) -> bool {
        self.try_acquire(key).is_none()
    }

    /// Waits until a request under `key` is admitted.
    pub async fn wait_for_limit(&self, key: &str) {
        while let Some(wait) = self.try_acquire(key) {
            debug!("Rate limit reached for {}, waiting {:?}", key, wait);
            sleep(wait).await;
        }
    }

    /// Number of admissions for `key` inside the current window.
    pub fn in_flight(&self, key: &str) -> usize {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|log| {
                log.iter()
                    .filter(|at| now.duration_since(**at) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Returns `None` when admitted, otherwise how long until the oldest
    /// admission leaves the window.
    fn try_acquire(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        // The entry guard holds the shard lock, so prune-check-record is atomic per key.
        let mut log = self.entries.entry(key.to_string()).or_default();

        while let Some(oldest) = log.front() {
            if now.duration_since(*oldest) >= self.window {
                log.pop_front();
            } else {
                break;
            }
        }

        if log.len() < self.max_requests {
            log.push_back(now);
            return None;
        }

        let oldest = log.front().copied().unwrap_or(now);
        let remaining = self.window.saturating_sub(now.duration_since(oldest));
        Some(remaining.max(Duration::from_millis(1)))
    }
}
