use futures::stream::{self, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub concurrency: usize,
    pub delay_between_batches: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            concurrency: 10,
            delay_between_batches: Duration::from_millis(100),
        }
    }
}

/// Per-item result. Order of outcomes is not the order of the input.
#[derive(Debug)]
pub struct BatchOutcome<T, R, E> {
    pub item: T,
    pub result: Result<R, E>,
}

impl<T, R, E> BatchOutcome<T, R, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
}

impl BatchStats {
    pub fn from_outcomes<T, R, E>(outcomes: &[BatchOutcome<T, R, E>]) -> Self {
        let total = outcomes.len();
        let successful = outcomes.iter().filter(|o| o.is_success()).count();
        let success_rate = if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64
        };
        Self {
            total,
            successful,
            failed: total - successful,
            success_rate,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchProcessor {
    options: BatchOptions,
}

impl BatchProcessor {
    pub fn new(options: BatchOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Runs `processor` over every item: chunks of `batch_size` run one after
    /// another, and at most `concurrency` items of a chunk are in flight at
    /// once. Individual failures are reported in the outcomes, never raised.
    pub async fn process_batch<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        processor: F,
    ) -> Vec<BatchOutcome<T, R, E>>
    where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let batch_size = self.options.batch_size.max(1);
        let concurrency = self.options.concurrency.max(1);
        let total = items.len();
        let mut outcomes = Vec::with_capacity(total);

        let mut remaining = items.into_iter().peekable();
        let mut chunk_index = 0;
        while remaining.peek().is_some() {
            if chunk_index > 0 && !self.options.delay_between_batches.is_zero() {
                sleep(self.options.delay_between_batches).await;
            }

            let chunk: Vec<T> = remaining.by_ref().take(batch_size).collect();
            debug!(
                "Processing chunk {} ({} items, {} total)",
                chunk_index + 1,
                chunk.len(),
                total
            );

            let chunk_outcomes: Vec<BatchOutcome<T, R, E>> = stream::iter(chunk)
                .map(|item| {
                    let fut = processor(item.clone());
                    async move {
                        BatchOutcome {
                            item,
                            result: fut.await,
                        }
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            outcomes.extend(chunk_outcomes);
            chunk_index += 1;
        }

        outcomes
    }
}
