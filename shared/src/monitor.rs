use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct OperationStats {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl OperationStats {
    pub fn average_duration_ms(&self) -> u64 {
        if self.calls == 0 {
            0
        } else {
            self.total_duration_ms / self.calls
        }
    }
}

/// Per-operation call timings, shared by every sync path in the process.
#[derive(Clone, Default)]
pub struct PerformanceMonitor {
    operations: Arc<DashMap<String, OperationStats>>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: &str, duration: Duration, success: bool) {
        let millis = duration.as_millis() as u64;
        let mut stats = self.operations.entry(operation.to_string()).or_default();
        stats.calls += 1;
        if !success {
            stats.failures += 1;
        }
        stats.total_duration_ms += millis;
        stats.max_duration_ms = stats.max_duration_ms.max(millis);
    }

    pub fn start(&self, operation: &str) -> OperationTimer {
        OperationTimer {
            monitor: self.clone(),
            operation: operation.to_string(),
            started: Instant::now(),
        }
    }

    pub fn stats(&self, operation: &str) -> Option<OperationStats> {
        self.operations.get(operation).map(|s| s.clone())
    }

    pub fn snapshot(&self) -> BTreeMap<String, OperationStats> {
        self.operations
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

pub struct OperationTimer {
    monitor: PerformanceMonitor,
    operation: String,
    started: Instant,
}

impl OperationTimer {
    pub fn finish(self, success: bool) -> Duration {
        let elapsed = self.started.elapsed();
        self.monitor.record(&self.operation, elapsed, success);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_aggregates() {
        let monitor = PerformanceMonitor::new();
        monitor.record("history_sync", Duration::from_millis(30), true);
        monitor.record("history_sync", Duration::from_millis(10), false);

        let stats = monitor.stats("history_sync").unwrap();
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.total_duration_ms, 40);
        assert_eq!(stats.max_duration_ms, 30);
        assert_eq!(stats.average_duration_ms(), 20);
    }

    #[test]
    fn test_timer_and_snapshot() {
        let monitor = PerformanceMonitor::new();
        monitor.start("auto_sync").finish(true);
        monitor.start("watch_setup").finish(false);

        let snapshot = monitor.snapshot();
        assert_eq!(
            snapshot.keys().collect::<Vec<_>>(),
            vec!["auto_sync", "watch_setup"]
        );
        assert_eq!(snapshot["watch_setup"].failures, 1);
        assert!(monitor.stats("missing").is_none());
    }
}
