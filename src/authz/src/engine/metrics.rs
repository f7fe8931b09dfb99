//! Prometheus metrics for the permission engine

use std::collections::VecDeque;
use std::fmt::Write;
use std::time::Duration;
use tokio::sync::RwLock;

/// Engine counters and latency percentiles
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineMetrics {
    /// Individual checks, batch entries included
    pub total_checks: u64,

    pub allowed_checks: u64,

    pub denied_checks: u64,

    /// Checks passed by the admin short-circuit
    pub admin_short_circuits: u64,

    /// Manifest fetches served by a cache tier
    pub manifest_cache_hits: u64,

    /// Manifest fetches that compiled
    pub manifest_cache_misses: u64,

    /// Cache jobs the worker pool refused
    pub dropped_cache_jobs: u64,

    /// Cache jobs that exhausted their retries; filled in by the engine
    pub failed_cache_jobs: u64,

    /// Latency percentiles per operation
    pub latency_p50_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_p999_ms: f64,

    pub avg_latency_ms: f64,

    /// Operations that returned an error
    pub error_count: u64,
}

impl EngineMetrics {
    /// Manifest cache hit rate
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.manifest_cache_hits + self.manifest_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.manifest_cache_hits as f64 / total as f64
        }
    }

    pub fn allow_rate(&self) -> f64 {
        let total = self.allowed_checks + self.denied_checks;
        if total == 0 {
            0.0
        } else {
            self.allowed_checks as f64 / total as f64
        }
    }
}

/// Latency samples kept for percentile estimates
const MAX_SAMPLES: usize = 10_000;

#[derive(Default)]
struct Recorded {
    counters: EngineMetrics,
    /// Most recent latencies in milliseconds, oldest first
    latencies: VecDeque<f64>,
}

impl Recorded {
    /// Counters with latency figures derived from the current samples
    fn snapshot(&self) -> EngineMetrics {
        let mut snapshot = self.counters.clone();
        if self.latencies.is_empty() {
            return snapshot;
        }

        let mut sorted: Vec<f64> = self.latencies.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        snapshot.avg_latency_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;
        snapshot.latency_p50_ms = percentile(&sorted, 0.50);
        snapshot.latency_p90_ms = percentile(&sorted, 0.90);
        snapshot.latency_p95_ms = percentile(&sorted, 0.95);
        snapshot.latency_p99_ms = percentile(&sorted, 0.99);
        snapshot.latency_p999_ms = percentile(&sorted, 0.999);
        snapshot
    }
}

/// Metrics collector with Prometheus text export
///
/// Percentiles are computed when a snapshot is taken, not per sample.
#[derive(Default)]
pub struct MetricsCollector {
    recorded: RwLock<Recorded>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_cache_hit(&self) {
        self.recorded.write().await.counters.manifest_cache_hits += 1;
    }

    pub async fn record_cache_miss(&self) {
        self.recorded.write().await.counters.manifest_cache_misses += 1;
    }

    pub async fn record_admin_short_circuit(&self, checks: u64) {
        self.recorded.write().await.counters.admin_short_circuits += checks;
    }

    pub async fn record_dropped_job(&self) {
        self.recorded.write().await.counters.dropped_cache_jobs += 1;
    }

    /// Record one check decision
    pub async fn record_decision(&self, allowed: bool) {
        let mut recorded = self.recorded.write().await;
        let counters = &mut recorded.counters;
        counters.total_checks += 1;
        if allowed {
            counters.allowed_checks += 1;
        } else {
            counters.denied_checks += 1;
        }
    }

    pub async fn record_latency(&self, latency: Duration) {
        let mut recorded = self.recorded.write().await;
        if recorded.latencies.len() == MAX_SAMPLES {
            recorded.latencies.pop_front();
        }
        recorded.latencies.push_back(latency.as_secs_f64() * 1000.0);
    }

    pub async fn record_error(&self) {
        self.recorded.write().await.counters.error_count += 1;
    }

    /// Current metrics snapshot
    pub async fn get_metrics(&self) -> EngineMetrics {
        self.recorded.read().await.snapshot()
    }

    /// Export metrics in Prometheus text format
    pub async fn export_prometheus(&self) -> String {
        let metrics = self.get_metrics().await;

        let counters = [
            ("checks_total", "Permission checks evaluated", metrics.total_checks),
            ("allowed_total", "Checks allowed", metrics.allowed_checks),
            ("denied_total", "Checks denied", metrics.denied_checks),
            ("admin_short_circuits_total", "Checks passed by admin role", metrics.admin_short_circuits),
            ("manifest_cache_hits_total", "Manifest fetches served from cache", metrics.manifest_cache_hits),
            ("manifest_cache_misses_total", "Manifest fetches that compiled", metrics.manifest_cache_misses),
            ("cache_jobs_dropped_total", "Cache population jobs dropped", metrics.dropped_cache_jobs),
            ("errors_total", "Operations that failed", metrics.error_count),
        ];

        let mut text = String::new();
        for (name, help, value) in counters {
            let _ = writeln!(text, "# HELP tms_authz_{name} {help}");
            let _ = writeln!(text, "# TYPE tms_authz_{name} counter");
            let _ = writeln!(text, "tms_authz_{name} {value}\n");
        }

        let _ = writeln!(text, "# HELP tms_authz_latency_seconds Operation latency percentiles");
        let _ = writeln!(text, "# TYPE tms_authz_latency_seconds summary");
        for (quantile, ms) in [
            ("0.5", metrics.latency_p50_ms),
            ("0.9", metrics.latency_p90_ms),
            ("0.95", metrics.latency_p95_ms),
            ("0.99", metrics.latency_p99_ms),
            ("0.999", metrics.latency_p999_ms),
        ] {
            let _ = writeln!(text, "tms_authz_latency_seconds{{quantile=\"{quantile}\"}} {}", ms / 1000.0);
        }
        text
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    let idx = ((sorted.len() as f64) * p) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_decision() {
        let collector = MetricsCollector::new();

        collector.record_decision(true).await;
        collector.record_decision(false).await;
        collector.record_decision(true).await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.total_checks, 3);
        assert_eq!(metrics.allowed_checks, 2);
        assert_eq!(metrics.denied_checks, 1);
        assert!((metrics.allow_rate() - 0.666).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_manifest_hit_rate() {
        let collector = MetricsCollector::new();

        collector.record_cache_hit().await;
        collector.record_cache_hit().await;
        collector.record_cache_miss().await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.manifest_cache_hits, 2);
        assert!((metrics.cache_hit_rate() - 0.666).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_record_latency() {
        let collector = MetricsCollector::new();

        collector.record_latency(Duration::from_millis(5)).await;
        collector.record_latency(Duration::from_millis(10)).await;
        collector.record_latency(Duration::from_millis(15)).await;

        let metrics = collector.get_metrics().await;
        assert!((metrics.avg_latency_ms - 10.0).abs() < 1.0);
        assert!(metrics.latency_p50_ms > 0.0);
        assert!(metrics.latency_p99_ms >= metrics.latency_p50_ms);
    }

    #[tokio::test]
    async fn test_prometheus_export() {
        let collector = MetricsCollector::new();

        collector.record_decision(true).await;
        collector.record_admin_short_circuit(4).await;
        collector.record_dropped_job().await;

        let text = collector.export_prometheus().await;
        assert!(text.contains("tms_authz_checks_total 1"));
        assert!(text.contains("tms_authz_admin_short_circuits_total 4"));
        assert!(text.contains("tms_authz_cache_jobs_dropped_total 1"));
    }

    #[tokio::test]
    async fn test_latency_window_is_bounded() {
        let collector = MetricsCollector::new();

        for _ in 0..MAX_SAMPLES {
            collector.record_latency(Duration::from_millis(100)).await;
        }
        for _ in 0..MAX_SAMPLES {
            collector.record_latency(Duration::from_millis(1)).await;
        }

        assert_eq!(collector.recorded.read().await.latencies.len(), MAX_SAMPLES);
        let metrics = collector.get_metrics().await;
        assert!((metrics.latency_p999_ms - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_empty_snapshot_has_zero_latency() {
        let collector = MetricsCollector::new();
        collector.record_error().await;

        let metrics = collector.get_metrics().await;
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.latency_p50_ms, 0.0);
    }
}
