// SPDX-License-Identifier: MIT OR Apache-2.0

//! Call statistics and Prometheus-compatible export.
//!
//! Every completed client call updates one [`CallStats`] instance: total,
//! succeeded, failed, the number of extra attempts beyond the first, and a
//! latency histogram. Counters are plain atomics, so recording never blocks
//! or suspends the caller.
//!
//! # Example
//!
//! ```rust
//! use resilient_api_rs::runtime::{CallStats, ClientHealth};
//! use std::time::Duration;
//!
//! let stats = CallStats::new();
//! stats.record(true, 2, Duration::from_millis(42));
//!
//! let health = ClientHealth { stats: stats.snapshot(), breaker: None };
//! let output = health.to_prometheus_text("llm");
//! assert!(output.contains("llm_calls_retried_total 1"));
//! ```

use crate::runtime::circuit_breaker::BreakerSnapshot;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default latency buckets in seconds.
pub const DEFAULT_LATENCY_BUCKETS: [f64; 12] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// A histogram with cumulative bucket counters.
#[derive(Debug)]
struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64, // Store as nanoseconds
    count: AtomicU64,
}

impl Histogram {
    fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: Duration) {
        let secs = value.as_secs_f64();
        for (bucket, count) in self.buckets.iter().zip(&self.counts) {
            if secs <= *bucket {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum.fetch_add(
            u64::try_from(value.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
        self.sum.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            buckets: self
                .buckets
                .iter()
                .zip(&self.counts)
                .map(|(le, count)| (*le, count.load(Ordering::Relaxed)))
                .collect(),
            sum_secs: self.sum.load(Ordering::Relaxed) as f64 / 1_000_000_000.0,
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe call counters owned by one client.
#[derive(Debug)]
pub struct CallStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    latency: Histogram,
}

impl Default for CallStats {
    fn default() -> Self {
        Self::with_buckets(DEFAULT_LATENCY_BUCKETS.to_vec())
    }
}

impl CallStats {
    /// Create zeroed counters with the default latency buckets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create zeroed counters with custom latency buckets (seconds, ascending).
    #[must_use]
    pub fn with_buckets(buckets: Vec<f64>) -> Self {
        Self {
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            latency: Histogram::new(buckets),
        }
    }

    /// Record one completed call that took `attempts` tries.
    ///
    /// The outcome counter is bumped before `total` is published, so a
    /// concurrent [`snapshot`](Self::snapshot) never reports more calls in
    /// `total` than in `succeeded + failed`.
    pub fn record(&self, success: bool, attempts: u32, elapsed: Duration) {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.retried
            .fetch_add(u64::from(attempts.saturating_sub(1)), Ordering::Relaxed);
        self.latency.observe(elapsed);
        self.total.fetch_add(1, Ordering::Release);
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.succeeded.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.retried.store(0, Ordering::Relaxed);
        self.latency.reset();
    }

    /// Get a snapshot of the current counters.
    ///
    /// Counters are read without a lock. Under concurrent recording
    /// `succeeded + failed` may run ahead of `total`, never behind it.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.total.load(Ordering::Acquire);
        StatsSnapshot {
            total,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

/// Latency distribution at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySnapshot {
    /// `(upper bound in seconds, cumulative count)` pairs.
    pub buckets: Vec<(f64, u64)>,
    pub sum_secs: f64,
    pub count: u64,
}

/// Point-in-time copy of [`CallStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Extra attempts beyond the first, summed over all calls.
    pub retried: u64,
    pub latency: LatencySnapshot,
}

impl StatsSnapshot {
    /// Fraction of calls that succeeded (1.0 when no call was made).
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.succeeded as f64 / self.total as f64
    }
}

/// Health report returned by `ResilientClient::stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientHealth {
    pub stats: StatsSnapshot,
    /// Breaker view, absent when the client runs without a breaker.
    pub breaker: Option<BreakerSnapshot>,
}

impl ClientHealth {
    /// Export in Prometheus text format, prefixing names with `namespace`.
    #[must_use]
    pub fn to_prometheus_text(&self, namespace: &str) -> String {
        let ns = namespace;
        let stats = &self.stats;
        let mut output = String::new();

        let _ = writeln!(output, "# HELP {ns}_calls_total Completed calls by outcome");
        let _ = writeln!(output, "# TYPE {ns}_calls_total counter");
        let _ = writeln!(output, "{ns}_calls_total{{status=\"success\"}} {}", stats.succeeded);
        let _ = writeln!(output, "{ns}_calls_total{{status=\"error\"}} {}", stats.failed);
        output.push('\n');

        let _ = writeln!(output, "# HELP {ns}_calls_retried_total Attempts beyond the first");
        let _ = writeln!(output, "# TYPE {ns}_calls_retried_total counter");
        let _ = writeln!(output, "{ns}_calls_retried_total {}", stats.retried);
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP {ns}_call_duration_seconds Call duration in seconds, retries included"
        );
        let _ = writeln!(output, "# TYPE {ns}_call_duration_seconds histogram");
        for (le, count) in &stats.latency.buckets {
            let _ = writeln!(output, "{ns}_call_duration_seconds_bucket{{le=\"{le}\"}} {count}");
        }
        let _ = writeln!(
            output,
            "{ns}_call_duration_seconds_bucket{{le=\"+Inf\"}} {}",
            stats.latency.count
        );
        let _ = writeln!(output, "{ns}_call_duration_seconds_sum {}", stats.latency.sum_secs);
        let _ = writeln!(output, "{ns}_call_duration_seconds_count {}", stats.latency.count);

        if let Some(breaker) = &self.breaker {
            output.push('\n');
            let _ = writeln!(
                output,
                "# HELP {ns}_circuit_breaker_state Circuit breaker state (0=closed, 1=open, 2=half-open)"
            );
            let _ = writeln!(output, "# TYPE {ns}_circuit_breaker_state gauge");
            let _ = writeln!(output, "{ns}_circuit_breaker_state {}", breaker.state.as_gauge());
            output.push('\n');

            let _ = writeln!(
                output,
                "# HELP {ns}_circuit_breaker_rejections_total Requests rejected by circuit breaker"
            );
            let _ = writeln!(output, "# TYPE {ns}_circuit_breaker_rejections_total counter");
            let _ = writeln!(
                output,
                "{ns}_circuit_breaker_rejections_total {}",
                breaker.total_rejections
            );
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use std::sync::Arc;

    #[test]
    fn test_record_success_and_failure() {
        let stats = CallStats::new();
        stats.record(true, 1, Duration::from_millis(10));
        stats.record(false, 3, Duration::from_millis(20));
        stats.record(true, 2, Duration::from_millis(30));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.succeeded, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.retried, 3);
        assert_eq!(snapshot.latency.count, 3);
    }

    #[test]
    fn test_concurrent_snapshot_never_undercounts_outcomes() {
        let stats = CallStats::new();

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let stats = &stats;
                scope.spawn(move || {
                    for i in 0..2_000 {
                        stats.record((i + worker) % 3 != 0, 1, Duration::from_micros(50));
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..2_000 {
                    let snapshot = stats.snapshot();
                    assert!(
                        snapshot.succeeded + snapshot.failed >= snapshot.total,
                        "{snapshot:?}"
                    );
                }
            });
        });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total, 8_000);
        assert_eq!(snapshot.succeeded + snapshot.failed, snapshot.total);
    }

    #[test]
    fn test_rejected_call_has_no_retries() {
        let stats = CallStats::new();
        stats.record(false, 0, Duration::ZERO);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.retried, 0);
    }

    #[test]
    fn test_reset() {
        let stats = CallStats::new();
        stats.record(true, 4, Duration::from_millis(5));
        stats.reset();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.retried, 0);
        assert_eq!(snapshot.latency.count, 0);
        assert!(snapshot.latency.buckets.iter().all(|(_, c)| *c == 0));
    }

    #[test]
    fn test_success_rate() {
        let stats = CallStats::new();
        assert!((stats.snapshot().success_rate() - 1.0).abs() < f64::EPSILON);

        for ok in [true, true, true, false] {
            stats.record(ok, 1, Duration::from_millis(1));
        }
        assert!((stats.snapshot().success_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_histogram_buckets() {
        let stats = CallStats::with_buckets(vec![0.01, 0.1, 1.0]);

        // 50ms lands in the 0.1 and 1.0 buckets
        stats.record(true, 1, Duration::from_millis(50));

        let latency = stats.snapshot().latency;
        assert_eq!(latency.buckets, vec![(0.01, 0), (0.1, 1), (1.0, 1)]);
        assert!((latency.sum_secs - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = Arc::new(CallStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record(true, 2, Duration::from_micros(10));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total, 8000);
        assert_eq!(snapshot.retried, 8000);
    }

    #[test]
    fn test_prometheus_text_format() {
        let stats = CallStats::with_buckets(vec![0.1, 1.0]);
        stats.record(true, 2, Duration::from_millis(50));
        stats.record(false, 1, Duration::from_millis(500));
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        let health = ClientHealth {
            stats: stats.snapshot(),
            breaker: Some(breaker.snapshot()),
        };

        let output = health.to_prometheus_text("test");

        assert!(output.contains("# TYPE test_calls_total counter"));
        assert!(output.contains("test_calls_total{status=\"success\"} 1"));
        assert!(output.contains("test_calls_total{status=\"error\"} 1"));
        assert!(output.contains("test_calls_retried_total 1"));
        assert!(output.contains("test_call_duration_seconds_bucket{le=\"0.1\"} 1"));
        assert!(output.contains("test_call_duration_seconds_bucket{le=\"+Inf\"} 2"));
        assert!(output.contains("test_circuit_breaker_state 0"));
        assert!(output.contains("test_circuit_breaker_rejections_total 0"));
    }

    #[test]
    fn test_prometheus_without_breaker() {
        let health = ClientHealth {
            stats: CallStats::new().snapshot(),
            breaker: None,
        };

        let output = health.to_prometheus_text("svc");
        assert!(output.contains("svc_calls_total"));
        assert!(!output.contains("circuit_breaker"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = CallStats::new();
        stats.record(true, 1, Duration::from_millis(1));
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["retried"], 0);
    }
}
