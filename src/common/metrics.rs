//! Registrar metrics
//!
//! Prometheus-compatible counters and a heartbeat latency histogram, one set
//! per registrar instance.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries for heartbeat latency (in milliseconds)
const LATENCY_BUCKETS: [f64; 10] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default latency buckets
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    /// Create a histogram with custom bucket boundaries
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // stored as microseconds
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Per-registrar metrics
#[derive(Debug, Default)]
pub struct RegistrarMetrics {
    pub heartbeats: Counter,
    pub heartbeat_failures: Counter,
    pub reshards: Counter,
    pub notifications_rejected: Counter,
    pub shard_changes: Counter,
    pub heartbeat_latency: Histogram,
}

impl RegistrarMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed heartbeat cycle
    pub fn record_heartbeat(&self, duration: Duration, success: bool) {
        self.heartbeats.inc();
        self.heartbeat_latency
            .observe(duration.as_secs_f64() * 1000.0);
        if !success {
            self.heartbeat_failures.inc();
        }
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self, cluster: &str, holder: &str) -> String {
        let labels = format!("cluster=\"{}\",holder=\"{}\"", cluster, holder);
        let mut out = String::new();

        let counters = [
            ("heartbeats_total", "Heartbeat cycles run", &self.heartbeats),
            (
                "heartbeat_failures_total",
                "Heartbeat cycles that surfaced an error",
                &self.heartbeat_failures,
            ),
            ("reshards_total", "Reshards invoked as coordinator", &self.reshards),
            (
                "notifications_rejected_total",
                "Inbound assignments rejected by validation",
                &self.notifications_rejected,
            ),
            ("shard_changes_total", "Accepted assignment changes", &self.shard_changes),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP shard_registrar_{} {}", name, help);
            let _ = writeln!(out, "# TYPE shard_registrar_{} counter", name);
            let _ = writeln!(out, "shard_registrar_{}{{{}}} {}", name, labels, counter.get());
        }

        out.push_str("# HELP shard_registrar_heartbeat_duration_ms Heartbeat duration in milliseconds\n");
        out.push_str("# TYPE shard_registrar_heartbeat_duration_ms histogram\n");
        for (le, count) in self.heartbeat_latency.get_buckets() {
            let le = if le.is_infinite() {
                "+Inf".to_string()
            } else {
                le.to_string()
            };
            let _ = writeln!(
                out,
                "shard_registrar_heartbeat_duration_ms_bucket{{{},le=\"{}\"}} {}",
                labels, le, count
            );
        }
        let _ = writeln!(
            out,
            "shard_registrar_heartbeat_duration_ms_sum{{{}}} {}",
            labels,
            self.heartbeat_latency.sum()
        );
        let _ = writeln!(
            out,
            "shard_registrar_heartbeat_duration_ms_count{{{}}} {}",
            labels,
            self.heartbeat_latency.count()
        );

        out
    }
}
