//! Metrics collection
//!
//! Prometheus-compatible counters, gauges and latency histograms for both
//! the monitor (reports, decisions, failovers) and the keeper (transitions,
//! report failures). Rendered by the monitor at `/metrics`.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
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

    /// Cumulative buckets, last one is +Inf
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

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Per-route request metrics
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests_total: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    endpoints: Mutex<HashMap<String, Arc<EndpointMetrics>>>,

    // monitor
    pub reports_total: Counter,
    pub stale_reports_total: Counter,
    pub duplicate_reports_total: Counter,
    pub registrations_total: Counter,
    pub drops_total: Counter,
    pub goal_changes_total: Counter,
    pub failovers_total: Counter,
    pub switchovers_total: Counter,
    pub fenced_nodes_total: Counter,
    pub registered_nodes: Gauge,
    pub report_latency: Histogram,

    // keeper
    pub transitions_total: Counter,
    pub transition_failures_total: Counter,
    pub report_failures_total: Counter,
    pub self_fencing_total: Counter,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            reports_total: Counter::new(),
            stale_reports_total: Counter::new(),
            duplicate_reports_total: Counter::new(),
            registrations_total: Counter::new(),
            drops_total: Counter::new(),
            goal_changes_total: Counter::new(),
            failovers_total: Counter::new(),
            switchovers_total: Counter::new(),
            fenced_nodes_total: Counter::new(),
            registered_nodes: Gauge::new(),
            report_latency: Histogram::new(),
            transitions_total: Counter::new(),
            transition_failures_total: Counter::new(),
            report_failures_total: Counter::new(),
            self_fencing_total: Counter::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for an endpoint
    pub fn endpoint(&self, path: &str) -> Arc<EndpointMetrics> {
        let mut endpoints = self
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        endpoints
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(EndpointMetrics::default()))
            .clone()
    }

    pub fn record_request(&self, path: &str, duration: Duration, success: bool) {
        let endpoint = self.endpoint(path);
        endpoint.requests_total.inc();
        endpoint.latency.observe(duration.as_secs_f64() * 1000.0);
        if !success {
            endpoint.requests_error.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let requests = self.requests_counter();

        let counters: [(&str, &str, &Counter); 14] = [
            ("reports_total", "Health reports accepted", &self.reports_total),
            ("stale_reports_total", "Reports ignored for an older version", &self.stale_reports_total),
            ("duplicate_reports_total", "Retransmitted reports", &self.duplicate_reports_total),
            ("registrations_total", "Nodes registered", &self.registrations_total),
            ("drops_total", "Nodes dropped", &self.drops_total),
            ("goal_changes_total", "Goal state assignments", &self.goal_changes_total),
            ("failovers_total", "Automatic failovers started", &self.failovers_total),
            ("switchovers_total", "Switchovers started", &self.switchovers_total),
            ("fenced_nodes_total", "Silent primaries presumed fenced", &self.fenced_nodes_total),
            ("transitions_total", "Keeper edges applied", &self.transitions_total),
            ("transition_failures_total", "Keeper operation failures", &self.transition_failures_total),
            ("report_failures_total", "Keeper reports that did not reach the monitor", &self.report_failures_total),
            ("self_fencing_total", "Keeper self-demotions on partition", &self.self_fencing_total),
            ("requests_total", "HTTP requests", &requests),
        ];
        for (name, help, counter) in counters {
            write_metric(&mut out, name, help, "counter", counter.get());
        }

        write_metric(
            &mut out,
            "registered_nodes",
            "Nodes in the registry",
            "gauge",
            self.registered_nodes.get(),
        );
        write_metric(
            &mut out,
            "uptime_seconds",
            "Process uptime in seconds",
            "gauge",
            self.uptime_seconds(),
        );

        write_histogram(&mut out, "report_duration_ms", None, &self.report_latency);

        let endpoints = self
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = writeln!(out, "# TYPE autofailover_endpoint_errors_total counter");
        for (path, metrics) in endpoints.iter() {
            let _ = writeln!(
                out,
                "autofailover_endpoint_errors_total{{path=\"{}\"}} {}",
                path,
                metrics.requests_error.get()
            );
        }
        for (path, metrics) in endpoints.iter() {
            write_histogram(&mut out, "request_duration_ms", Some(path), &metrics.latency);
        }

        out
    }

    fn requests_counter(&self) -> Counter {
        let endpoints = self
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let total = Counter::new();
        for metrics in endpoints.values() {
            total.add(metrics.requests_total.get());
        }
        total
    }
}

fn write_metric(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(out, "# HELP autofailover_{} {}", name, help);
    let _ = writeln!(out, "# TYPE autofailover_{} {}", name, kind);
    let _ = writeln!(out, "autofailover_{} {}", name, value);
}

fn write_histogram(out: &mut String, name: &str, path: Option<&str>, hist: &Histogram) {
    let label = path
        .map(|p| format!("path=\"{}\",", p))
        .unwrap_or_default();
    for (le, count) in hist.get_buckets() {
        let le = if le.is_infinite() {
            "+Inf".to_string()
        } else {
            le.to_string()
        };
        let _ = writeln!(
            out,
            "autofailover_{}_bucket{{{}le=\"{}\"}} {}",
            name, label, le, count
        );
    }
    let label = label.trim_end_matches(',');
    let _ = writeln!(out, "autofailover_{}_sum{{{}}} {}", name, label, hist.sum());
    let _ = writeln!(out, "autofailover_{}_count{{{}}} {}", name, label, hist.count());
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new();

        hist.observe(5.0);
        hist.observe(50.0);
        hist.observe(50_000.0);

        assert_eq!(hist.count(), 3);
        let buckets = hist.get_buckets();
        assert_eq!(buckets[1], (5.0, 1));
        assert_eq!(buckets.last().unwrap().1, 3);
    }

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::new();
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);

        let gauge = Gauge::new();
        gauge.set(10);
        assert_eq!(gauge.get(), 10);
    }

    #[test]
    fn test_prometheus_output() {
        let registry = MetricsRegistry::new();
        registry.reports_total.add(3);
        registry.record_request("/v1/nodes/:id/report", Duration::from_millis(4), true);
        registry.record_request("/v1/nodes/:id/report", Duration::from_millis(40), false);

        let text = registry.to_prometheus();
        assert!(text.contains("autofailover_reports_total 3"));
        assert!(text.contains("autofailover_requests_total 2"));
        assert!(text.contains("autofailover_endpoint_errors_total{path=\"/v1/nodes/:id/report\"} 1"));
        assert!(text.contains("autofailover_request_duration_ms_count{path=\"/v1/nodes/:id/report\"} 2"));
        assert!(text.contains("autofailover_report_duration_ms_count{} 0"));
    }
}
