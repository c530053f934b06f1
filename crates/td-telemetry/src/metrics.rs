use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};

use ahash::AHashMap;
use serde::Serialize;

/// Upper bounds of the latency buckets, in seconds.
const DURATION_BUCKETS: [f64; 10] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Cumulative latency histogram. The sum is kept in microseconds so it can be
/// a plain atomic integer.
#[derive(Debug)]
pub struct Histogram {
    counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            counts: DURATION_BUCKETS.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, seconds: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0).max(0.0) as u64, Ordering::Relaxed);
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted `key=value` pairs identifying one counter series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort();
        Self(v)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    fn to_prometheus(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Summary exposed by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub server_errors_total: u64,
    pub mean_latency_ms: f64,
}

/// In-process counters and histograms.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
            if let Some(c) = counters.get(&key) {
                c.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum of every series of `name` whose labels pass `filter`.
    fn sum_counter(&self, name: &str, filter: impl Fn(&Labels) -> bool) -> u64 {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|((n, labels), _)| n == name && filter(labels))
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn observe(&self, name: &str, seconds: f64) {
        {
            let histograms = self.histograms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(h) = histograms.get(name) {
                h.observe(seconds);
                return;
            }
        }
        let mut histograms = self.histograms.write().unwrap_or_else(|e| e.into_inner());
        histograms
            .entry(name.to_string())
            .or_insert_with(Histogram::new)
            .observe(seconds);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests_total = self.sum_counter(REQUESTS_TOTAL, |_| true);
        let server_errors_total = self.sum_counter(REQUESTS_TOTAL, |l| {
            l.get("status").is_some_and(|s| s.starts_with('5'))
        });
        let mean_latency_ms = self
            .histograms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(REQUEST_DURATION)
            .filter(|h| h.count() > 0)
            .map(|h| h.sum_seconds() * 1000.0 / h.count() as f64)
            .unwrap_or(0.0);
        MetricsSnapshot {
            requests_total,
            server_errors_total,
            mean_latency_ms,
        }
    }

    /// Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        let mut series: Vec<_> = counters.iter().collect();
        series.sort_by(|a, b| (&a.0 .0, &a.0 .1 .0).cmp(&(&b.0 .0, &b.0 .1 .0)));
        let mut last_name = "";
        for ((name, labels), value) in series {
            if name != last_name {
                let _ = writeln!(out, "# TYPE {name} counter");
                last_name = name;
            }
            let _ = writeln!(
                out,
                "{name}{} {}",
                labels.to_prometheus(),
                value.load(Ordering::Relaxed)
            );
        }
        drop(counters);

        let histograms = self.histograms.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<_> = histograms.keys().collect();
        names.sort();
        for name in names {
            let h = &histograms[name];
            let _ = writeln!(out, "# TYPE {name} histogram");
            for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "{name}_bucket{{le=\"{bound}\"}} {}",
                    h.counts[i].load(Ordering::Relaxed)
                );
            }
            let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", h.count());
            let _ = writeln!(out, "{name}_sum {}", h.sum_seconds());
            let _ = writeln!(out, "{name}_count {}", h.count());
        }
        out
    }
}

pub const REQUESTS_TOTAL: &str = "http_requests_total";
pub const REQUEST_DURATION: &str = "http_request_duration_seconds";

static GLOBAL: OnceLock<MetricsCollector> = OnceLock::new();

/// Process-wide collector used by [`crate::middleware::metrics_middleware`].
pub fn global_metrics() -> &'static MetricsCollector {
    GLOBAL.get_or_init(MetricsCollector::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_order_independent() {
        let m = MetricsCollector::new();
        m.increment_counter("c", &[("a", "1"), ("b", "2")]);
        m.increment_counter("c", &[("b", "2"), ("a", "1")]);
        assert_eq!(m.get_counter("c", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::new();
        h.observe(0.004);
        h.observe(0.2);
        h.observe(7.0);
        assert_eq!(h.counts[0].load(Ordering::Relaxed), 1);
        assert_eq!(h.counts[5].load(Ordering::Relaxed), 2);
        assert_eq!(h.counts[9].load(Ordering::Relaxed), 2);
        assert_eq!(h.count(), 3);
    }
}
