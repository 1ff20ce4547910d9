use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Metric names recorded across the workspace.
pub mod names {
    pub const JOBS_STARTED: &str = "jobs_started_total";
    pub const JOBS_FINISHED: &str = "jobs_finished_total";
    pub const JOBS_ACTIVE: &str = "jobs_active";
    pub const TOOL_REQUESTS: &str = "tool_requests_total";
    pub const TOOL_FAILURES: &str = "tool_failures_total";
    pub const TOOL_LATENCY_MS: &str = "tool_latency_ms";
    pub const APPROVALS: &str = "approvals_total";
    pub const DEADLINES_EXPIRED: &str = "deadlines_expired_total";
    pub const UNKNOWN_CORRELATIONS: &str = "unknown_correlations_total";
    pub const SESSIONS_ACTIVE: &str = "sessions_active";
    pub const SESSIONS_TIMED_OUT: &str = "sessions_timed_out_total";
    pub const MALFORMED_MESSAGES: &str = "malformed_messages_total";
}

/// Observations kept per histogram; older ones are dropped.
const HISTOGRAM_WINDOW: usize = 4096;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    /// `name{k=v,k2=v2}`, or bare `name` without labels.
    fn render(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{}{{{}}}", self.name, labels.join(","))
    }
}

#[derive(Default)]
struct Gauge(AtomicU64);

impl Gauge {
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }
}

#[derive(Default)]
struct Histogram {
    window: Mutex<VecDeque<f64>>,
    count: AtomicU64,
}

impl Histogram {
    fn observe(&self, value: f64) {
        let mut window = self.window.lock();
        if window.len() == HISTOGRAM_WINDOW {
            window.pop_front();
        }
        window.push_back(value);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> HistogramSummary {
        let mut obs: Vec<f64> = self.window.lock().iter().copied().collect();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.total_cmp(b));
        let pick = |q: f64| obs[((obs.len() as f64 * q) as usize).min(obs.len() - 1)];
        HistogramSummary {
            count: self.count.load(Ordering::Relaxed),
            min: obs[0],
            max: obs[obs.len() - 1],
            p50: pick(0.5),
            p95: pick(0.95),
            p99: pick(0.99),
        }
    }
}

/// Percentiles are computed over the most recent observations only.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// In-process metrics registry. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, AtomicU64>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        with_entry(&self.counters, MetricKey::new(name, labels), |c| {
            c.fetch_add(n, Ordering::Relaxed);
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_entry(&self.gauges, MetricKey::new(name, labels), |g| g.set(value));
    }

    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        with_entry(&self.gauges, MetricKey::new(name, labels), |g| g.add(delta));
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_entry(&self.histograms, MetricKey::new(name, labels), |h| h.observe(value));
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&MetricKey::new(name, labels))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .read()
            .get(&MetricKey::new(name, labels))
            .map(Gauge::get)
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .read()
                .iter()
                .map(|(k, v)| (k.render(), v.load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .gauges
                .read()
                .iter()
                .map(|(k, g)| (k.render(), g.get()))
                .collect(),
            histograms: self
                .histograms
                .read()
                .iter()
                .map(|(k, h)| (k.render(), h.summary()))
                .collect(),
        }
    }
}

/// Read-lock fast path, write-lock insert on first use.
fn with_entry<V: Default>(map: &RwLock<HashMap<MetricKey, V>>, key: MetricKey, f: impl FnOnce(&V)) {
    if let Some(v) = map.read().get(&key) {
        f(v);
        return;
    }
    let mut map = map.write();
    f(map.entry(key).or_default());
}
