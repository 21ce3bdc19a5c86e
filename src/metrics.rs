//! Process-global metrics for the host controller
//!
//! A small hand-rolled registry: counters and per-label histograms backed by
//! atomics and locks, rendered in Prometheus text format by [`render`] for
//! the `/metrics` endpoint. All instruments are safe for concurrent use
//! across reconcile workers.

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// A monotonically increasing counter without labels
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// A counter family keyed by a fixed set of label names
pub struct CounterVec {
    name: &'static str,
    help: &'static str,
    labels: &'static [&'static str],
    series: RwLock<BTreeMap<Vec<String>, u64>>,
}

impl CounterVec {
    fn new(name: &'static str, help: &'static str, labels: &'static [&'static str]) -> Self {
        Self {
            name,
            help,
            labels,
            series: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn inc(&self, label_values: &[&str]) {
        debug_assert_eq!(label_values.len(), self.labels.len());
        let key: Vec<String> = label_values.iter().map(|v| v.to_string()).collect();
        let mut series = self.series.write().expect("metrics lock poisoned");
        *series.entry(key).or_insert(0) += 1;
    }

    pub fn get(&self, label_values: &[&str]) -> u64 {
        let key: Vec<String> = label_values.iter().map(|v| v.to_string()).collect();
        let series = self.series.read().expect("metrics lock poisoned");
        series.get(&key).copied().unwrap_or(0)
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);
        let series = self.series.read().expect("metrics lock poisoned");
        for (key, value) in series.iter() {
            let labels = self
                .labels
                .iter()
                .zip(key)
                .map(|(name, val)| format!("{name}=\"{val}\""))
                .collect::<Vec<_>>()
                .join(",");
            let _ = writeln!(out, "{}{{{labels}}} {value}", self.name);
        }
    }
}

#[derive(Default, Clone, Copy)]
struct HistogramData {
    count: u64,
    sum: f64,
}

/// A histogram family with a single label, tracking count and sum
pub struct HistogramVec {
    name: &'static str,
    help: &'static str,
    label: &'static str,
    series: RwLock<BTreeMap<String, HistogramData>>,
}

impl HistogramVec {
    fn new(name: &'static str, help: &'static str, label: &'static str) -> Self {
        Self {
            name,
            help,
            label,
            series: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn observe(&self, label_value: &str, value: f64) {
        let mut series = self.series.write().expect("metrics lock poisoned");
        let data = series.entry(label_value.to_string()).or_default();
        data.count += 1;
        data.sum += value;
    }

    pub fn count(&self, label_value: &str) -> u64 {
        let series = self.series.read().expect("metrics lock poisoned");
        series.get(label_value).map(|d| d.count).unwrap_or(0)
    }

    pub fn sum(&self, label_value: &str) -> f64 {
        let series = self.series.read().expect("metrics lock poisoned");
        series.get(label_value).map(|d| d.sum).unwrap_or(0.0)
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} histogram", self.name);
        let series = self.series.read().expect("metrics lock poisoned");
        for (key, data) in series.iter() {
            let _ = writeln!(
                out,
                "{}_count{{{}=\"{key}\"}} {}",
                self.name, self.label, data.count
            );
            let _ = writeln!(
                out,
                "{}_sum{{{}=\"{key}\"}} {}",
                self.name, self.label, data.sum
            );
        }
    }
}

/// Hosts discovered without BMC details
pub static HOST_UNMANAGED: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "hostforge_host_unmanaged_total",
        "Number of hosts discovered without BMC details",
    )
});

/// Reconciles where registration work preempted the state handler
pub static HOST_REGISTRATION_REQUIRED: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "hostforge_host_registration_required_total",
        "Number of reconciles where the host needed to be registered",
    )
});

/// Hosts deleted after the backend gave up deprovisioning them
pub static DELETE_WITHOUT_DEPROVISION: Lazy<Counter> = Lazy::new(|| {
    Counter::new(
        "hostforge_delete_without_deprovisioning_total",
        "Number of hosts deleted without waiting for deprovisioning",
    )
});

/// Provisioning state transitions, labeled by the old and new state
pub static STATE_CHANGES: Lazy<CounterVec> = Lazy::new(|| {
    CounterVec::new(
        "hostforge_state_change_total",
        "Number of provisioning state changes",
        &["from", "to"],
    )
});

/// Time spent in each provisioning state
pub static STATE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        "hostforge_state_duration_seconds",
        "Seconds spent in each provisioning state",
        "state",
    )
});

/// Render every instrument in Prometheus text exposition format
pub fn render() -> String {
    let mut out = String::new();
    HOST_UNMANAGED.render(&mut out);
    HOST_REGISTRATION_REQUIRED.render(&mut out);
    DELETE_WITHOUT_DEPROVISION.render(&mut out);
    STATE_CHANGES.render(&mut out);
    STATE_DURATION.render(&mut out);
    out
}
