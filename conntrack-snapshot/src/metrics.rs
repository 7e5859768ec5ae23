use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use log::debug;

/// Receives the number of raw conntrack pairs visited by a snapshot.
pub trait MetricsSink {
    fn set_conntrack_entries_count(&self, count: u64);
}

/// Sink that only logs the gauge.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn set_conntrack_entries_count(&self, count: u64) {
        debug!("conntrack entries scanned: {count}");
    }
}

/// In-memory gauge holding the last reported count.
#[derive(Debug, Default)]
pub struct Gauge {
    conntrack_entries: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conntrack_entries(&self) -> u64 {
        self.conntrack_entries.load(Ordering::Relaxed)
    }
}

impl MetricsSink for Gauge {
    fn set_conntrack_entries_count(&self, count: u64) {
        self.conntrack_entries.store(count, Ordering::Relaxed);
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for &S {
    fn set_conntrack_entries_count(&self, count: u64) {
        (**self).set_conntrack_entries_count(count)
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for Arc<S> {
    fn set_conntrack_entries_count(&self, count: u64) {
        (**self).set_conntrack_entries_count(count)
    }
}
