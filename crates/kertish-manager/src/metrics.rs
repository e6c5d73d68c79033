use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Cluster;

/// Last observed value of a count or byte total.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Monotonic event count.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

const BUCKET_BOUNDARIES_MS: &[u64] = &[10, 100, 1_000, 10_000, 60_000, 600_000];

/// Duration histogram in milliseconds.
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: (0..=BUCKET_BOUNDARIES_MS.len())
                .map(|_| AtomicU64::new(0))
                .collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        let idx = BUCKET_BOUNDARIES_MS
            .iter()
            .position(|b| ms <= *b)
            .unwrap_or(BUCKET_BOUNDARIES_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn bucket_count(&self, idx: usize) -> u64 {
        self.buckets
            .get(idx)
            .map_or(0, |b| b.load(Ordering::Relaxed))
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String, name: &str) {
        let _ = writeln!(out, "# TYPE {name} histogram");
        let mut cumulative = 0;
        for (i, boundary) in BUCKET_BOUNDARIES_MS.iter().enumerate() {
            cumulative += self.bucket_count(i);
            let _ = writeln!(out, "{name}_bucket{{le=\"{boundary}\"}} {cumulative}");
        }
        cumulative += self.bucket_count(BUCKET_BOUNDARIES_MS.len());
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
        let _ = writeln!(out, "{name}_sum {}", self.sum());
        let _ = writeln!(out, "{name}_count {}\n", self.count());
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Manager-wide counters and gauges, rendered at `/metrics`.
#[derive(Default)]
pub struct ManagerMetrics {
    pub clusters_total: Gauge,
    pub clusters_paralyzed: Gauge,
    pub clusters_frozen: Gauge,
    pub nodes_total: Gauge,
    pub nodes_unreachable: Gauge,
    pub capacity_total_bytes: Gauge,
    pub capacity_used_bytes: Gauge,

    pub failovers_total: Counter,
    pub syncs_total: Counter,
    pub sync_failures_total: Counter,
    pub sync_duration_ms: Histogram,

    pub replication_jobs_total: Counter,
    pub replication_retries_total: Counter,
    pub replication_abandoned_total: Counter,

    pub reservations_total: Counter,
    pub chunk_moves_total: Counter,
    pub chunk_move_failures_total: Counter,

    pub repairs_total: Counter,
    pub orphans_deleted_total: Counter,
    pub zombies_total: Counter,
}

impl ManagerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refreshes the cluster gauges from registry records.
    pub fn observe_clusters(&self, clusters: &[Cluster]) {
        let count = |pred: fn(&Cluster) -> bool| clusters.iter().filter(|c| pred(c)).count() as u64;
        let nodes = clusters.iter().flat_map(|c| c.nodes.iter());
        self.clusters_total.set(clusters.len() as u64);
        self.clusters_paralyzed.set(count(|c| c.paralyzed));
        self.clusters_frozen.set(count(|c| c.frozen));
        self.nodes_total.set(nodes.clone().count() as u64);
        self.nodes_unreachable
            .set(nodes.filter(|n| !n.is_reachable()).count() as u64);
        self.capacity_total_bytes
            .set(clusters.iter().map(|c| c.size).sum());
        self.capacity_used_bytes
            .set(clusters.iter().map(|c| c.used).sum());
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        let gauges = [
            ("kertish_clusters", &self.clusters_total),
            ("kertish_clusters_paralyzed", &self.clusters_paralyzed),
            ("kertish_clusters_frozen", &self.clusters_frozen),
            ("kertish_nodes", &self.nodes_total),
            ("kertish_nodes_unreachable", &self.nodes_unreachable),
            ("kertish_capacity_total_bytes", &self.capacity_total_bytes),
            ("kertish_capacity_used_bytes", &self.capacity_used_bytes),
        ];
        for (name, gauge) in gauges {
            let _ = writeln!(out, "# TYPE {name} gauge\n{name} {}\n", gauge.get());
        }

        let counters = [
            ("kertish_failovers_total", &self.failovers_total),
            ("kertish_syncs_total", &self.syncs_total),
            ("kertish_sync_failures_total", &self.sync_failures_total),
            ("kertish_replication_jobs_total", &self.replication_jobs_total),
            ("kertish_replication_retries_total", &self.replication_retries_total),
            ("kertish_replication_abandoned_total", &self.replication_abandoned_total),
            ("kertish_reservations_total", &self.reservations_total),
            ("kertish_chunk_moves_total", &self.chunk_moves_total),
            ("kertish_chunk_move_failures_total", &self.chunk_move_failures_total),
            ("kertish_repairs_total", &self.repairs_total),
            ("kertish_orphans_deleted_total", &self.orphans_deleted_total),
            ("kertish_zombies_total", &self.zombies_total),
        ];
        for (name, counter) in counters {
            let _ = writeln!(out, "# TYPE {name} counter\n{name} {}\n", counter.get());
        }

        self.sync_duration_ms
            .render(&mut out, "kertish_sync_duration_ms");
        out
    }
}
