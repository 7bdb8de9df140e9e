//! # Statistics Module
//!
//! Collects and stores various metrics about the crawl.
//!
//! ## Overview
//!
//! The `StatCollector` tracks seed-queue movement, connector batches, routed
//! edges, and sampling output throughout the crawl. The data is essential for
//! monitoring progress on long-running collections and for diagnosing layers
//! that stop producing seeds.
//!
//! ## Features
//!
//! - **Thread-safe**: atomic counters, updated from the gather fan-out
//! - **Per-layer breakdown**: raw edge counts keyed by layer
//! - **Export**: JSON for machines, `Display` for the closing log line

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::error::SpiderError;

// A snapshot of the current statistics, used for reporting. Keeps the
// presentation paths free of load-ordering concerns.
struct StatsSnapshot {
    seeds_enqueued: usize,
    seeds_claimed: usize,
    seeds_done: usize,
    seeds_failed: usize,
    batches_dispatched: usize,
    batches_failed: usize,
    edges_raw: usize,
    edges_sampled: usize,
    nodes_upserted: usize,
    retries: usize,
    iterations: usize,
    layer_edge_counts: HashMap<String, usize>,
    elapsed_duration: Duration,
}

impl StatsSnapshot {
    fn seeds_per_second(&self) -> f64 {
        let total_seconds = self.elapsed_duration.as_secs();
        if total_seconds > 0 {
            self.seeds_done as f64 / total_seconds as f64
        } else {
            0.0
        }
    }
}

/// Collects and stores various statistics about the crawl.
#[derive(Debug, serde::Serialize)]
pub struct StatCollector {
    #[serde(skip)]
    start_time: Instant,

    // Seed-queue metrics
    pub seeds_enqueued: AtomicUsize,
    pub seeds_claimed: AtomicUsize,
    pub seeds_done: AtomicUsize,
    pub seeds_failed: AtomicUsize,

    // Connector metrics
    pub batches_dispatched: AtomicUsize,
    pub batches_failed: AtomicUsize,

    // Graph metrics
    pub edges_raw: AtomicUsize,
    pub edges_sampled: AtomicUsize,
    pub nodes_upserted: AtomicUsize,
    #[serde(skip)]
    pub layer_edge_counts: Arc<dashmap::DashMap<String, usize>>,

    // Controller metrics
    pub retries: AtomicUsize,
    pub iterations: AtomicUsize,
}

impl StatCollector {
    pub(crate) fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            seeds_enqueued: AtomicUsize::new(0),
            seeds_claimed: AtomicUsize::new(0),
            seeds_done: AtomicUsize::new(0),
            seeds_failed: AtomicUsize::new(0),
            batches_dispatched: AtomicUsize::new(0),
            batches_failed: AtomicUsize::new(0),
            edges_raw: AtomicUsize::new(0),
            edges_sampled: AtomicUsize::new(0),
            nodes_upserted: AtomicUsize::new(0),
            layer_edge_counts: Arc::new(dashmap::DashMap::new()),
            retries: AtomicUsize::new(0),
            iterations: AtomicUsize::new(0),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let mut layer_counts = HashMap::new();
        for entry in self.layer_edge_counts.iter() {
            let (key, value) = entry.pair();
            layer_counts.insert(key.clone(), *value);
        }

        StatsSnapshot {
            seeds_enqueued: self.seeds_enqueued.load(Ordering::SeqCst),
            seeds_claimed: self.seeds_claimed.load(Ordering::SeqCst),
            seeds_done: self.seeds_done.load(Ordering::SeqCst),
            seeds_failed: self.seeds_failed.load(Ordering::SeqCst),
            batches_dispatched: self.batches_dispatched.load(Ordering::SeqCst),
            batches_failed: self.batches_failed.load(Ordering::SeqCst),
            edges_raw: self.edges_raw.load(Ordering::SeqCst),
            edges_sampled: self.edges_sampled.load(Ordering::SeqCst),
            nodes_upserted: self.nodes_upserted.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
            iterations: self.iterations.load(Ordering::SeqCst),
            layer_edge_counts: layer_counts,
            elapsed_duration: self.start_time.elapsed(),
        }
    }

    pub(crate) fn add_seeds_enqueued(&self, count: usize) {
        self.seeds_enqueued.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn add_seeds_claimed(&self, count: usize) {
        self.seeds_claimed.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn add_seeds_done(&self, count: usize) {
        self.seeds_done.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn add_seeds_failed(&self, count: usize) {
        self.seeds_failed.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn increment_batches_dispatched(&self) {
        self.batches_dispatched.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_batches_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn add_edges_raw(&self, layer: &str, count: usize) {
        self.edges_raw.fetch_add(count, Ordering::SeqCst);
        *self.layer_edge_counts.entry(layer.to_string()).or_insert(0) += count;
    }

    pub(crate) fn add_edges_sampled(&self, count: usize) {
        self.edges_sampled.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn add_nodes_upserted(&self, count: usize) {
        self.nodes_upserted.fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn increment_retries(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_iterations(&self) {
        self.iterations.fetch_add(1, Ordering::SeqCst);
    }

    /// Converts the counters into a JSON string.
    pub fn to_json_string(&self) -> Result<String, SpiderError> {
        serde_json::to_string(self).map_err(|err| SpiderError::Data(err.to_string()))
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();

        writeln!(f, "\nCrawl Statistics")?;
        writeln!(f, "----------------")?;
        writeln!(f, "  duration : {:?}", snapshot.elapsed_duration)?;
        writeln!(
            f,
            "  speed    : {:.2} seeds/s over {} iterations",
            snapshot.seeds_per_second(),
            snapshot.iterations
        )?;
        writeln!(
            f,
            "  seeds    : enqueued: {}, claimed: {}, done: {}, failed: {}",
            snapshot.seeds_enqueued,
            snapshot.seeds_claimed,
            snapshot.seeds_done,
            snapshot.seeds_failed
        )?;
        writeln!(
            f,
            "  batches  : dispatched: {}, failed: {}, retries: {}",
            snapshot.batches_dispatched, snapshot.batches_failed, snapshot.retries
        )?;
        writeln!(
            f,
            "  graph    : raw edges: {}, sampled edges: {}, nodes: {}",
            snapshot.edges_raw, snapshot.edges_sampled, snapshot.nodes_upserted
        )?;

        let layer_string = if snapshot.layer_edge_counts.is_empty() {
            "none".to_string()
        } else {
            let mut entries: Vec<_> = snapshot.layer_edge_counts.into_iter().collect();
            entries.sort();
            entries
                .iter()
                .map(|(layer, count)| format!("{layer}: {count}"))
                .collect::<Vec<String>>()
                .join(", ")
        };

        writeln!(f, "  layers   : {layer_string}\n")
    }
}
