//! # Spider Module
//!
//! The iteration controller: a state machine driving the crawl through
//! `idle → starting → gathering → sampling → (gathering | retrying |
//! stopping)` until the iteration budget is reached or the frontier stays
//! empty.
//!
//! ## Overview
//!
//! One iteration is a (gather, sample) pair. Gathering claims seed batches
//! in round-robin over the layers with pending work, dispatches the
//! connector calls concurrently onto tasks, and funnels the routed results
//! through a channel into the single store writer, one transaction per
//! batch. Sampling aggregates each touched layer's raw edges, invokes its
//! strategy, persists the sampled rows, and enqueues the proposed seeds for
//! the next iteration. Every phase transition writes the singleton
//! `app_state` row, which is what makes a killed run resumable.
//!
//! ## Cancellation
//!
//! A Ctrl-C latches an atomic flag that is checked between batches and
//! between phases. In-flight work is rolled back, the state row stays at the
//! last committed iteration, and the next start resumes from there.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::aggregate::Aggregator;
use crate::config::{Configuration, EmptySeedPolicy, SeedSpec};
use crate::error::{backoff_delay, SpiderError, RETRY_ATTEMPTS};
use crate::plugin::{ConnectorAdapter, StrategyAdapter};
use crate::record::{Frame, NodeId, RawEdge};
use crate::stats::StatCollector;
use crate::store::seeds::SeedStatus;
use crate::store::SqliteStore;

/// The controller's phases, persisted on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Gathering,
    Sampling,
    Retrying,
    Stopping,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::Gathering => "gathering",
            Phase::Sampling => "sampling",
            Phase::Retrying => "retrying",
            Phase::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type BatchResult = Result<(Vec<RawEdge>, Frame), SpiderError>;

/// This is spiderexpress' spider. With this animal we traverse the deserts
/// of social media networks.
pub struct Spider {
    configuration: Configuration,
    store: SqliteStore,
    connectors: BTreeMap<String, Arc<ConnectorAdapter>>,
    strategies: BTreeMap<String, StrategyAdapter>,
    aggregator: Aggregator,
    stats: Arc<StatCollector>,
    cancelled: Arc<AtomicBool>,
    phase: Phase,
    iteration: i64,
    retry_count: u32,
    max_concurrent_batches: usize,
    channel_capacity: usize,
}

impl std::fmt::Debug for Spider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spider").field("phase", &self.phase).finish()
    }
}

impl Spider {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        configuration: Configuration,
        store: SqliteStore,
        connectors: BTreeMap<String, Arc<ConnectorAdapter>>,
        strategies: BTreeMap<String, StrategyAdapter>,
        aggregator: Aggregator,
        stats: Arc<StatCollector>,
        max_concurrent_batches: usize,
        channel_capacity: usize,
    ) -> Self {
        Spider {
            configuration,
            store,
            connectors,
            strategies,
            aggregator,
            stats,
            cancelled: Arc::new(AtomicBool::new(false)),
            phase: Phase::Idle,
            iteration: 0,
            retry_count: 0,
            max_concurrent_batches,
            channel_capacity,
        }
    }

    /// A handle that latches cancellation when flipped to `true`.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn stats(&self) -> Arc<StatCollector> {
        self.stats.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Runs the crawl to its terminal state and returns the collected
    /// statistics. Cancellation is a clean exit, not an error.
    pub async fn run(mut self) -> Result<Arc<StatCollector>, SpiderError> {
        let cancelled = self.cancelled.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("cancellation signal received, winding down");
                cancelled.store(true, Ordering::SeqCst);
            }
        });

        info!(
            "starting project `{}` with {} layers, max_iteration {}",
            self.configuration.project_name,
            self.configuration.layers.len(),
            self.configuration.max_iteration
        );

        loop {
            if self.is_cancelled() && self.phase != Phase::Stopping {
                warn!("run cancelled, rolling back in-flight work");
                self.store.rollback();
                self.transition(Phase::Stopping)?;
            }
            match self.phase {
                Phase::Idle => {
                    // Configuration was validated at build time.
                    self.transition(Phase::Starting)?;
                }
                Phase::Starting => {
                    self.enter_starting()?;
                    self.transition(Phase::Gathering)?;
                }
                Phase::Gathering => {
                    let next = self.enter_gathering().await?;
                    self.transition(next)?;
                }
                Phase::Sampling => {
                    let next = self.enter_sampling()?;
                    self.transition(next)?;
                }
                Phase::Retrying => {
                    let next = self.enter_retrying().await?;
                    self.transition(next)?;
                }
                Phase::Stopping => {
                    self.log_layer_summaries();
                    info!("stopping at iteration {}. See you next time.", self.iteration);
                    break;
                }
            }
        }

        info!("{}", self.stats);
        Ok(self.stats)
    }

    /// Logs the sparse view of every layer that saw data this run.
    fn log_layer_summaries(&mut self) {
        let layers: Vec<String> = self.configuration.layers.keys().cloned().collect();
        for layer in layers {
            if !self.store.layer_is_ready(&layer) {
                continue;
            }
            match self.store.read_layer_frame(&layer) {
                Ok((edges, nodes)) => info!(
                    "layer `{}`: {} sampled edges, {} sampled nodes",
                    layer,
                    edges.len(),
                    nodes.len()
                ),
                Err(err) => warn!("cannot summarize layer `{}`: {}", layer, err),
            }
        }
    }

    /// Every phase transition persists the state row atomically.
    fn transition(&mut self, next: Phase) -> Result<(), SpiderError> {
        debug!("phase {} -> {}", self.phase, next);
        self.phase = next;
        self.store.save_state(
            self.iteration,
            self.configuration.max_iteration,
            next.as_str(),
        )
    }

    /// Recovers interrupted work and bootstraps the seed queue.
    fn enter_starting(&mut self) -> Result<(), SpiderError> {
        self.store.recover_processing_seeds()?;

        if let Some(state) = self.store.load_state()? {
            self.iteration = state.iteration;
            info!(
                "resuming at iteration {} (previous phase `{}`)",
                state.iteration, state.phase
            );
        }

        let flat = self.configuration.seed_file.is_some()
            || matches!(self.configuration.seeds, Some(SeedSpec::Flat(_)));
        if flat && self.configuration.empty_seeds_policy() == EmptySeedPolicy::Stop {
            warn!("seed list names no layer and empty_seeds is `stop`; nothing bootstrapped");
            return Ok(());
        }

        let resolved = self.configuration.resolve_seeds()?;
        for (layer, ids) in resolved {
            let enqueued = self.store.enqueue_seeds(&layer, &ids, 0)?;
            self.stats.add_seeds_enqueued(enqueued);
        }
        Ok(())
    }

    /// Claims batches round-robin over layers with pending seeds, dispatches
    /// connector calls concurrently, and persists results serially.
    async fn enter_gathering(&mut self) -> Result<Phase, SpiderError> {
        loop {
            if self.is_cancelled() {
                return Ok(Phase::Stopping);
            }
            let layers = self.store.layers_with_pending()?;
            if layers.is_empty() {
                return Ok(Phase::Sampling);
            }

            let (tx, rx) = kanal::bounded_async::<(String, Vec<NodeId>, BatchResult)>(
                self.channel_capacity,
            );
            let mut dispatched = 0usize;
            for layer in layers.into_iter().take(self.max_concurrent_batches) {
                let batch = self
                    .store
                    .claim_next_seed_batch(&layer, self.configuration.batch_size)?;
                if batch.is_empty() {
                    continue;
                }
                debug!(
                    "iteration {}: gathering {} seeds on layer `{}`",
                    self.iteration,
                    batch.len(),
                    layer
                );
                self.stats.add_seeds_claimed(batch.len());
                self.stats.increment_batches_dispatched();
                let adapter = self.connectors[&layer].clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = adapter.fetch_batch(&batch).await;
                    let _ = tx.send((adapter.layer().to_string(), batch, result)).await;
                });
                dispatched += 1;
            }
            drop(tx);

            let mut remaining = dispatched;
            while remaining > 0 {
                if self.is_cancelled() {
                    // The in-flight batches stay unpersisted; their seeds are
                    // still `processing` and recover to `pending` next start.
                    return Ok(Phase::Stopping);
                }
                match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
                    Ok(Ok((layer, batch, result))) => {
                        remaining -= 1;
                        self.persist_batch(&layer, &batch, result).await?;
                    }
                    Ok(Err(_)) => break,
                    // Timed out: re-check the cancellation latch.
                    Err(_) => continue,
                }
            }

            if self.configuration.random_wait {
                let base = self.configuration.wait_base_seconds.max(0.0);
                let delay = rand::thread_rng().gen_range(0.0..=(2.0 * base));
                debug!("random wait: {:.2}s before next batch round", delay);
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }
    }

    /// Persists one batch in its own transaction, or marks its seeds failed.
    async fn persist_batch(
        &mut self,
        layer: &str,
        batch: &[NodeId],
        result: BatchResult,
    ) -> Result<(), SpiderError> {
        match result {
            Ok((edges, nodes)) => {
                let eager = self
                    .configuration
                    .layers
                    .get(layer)
                    .map(|l| l.eager)
                    .unwrap_or(false);
                let iteration = self.iteration;

                let mut attempt = 0;
                loop {
                    let outcome = self.store.transaction(|store| {
                        store.append_raw_edges(&edges, iteration)?;
                        store.upsert_nodes(layer, &nodes, iteration, false)?;
                        for edge in &edges {
                            if edge.dispatched || eager {
                                store.enqueue_seeds(
                                    &edge.layer,
                                    std::slice::from_ref(&edge.target),
                                    iteration,
                                )?;
                            }
                        }
                        for id in batch {
                            store.complete_seed(layer, id, SeedStatus::Done)?;
                        }
                        Ok(())
                    });
                    match outcome {
                        Ok(()) => break,
                        Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                            let delay = backoff_delay(attempt);
                            warn!(
                                "store write for layer `{}` failed (attempt {}/{}), backing off {:?}: {}",
                                layer,
                                attempt + 1,
                                RETRY_ATTEMPTS + 1,
                                delay,
                                err
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        // Exhausted store retries abort the whole run; the
                        // state row stays at the last committed iteration.
                        Err(err) => return Err(err),
                    }
                }

                for edge in &edges {
                    self.stats.add_edges_raw(&edge.layer, 1);
                }
                self.stats.add_nodes_upserted(nodes.len());
                self.stats.add_seeds_done(batch.len());
            }
            Err(err @ SpiderError::Config { .. }) => return Err(err),
            Err(err) => {
                warn!(
                    "layer `{}` iteration {}: batch of {} seeds failed: {}",
                    layer,
                    self.iteration,
                    batch.len(),
                    err
                );
                self.store.transaction(|store| {
                    for id in batch {
                        store.complete_seed(layer, id, SeedStatus::Failed)?;
                    }
                    Ok(())
                })?;
                self.stats.increment_batches_failed();
                self.stats.add_seeds_failed(batch.len());
            }
        }
        Ok(())
    }

    /// Aggregates and samples every layer touched this iteration, then
    /// decides where the machine goes next.
    fn enter_sampling(&mut self) -> Result<Phase, SpiderError> {
        let touched = self.store.touched_layers(self.iteration)?;
        for layer in &touched {
            let outcome = self.sample_layer(layer);
            match outcome {
                Ok(()) => {}
                Err(err @ (SpiderError::Plugin { .. } | SpiderError::Data(_))) => {
                    // Fatal for this iteration only; the retry path gives the
                    // layer another chance.
                    error!("sampling layer `{}` failed: {}", layer, err);
                }
                Err(err) => return Err(err),
            }
        }

        // The (gather, sample) pair is complete.
        self.iteration += 1;
        self.stats.increment_iterations();

        if self.iteration >= self.configuration.max_iteration {
            info!("iteration budget of {} reached", self.configuration.max_iteration);
            return Ok(Phase::Stopping);
        }
        let upcoming = self.store.count_pending_at(self.iteration)?;
        if upcoming > 0 {
            debug!("{} seeds pending for iteration {}", upcoming, self.iteration);
            self.retry_count = 0;
            return Ok(Phase::Gathering);
        }
        warn!("strategies produced no new seeds");
        if self.configuration.empty_seeds_policy() == EmptySeedPolicy::Stop {
            return Ok(Phase::Stopping);
        }
        if self.retry_count < RETRY_ATTEMPTS {
            return Ok(Phase::Retrying);
        }
        Ok(Phase::Stopping)
    }

    fn sample_layer(&mut self, layer: &str) -> Result<(), SpiderError> {
        let adapter = self.strategies.get(layer).ok_or_else(|| {
            SpiderError::config(format!("layers.{layer}.sampler"), "layer has no sampler bound")
        })?;

        let edges = self.aggregator.aggregate(&mut self.store, layer)?;
        let nodes = self.store.read_node_frame(layer)?;
        let known_nodes = self.store.known_nodes(layer)?;
        let state = self
            .store
            .read_strategy_state(layer, adapter.strategy_name())?;

        debug!(
            "sampling layer `{}`: {} aggregated edges, {} nodes, {} known",
            layer,
            edges.len(),
            nodes.len(),
            known_nodes.len()
        );

        let outcome = adapter.sample(&edges, &nodes, &known_nodes, &state, self.iteration)?;

        let iteration = self.iteration;
        let next_iteration = iteration + 1;
        let strategy_name = adapter.strategy_name().to_string();
        let enqueued = self.store.transaction(|store| {
            store.upsert_aggregated_edges(layer, &outcome.sampled_edges, iteration)?;
            store.upsert_nodes(layer, &outcome.sampled_nodes, iteration, true)?;
            store.replace_strategy_state(layer, &strategy_name, &outcome.new_state)?;
            store.enqueue_seeds(layer, &outcome.new_seeds, next_iteration)
        })?;

        self.stats.add_edges_sampled(outcome.sampled_edges.len());
        self.stats.add_seeds_enqueued(enqueued);
        Ok(())
    }

    /// Bounded retry: sleep the backoff, then give stalled seeds one more
    /// chance before gathering again.
    async fn enter_retrying(&mut self) -> Result<Phase, SpiderError> {
        self.retry_count += 1;
        self.stats.increment_retries();
        if self.retry_count > RETRY_ATTEMPTS {
            return Ok(Phase::Stopping);
        }
        let delay = backoff_delay(self.retry_count - 1);
        info!(
            "retry {}/{} in {:?}: rescheduling stale seeds",
            self.retry_count, RETRY_ATTEMPTS, delay
        );
        tokio::time::sleep(delay).await;

        let rescheduled = self.store.reschedule_stale_seeds(self.iteration)?;
        info!("rescheduled {} seeds", rescheduled);
        Ok(Phase::Gathering)
    }
}
