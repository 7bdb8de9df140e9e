//! # Seed Queue Module
//!
//! The persistent, per-layer FIFO of pending node identifiers with visit
//! status: the crawl frontier.
//!
//! ## Overview
//!
//! Seeds live in the global `seeds` table, ordered FIFO per layer by rowid.
//! Each (layer, node_id) pair exists at most once; enqueueing an identifier
//! that is `pending`, `processing`, or `done` is dropped silently, while a
//! `failed` one is resurrected to `pending` for another visit. A
//! capacity-bounded cache fronts the dedupe check so the hot path (routers
//! emitting thousands of already-known targets) rarely touches the
//! database; the unique index remains authoritative.
//!
//! Status lifecycle: `pending → processing → done | failed`. Claiming a batch
//! atomically flips `pending` rows to `processing`; a killed run leaves
//! `processing` rows behind, which [`SqliteStore::recover_processing_seeds`]
//! demotes back to `pending` on the next start.

use std::collections::HashSet;

use rusqlite::params;
use tracing::debug;

use super::{schema, SqliteStore};
use crate::error::SpiderError;
use crate::record::NodeId;

/// Visit status of a seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl SeedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeedStatus::Pending => "pending",
            SeedStatus::Processing => "processing",
            SeedStatus::Done => "done",
            SeedStatus::Failed => "failed",
        }
    }
}

fn cache_key(layer: &str, node_id: &str) -> String {
    format!("{layer}\u{1f}{node_id}")
}

impl SqliteStore {
    /// Inserts `pending` seed rows. Idempotent: identifiers already
    /// `pending`, `processing`, or `done` for the layer are dropped
    /// silently; `failed` ones go back to `pending` for another visit.
    pub fn enqueue_seeds(
        &mut self,
        layer: &str,
        ids: &[NodeId],
        iteration: i64,
    ) -> Result<usize, SpiderError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.transaction(|store| {
            let mut enqueued = 0;
            for id in ids {
                if id.is_empty() {
                    continue;
                }
                let key = cache_key(layer, id);
                if store.seed_cache().contains_key(&key) {
                    continue;
                }
                let inserted = store.conn.execute(
                    "INSERT INTO seeds (layer, node_id, iteration, status)
                     VALUES (?1, ?2, ?3, 'pending')
                     ON CONFLICT (layer, node_id) DO UPDATE SET
                         status = 'pending',
                         iteration = excluded.iteration,
                         visited_at = NULL
                     WHERE seeds.status = 'failed'",
                    params![layer, id, iteration],
                )?;
                store.seed_cache().insert(key, true);
                enqueued += inserted;
            }
            if enqueued > 0 {
                debug!("enqueued {} seeds on layer `{}` for iteration {}", enqueued, layer, iteration);
            }
            Ok(enqueued)
        })
    }

    /// Atomically transitions up to `n` pending rows to `processing` and
    /// returns them in FIFO order.
    pub fn claim_next_seed_batch(
        &mut self,
        layer: &str,
        n: usize,
    ) -> Result<Vec<NodeId>, SpiderError> {
        self.transaction(|store| {
            let mut claimed = Vec::new();
            {
                let mut stmt = store.conn.prepare_cached(
                    "SELECT node_id FROM seeds
                     WHERE layer = ?1 AND status = 'pending'
                     ORDER BY id LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![layer, n as i64])?;
                while let Some(row) = rows.next()? {
                    claimed.push(row.get::<_, String>(0)?);
                }
            }
            for id in &claimed {
                store.conn.execute(
                    "UPDATE seeds SET status = 'processing' WHERE layer = ?1 AND node_id = ?2",
                    params![layer, id],
                )?;
            }
            Ok(claimed)
        })
    }

    /// Transitions a `processing` seed to its terminal status and stamps the
    /// visit time.
    pub fn complete_seed(
        &mut self,
        layer: &str,
        id: &str,
        status: SeedStatus,
    ) -> Result<(), SpiderError> {
        self.conn.execute(
            "UPDATE seeds SET status = ?3, visited_at = ?4
             WHERE layer = ?1 AND node_id = ?2 AND status = 'processing'",
            params![layer, id, status.as_str(), super::timestamp_now()],
        )?;
        if status == SeedStatus::Failed {
            // A failed identifier must stay re-enqueueable; drop it from the
            // dedupe fast path so the next enqueue reaches the table.
            self.seed_cache.invalidate(&cache_key(layer, id));
        }
        Ok(())
    }

    /// Node identifiers with status `done` for a layer, the visited set
    /// handed to strategies.
    pub fn known_nodes(&mut self, layer: &str) -> Result<HashSet<NodeId>, SpiderError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT node_id FROM seeds WHERE layer = ?1 AND status = 'done'",
        )?;
        let mut rows = stmt.query(params![layer])?;
        let mut known = HashSet::new();
        while let Some(row) = rows.next()? {
            known.insert(row.get::<_, String>(0)?);
        }
        Ok(known)
    }

    /// Layers that currently have pending seeds, in declaration order.
    pub fn layers_with_pending(&mut self) -> Result<Vec<String>, SpiderError> {
        let layers: Vec<String> = self.layers.keys().cloned().collect();
        let mut with_pending = Vec::new();
        for layer in layers {
            if self.count_pending(&layer)? > 0 {
                with_pending.push(layer);
            }
        }
        Ok(with_pending)
    }

    pub fn count_pending(&mut self, layer: &str) -> Result<i64, SpiderError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM seeds WHERE layer = ?1 AND status = 'pending'",
            params![layer],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Pending seeds scheduled for a given iteration, across all layers.
    pub fn count_pending_at(&mut self, iteration: i64) -> Result<i64, SpiderError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM seeds WHERE status = 'pending' AND iteration = ?1",
            params![iteration],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Demotes seeds a killed run left in `processing` back to `pending`.
    pub fn recover_processing_seeds(&mut self) -> Result<usize, SpiderError> {
        let demoted = self.conn.execute(
            "UPDATE seeds SET status = 'pending' WHERE status = 'processing'",
            [],
        )?;
        if demoted > 0 {
            debug!("recovered {} seeds from an interrupted run", demoted);
        }
        Ok(demoted)
    }

    /// Gives stalled work one more chance: `done` seeds that never produced a
    /// raw edge go back to `pending`, and dense nodes that were observed but
    /// never enqueued become fresh seeds for the next iteration.
    pub fn reschedule_stale_seeds(&mut self, next_iteration: i64) -> Result<usize, SpiderError> {
        let layers: Vec<String> = self
            .layers
            .keys()
            .filter(|layer| self.ready_layers.contains(*layer))
            .cloned()
            .collect();
        self.transaction(|store| {
            let mut rescheduled = 0;
            for layer in &layers {
                let raw = schema::raw_edges_table(layer);
                let nodes = schema::nodes_table(layer);
                rescheduled += store.conn.execute(
                    &format!(
                        r#"UPDATE seeds SET status = 'pending', iteration = ?2
                           WHERE layer = ?1 AND status = 'done'
                             AND NOT EXISTS (
                                 SELECT 1 FROM "{raw}" WHERE source = seeds.node_id
                             )"#
                    ),
                    params![layer, next_iteration],
                )?;
                rescheduled += store.conn.execute(
                    &format!(
                        r#"INSERT INTO seeds (layer, node_id, iteration, status)
                           SELECT ?1, name, ?2, 'pending' FROM "{nodes}"
                           WHERE name NOT IN (SELECT node_id FROM seeds WHERE layer = ?1)"#
                    ),
                    params![layer, next_iteration],
                )?;
            }
            Ok(rescheduled)
        })
    }
}
