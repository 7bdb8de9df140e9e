//! Built-in sampling strategies.
//!
//! All three built-ins share the same skeleton: split the aggregated edge
//! frame into edges pointing back into the known network (inward) and edges
//! pointing at unseen nodes (outward), keep the inward edges verbatim, pick
//! outward edges by their own rule, and propose the picked targets as the
//! next iteration's seeds.

mod random;
mod snowball;
mod spikyball;

pub use random::RandomStrategy;
pub use snowball::SnowballStrategy;
pub use spikyball::SpikyBallStrategy;

use std::collections::HashSet;

use serde_json::json;

use crate::record::{AggregatedEdge, Frame, NodeId, Record};

/// Splits edges into (inward, outward) by whether the target is known.
pub(crate) fn partition_edges<'a>(
    edges: &'a [AggregatedEdge],
    known_nodes: &HashSet<NodeId>,
) -> (Vec<&'a AggregatedEdge>, Vec<&'a AggregatedEdge>) {
    edges
        .iter()
        .partition(|edge| known_nodes.contains(&edge.target))
}

/// Unique targets in first-occurrence order.
pub(crate) fn unique_targets(edges: &[&AggregatedEdge]) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for edge in edges {
        if seen.insert(edge.target.as_str()) {
            targets.push(edge.target.clone());
        }
    }
    targets
}

/// The subset of the node frame whose names are in `names`.
pub(crate) fn nodes_named(nodes: &Frame, names: &[NodeId]) -> Frame {
    let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
    Frame::from_rows(
        nodes
            .rows
            .iter()
            .filter(|row| row.get_str("name").map(|n| wanted.contains(n)).unwrap_or(false))
            .cloned()
            .collect(),
    )
}

/// State rows carrying one `node_id` per seed.
pub(crate) fn seed_state(seeds: &[NodeId]) -> Vec<Record> {
    seeds
        .iter()
        .map(|seed| [("node_id".to_string(), json!(seed))].into_iter().collect())
        .collect()
}
