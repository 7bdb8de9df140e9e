//! Exhaustive snowball sampling.

use serde_json::Value;

use super::{nodes_named, partition_edges, seed_state, unique_targets};
use crate::error::SpiderError;
use crate::plugin::{Strategy, StrategyInput, StrategyOutcome};

/// Follows every outward edge. `layer_max_size`, when configured, caps the
/// number of new targets per invocation (first-occurrence order).
pub struct SnowballStrategy;

impl Strategy for SnowballStrategy {
    fn name(&self) -> &'static str {
        "snowball"
    }

    fn sample(&self, input: StrategyInput<'_>) -> Result<StrategyOutcome, SpiderError> {
        let layer_max_size = input
            .configuration
            .get("layer_max_size")
            .and_then(Value::as_u64)
            .map(|cap| cap as usize);

        let (inward, outward) = partition_edges(input.edges, input.known_nodes);

        let mut new_seeds = unique_targets(&outward);
        if let Some(cap) = layer_max_size {
            new_seeds.truncate(cap);
        }
        let kept: std::collections::HashSet<&str> =
            new_seeds.iter().map(String::as_str).collect();
        let sampled_outward: Vec<_> = outward
            .into_iter()
            .filter(|edge| kept.contains(edge.target.as_str()))
            .collect();

        let sampled_nodes = nodes_named(input.nodes, &new_seeds);
        let sampled_edges = inward
            .into_iter()
            .chain(sampled_outward)
            .cloned()
            .collect();

        Ok(StrategyOutcome {
            new_state: seed_state(&new_seeds),
            new_seeds,
            sampled_edges,
            sampled_nodes,
        })
    }
}
