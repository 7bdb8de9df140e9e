//! Uniform random edge sampling.

use serde_json::{json, Value};

use super::{nodes_named, partition_edges, seed_state, unique_targets};
use crate::error::SpiderError;
use crate::plugin::{Strategy, StrategyInput, StrategyOutcome};

/// Keeps inward edges verbatim and follows up to `n` outward edges drawn
/// uniformly without replacement.
pub struct RandomStrategy;

impl Strategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn default_configuration(&self) -> Value {
        json!({ "n": 10 })
    }

    fn sample(&self, input: StrategyInput<'_>) -> Result<StrategyOutcome, SpiderError> {
        let n = input
            .configuration
            .get("n")
            .and_then(Value::as_u64)
            .unwrap_or(10) as usize;

        let (inward, outward) = partition_edges(input.edges, input.known_nodes);

        let sampled_outward: Vec<_> = if outward.len() <= n {
            outward
        } else {
            let mut picked = rand::seq::index::sample(input.rng, outward.len(), n).into_vec();
            picked.sort_unstable();
            picked.into_iter().map(|index| outward[index]).collect()
        };

        let new_seeds = unique_targets(&sampled_outward);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AggregatedEdge, Frame};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn edge(source: &str, target: &str) -> AggregatedEdge {
        AggregatedEdge {
            layer: "posts".into(),
            source: source.into(),
            target: target.into(),
            weight: 1,
            columns: Default::default(),
        }
    }

    #[test]
    fn samples_n_outward_edges_and_keeps_inward() {
        let edges = vec![edge("a", "b"), edge("a", "c"), edge("a", "d"), edge("b", "a")];
        let known = HashSet::from(["a".to_string()]);
        let nodes = Frame::new();
        let mut rng = StdRng::seed_from_u64(7);
        let outcome = RandomStrategy
            .sample(StrategyInput {
                edges: &edges,
                nodes: &nodes,
                known_nodes: &known,
                state: &[],
                configuration: &json!({"n": 2}),
                rng: &mut rng,
            })
            .unwrap();
        // 1 inward edge (b→a) kept verbatim, 2 of 3 outward sampled.
        assert_eq!(outcome.sampled_edges.len(), 3);
        assert_eq!(outcome.new_seeds.len(), 2);
        for seed in &outcome.new_seeds {
            assert!(["b", "c", "d"].contains(&seed.as_str()));
        }
    }

    #[test]
    fn keeps_everything_when_outward_fits_n() {
        let edges = vec![edge("a", "b"), edge("a", "c")];
        let known = HashSet::from(["a".to_string()]);
        let mut rng = StdRng::seed_from_u64(7);
        let outcome = RandomStrategy
            .sample(StrategyInput {
                edges: &edges,
                nodes: &Frame::new(),
                known_nodes: &known,
                state: &[],
                configuration: &json!({"n": 10}),
                rng: &mut rng,
            })
            .unwrap();
        assert_eq!(outcome.sampled_edges.len(), 2);
        assert_eq!(outcome.new_seeds, vec!["b", "c"]);
    }

    #[test]
    fn seeded_rng_makes_sampling_reproducible() {
        let edges: Vec<_> = (0..20).map(|i| edge("a", &format!("n{i}"))).collect();
        let known = HashSet::from(["a".to_string()]);
        let draw = |seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            RandomStrategy
                .sample(StrategyInput {
                    edges: &edges,
                    nodes: &Frame::new(),
                    known_nodes: &known,
                    state: &[],
                    configuration: &json!({"n": 5}),
                    rng: &mut rng,
                })
                .unwrap()
                .new_seeds
        };
        assert_eq!(draw(42), draw(42));
    }
}
