//! Spikyball sampling: weighted random edge selection.
//!
//! Follows the inhomogeneous filtered diffusion of Ricaud, Aspert & Miz,
//! "Spikyball sampling: Exploring large networks via an inhomogeneous
//! filtered diffusion" (arXiv:2010.11786). Each outward edge gets an
//! unnormalized score
//!
//! ```text
//! P = rho_s * sum(w_s[i] * src[i]) + rho_t * sum(w_t[i] * tgt[i]) + rho_e * sum(w_e[i] * edge[i])
//! ```
//!
//! from the three configuration sub-sections `source_node_probability`,
//! `target_node_probability`, and `edge_probability`. Empty weight vectors
//! contribute 0, as do columns missing from a row. Scores are normalized
//! over the outward candidates and `layer_max_size` edges are drawn without
//! replacement.

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

use super::{nodes_named, partition_edges, seed_state, unique_targets};
use crate::error::SpiderError;
use crate::plugin::{Strategy, StrategyInput, StrategyOutcome};
use crate::record::{AggregatedEdge, Record};
use crate::store::LayerSchema;

/// One probability mass term: its coefficient and column weight vector.
#[derive(Debug, Clone, Default, Deserialize)]
struct ProbabilityConfiguration {
    #[serde(default)]
    coefficient: f64,
    #[serde(default)]
    weights: BTreeMap<String, f64>,
}

fn default_layer_max_size() -> usize {
    150
}

#[derive(Debug, Clone, Deserialize)]
struct SpikyBallConfiguration {
    #[serde(default)]
    source_node_probability: ProbabilityConfiguration,
    #[serde(default)]
    target_node_probability: ProbabilityConfiguration,
    #[serde(default)]
    edge_probability: ProbabilityConfiguration,
    #[serde(default = "default_layer_max_size")]
    layer_max_size: usize,
}

pub struct SpikyBallStrategy;

fn parse_configuration(configuration: &Value) -> Result<SpikyBallConfiguration, SpiderError> {
    if configuration.is_null() {
        return Ok(SpikyBallConfiguration {
            source_node_probability: ProbabilityConfiguration::default(),
            target_node_probability: ProbabilityConfiguration::default(),
            edge_probability: ProbabilityConfiguration::default(),
            layer_max_size: default_layer_max_size(),
        });
    }
    serde_json::from_value(configuration.clone())
        .map_err(|err| SpiderError::config("sampler.spikyball", err.to_string()))
}

fn node_term(
    params: &ProbabilityConfiguration,
    node: Option<&Record>,
) -> f64 {
    if params.weights.is_empty() {
        return 0.0;
    }
    let sum: f64 = params
        .weights
        .iter()
        .map(|(column, weight)| {
            node.and_then(|record| record.get_f64(column)).unwrap_or(0.0) * weight
        })
        .sum();
    params.coefficient * sum
}

fn edge_term(params: &ProbabilityConfiguration, edge: &AggregatedEdge) -> f64 {
    if params.weights.is_empty() {
        return 0.0;
    }
    let sum: f64 = params
        .weights
        .iter()
        .map(|(column, weight)| edge.column_f64(column).unwrap_or(0.0) * weight)
        .sum();
    params.coefficient * sum
}

/// Draws up to `k` indices without replacement, proportionally to `scores`.
/// Returned indices are ascending so the sampled edges keep frame order.
fn weighted_draws(rng: &mut StdRng, scores: &[(usize, f64)], k: usize) -> Vec<usize> {
    let mut pool: Vec<(usize, f64)> = scores.to_vec();
    let mut picked = Vec::new();
    while picked.len() < k && !pool.is_empty() {
        let total: f64 = pool.iter().map(|(_, score)| score).sum();
        if total <= 0.0 {
            break;
        }
        let mut draw = rng.gen_range(0.0..total);
        let mut chosen = pool.len() - 1;
        for (position, (_, score)) in pool.iter().enumerate() {
            if draw < *score {
                chosen = position;
                break;
            }
            draw -= score;
        }
        picked.push(pool.remove(chosen).0);
    }
    picked.sort_unstable();
    picked
}

impl Strategy for SpikyBallStrategy {
    fn name(&self) -> &'static str {
        "spikyball"
    }

    /// Every referenced weight column must exist in the relevant table.
    fn validate_configuration(
        &self,
        configuration: &Value,
        schema: &LayerSchema,
    ) -> Result<(), SpiderError> {
        let configuration = parse_configuration(configuration)?;
        for (section, params) in [
            ("source_node_probability", &configuration.source_node_probability),
            ("target_node_probability", &configuration.target_node_probability),
        ] {
            for column in params.weights.keys() {
                if !schema.node_columns.contains_key(column) {
                    return Err(SpiderError::config(
                        format!("sampler.spikyball.{section}.weights.{column}"),
                        "column is not declared in the node table",
                    ));
                }
            }
        }
        for column in configuration.edge_probability.weights.keys() {
            if column != "weight" && !schema.agg_columns.contains_key(column) {
                return Err(SpiderError::config(
                    format!("sampler.spikyball.edge_probability.weights.{column}"),
                    "column is not declared in the aggregated edge table",
                ));
            }
        }
        Ok(())
    }

    fn sample(&self, input: StrategyInput<'_>) -> Result<StrategyOutcome, SpiderError> {
        let configuration = parse_configuration(input.configuration)?;

        let (inward, outward) = partition_edges(input.edges, input.known_nodes);

        let nodes_by_name: HashMap<&str, &Record> = input
            .nodes
            .rows
            .iter()
            .filter_map(|record| record.get_str("name").map(|name| (name, record)))
            .collect();

        let scores: Vec<(usize, f64)> = outward
            .iter()
            .enumerate()
            .map(|(index, edge)| {
                let score = node_term(
                    &configuration.source_node_probability,
                    nodes_by_name.get(edge.source.as_str()).copied(),
                ) + node_term(
                    &configuration.target_node_probability,
                    nodes_by_name.get(edge.target.as_str()).copied(),
                ) + edge_term(&configuration.edge_probability, edge);
                (index, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();

        let candidates: Vec<&AggregatedEdge> =
            scores.iter().map(|(index, _)| outward[*index]).collect();
        let sampled_outward: Vec<&AggregatedEdge> =
            if unique_targets(&candidates).len() <= configuration.layer_max_size {
                candidates
            } else {
                weighted_draws(input.rng, &scores, configuration.layer_max_size)
                    .into_iter()
                    .map(|index| outward[index])
                    .collect()
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
    use crate::record::{ColumnType, Frame};
    use rand::SeedableRng;
    use serde_json::json;
    use std::collections::HashSet;

    fn edge(source: &str, target: &str, views: i64) -> AggregatedEdge {
        AggregatedEdge {
            layer: "posts".into(),
            source: source.into(),
            target: target.into(),
            weight: 1,
            columns: [("views".to_string(), json!(views))].into_iter().collect(),
        }
    }

    #[test]
    fn zero_scored_edges_are_never_drawn() {
        // views = {10, 0}: with only edge_probability.views weighted, the
        // views=10 edge must be chosen every time.
        let edges = vec![edge("a", "b", 10), edge("a", "c", 0)];
        let known = HashSet::from(["a".to_string()]);
        let configuration = json!({
            "edge_probability": { "coefficient": 1.0, "weights": { "views": 1.0 } },
            "layer_max_size": 1,
        });
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let outcome = SpikyBallStrategy
                .sample(StrategyInput {
                    edges: &edges,
                    nodes: &Frame::new(),
                    known_nodes: &known,
                    state: &[],
                    configuration: &configuration,
                    rng: &mut rng,
                })
                .unwrap();
            assert_eq!(outcome.new_seeds, vec!["b"]);
        }
    }

    #[test]
    fn small_candidate_sets_are_kept_wholesale() {
        let edges = vec![edge("a", "b", 1), edge("a", "c", 2)];
        let known = HashSet::from(["a".to_string()]);
        let configuration = json!({
            "edge_probability": { "coefficient": 1.0, "weights": { "views": 1.0 } },
            "layer_max_size": 150,
        });
        let mut rng = StdRng::seed_from_u64(1);
        let outcome = SpikyBallStrategy
            .sample(StrategyInput {
                edges: &edges,
                nodes: &Frame::new(),
                known_nodes: &known,
                state: &[],
                configuration: &configuration,
                rng: &mut rng,
            })
            .unwrap();
        assert_eq!(outcome.new_seeds, vec!["b", "c"]);
    }

    #[test]
    fn unknown_weight_columns_fail_validation() {
        let mut schema = LayerSchema::default();
        schema.agg_columns.insert("views".to_string(), ColumnType::Integer);
        let good = json!({
            "edge_probability": { "coefficient": 1.0, "weights": { "views": 1.0 } }
        });
        assert!(SpikyBallStrategy.validate_configuration(&good, &schema).is_ok());

        let bad = json!({
            "edge_probability": { "coefficient": 1.0, "weights": { "likes": 1.0 } }
        });
        assert!(SpikyBallStrategy.validate_configuration(&bad, &schema).is_err());

        let bad_node = json!({
            "source_node_probability": { "coefficient": 1.0, "weights": { "followers": 1.0 } }
        });
        assert!(SpikyBallStrategy.validate_configuration(&bad_node, &schema).is_err());
    }

    #[test]
    fn weighted_draws_respect_k_and_order() {
        let mut rng = StdRng::seed_from_u64(3);
        let scores = vec![(0, 1.0), (1, 5.0), (2, 3.0), (3, 0.5)];
        let picked = weighted_draws(&mut rng, &scores, 2);
        assert_eq!(picked.len(), 2);
        assert!(picked.windows(2).all(|w| w[0] < w[1]));
    }
}
