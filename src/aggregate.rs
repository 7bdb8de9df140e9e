//! # Aggregation Module
//!
//! Folds the raw edge log into weighted aggregated edges, once per iteration
//! per touched layer.
//!
//! ## Overview
//!
//! For each (source, target) group of a layer's raw table the fold computes
//! `weight = COUNT(*)` plus the user-declared aggregations (`sum`, `min`,
//! `max`, `avg`, `count`). The fold always reads the complete raw table,
//! never an increment, so re-running it after a crash or a resume produces
//! byte-identical output. Groups come back ordered by first appearance in
//! the append log, which keeps downstream sampling deterministic.

use std::collections::BTreeMap;

use crate::config::{AggColumn, AggTableConfig, AggregateFn, Configuration};
use crate::error::SpiderError;
use crate::record::{AggregatedEdge, ColumnType};
use crate::store::{schema, SqliteStore};

/// Recomputes aggregated edges for the layers it knows about.
pub struct Aggregator {
    layers: BTreeMap<String, AggTableConfig>,
}

fn fold_expr(column: &str, agg: &AggColumn) -> String {
    let source = agg.source_column.as_deref().unwrap_or(column);
    match agg.aggregate {
        AggregateFn::Sum => format!(r#"SUM("{source}")"#),
        AggregateFn::Min => format!(r#"MIN("{source}")"#),
        AggregateFn::Max => format!(r#"MAX("{source}")"#),
        // AVG yields a real; land it in the declared cell type.
        AggregateFn::Avg => match agg.column_type {
            ColumnType::Integer => format!(r#"CAST(AVG("{source}") AS INTEGER)"#),
            ColumnType::Text => format!(r#"CAST(AVG("{source}") AS TEXT)"#),
        },
        AggregateFn::Count => format!(r#"COUNT("{source}")"#),
    }
}

impl Aggregator {
    pub fn new(configuration: &Configuration) -> Self {
        Aggregator {
            layers: configuration
                .layers
                .iter()
                .map(|(name, layer)| (name.clone(), layer.edge_agg_table.clone()))
                .collect(),
        }
    }

    /// Folds the complete raw edge table of `layer` into its aggregated
    /// frame. Idempotent by construction.
    pub fn aggregate(
        &self,
        store: &mut SqliteStore,
        layer: &str,
    ) -> Result<Vec<AggregatedEdge>, SpiderError> {
        let table_config = self.layers.get(layer).ok_or_else(|| {
            SpiderError::config(format!("layers.{layer}"), "layer is not declared")
        })?;
        store.ensure_layer(layer)?;

        let columns: Vec<(&String, &AggColumn)> = table_config.columns.iter().collect();
        let folds: String = columns
            .iter()
            .map(|(name, agg)| format!(", {} AS \"{name}\"", fold_expr(name.as_str(), agg)))
            .collect();
        let table = schema::raw_edges_table(layer);
        let sql = format!(
            r#"SELECT source, target, COUNT(*) AS weight{folds}
               FROM "{table}"
               GROUP BY source, target
               ORDER BY MIN(id)"#
        );

        let mut edges = Vec::new();
        let mut stmt = store.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut edge_columns = BTreeMap::new();
            for (index, (name, _)) in columns.iter().enumerate() {
                edge_columns.insert(
                    (*name).clone(),
                    crate::store::sql_to_value(row.get_ref(index + 3)?),
                );
            }
            edges.push(AggregatedEdge {
                layer: layer.to_string(),
                source: row.get(0)?,
                target: row.get(1)?,
                weight: row.get(2)?,
                columns: edge_columns,
            });
        }
        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RawEdge;
    use crate::store::LayerSchema;
    use serde_json::json;

    fn configuration() -> Configuration {
        serde_yaml::from_str(
            r#"
seeds: [A]
layers:
  posts:
    connector: csv
    sampler: random
    edge_raw_table:
      columns:
        views: Integer
    edge_agg_table:
      columns:
        views:
          type: Integer
          aggregate: sum
        seen:
          type: Integer
          aggregate: count
          source_column: views
"#,
        )
        .unwrap()
    }

    fn store(configuration: &Configuration) -> SqliteStore {
        let layers = configuration
            .layers
            .iter()
            .map(|(name, layer)| (name.clone(), LayerSchema::from_config(layer)))
            .collect();
        SqliteStore::open(None, layers).unwrap()
    }

    fn edge(source: &str, target: &str, views: i64) -> RawEdge {
        RawEdge {
            layer: "posts".to_string(),
            source: source.to_string(),
            target: target.to_string(),
            columns: [("views".to_string(), json!(views))].into_iter().collect(),
            dispatched: false,
        }
    }

    #[test]
    fn weight_counts_identical_pairs() {
        let configuration = configuration();
        let mut store = store(&configuration);
        store
            .append_raw_edges(
                &[edge("a", "b", 10), edge("a", "c", 5), edge("a", "b", 2)],
                0,
            )
            .unwrap();
        let aggregator = Aggregator::new(&configuration);
        let edges = aggregator.aggregate(&mut store, "posts").unwrap();
        assert_eq!(edges.len(), 2);
        // First appearance order: (a,b) before (a,c).
        assert_eq!(edges[0].target, "b");
        assert_eq!(edges[0].weight, 2);
        assert_eq!(edges[0].columns["views"], json!(12));
        assert_eq!(edges[0].columns["seen"], json!(2));
        assert_eq!(edges[1].target, "c");
        assert_eq!(edges[1].weight, 1);
        assert_eq!(edges[1].columns["views"], json!(5));
    }

    #[test]
    fn rerunning_aggregation_is_idempotent() {
        let configuration = configuration();
        let mut store = store(&configuration);
        store.append_raw_edges(&[edge("a", "b", 1), edge("a", "b", 1)], 0).unwrap();
        let aggregator = Aggregator::new(&configuration);
        let first = aggregator.aggregate(&mut store, "posts").unwrap();
        let second = aggregator.aggregate(&mut store, "posts").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_layer_aggregates_to_nothing() {
        let configuration = configuration();
        let mut store = store(&configuration);
        let aggregator = Aggregator::new(&configuration);
        assert!(aggregator.aggregate(&mut store, "posts").unwrap().is_empty());
    }
}
