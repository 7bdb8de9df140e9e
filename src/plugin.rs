//! # Plug-in Module
//!
//! The connector and strategy contracts, the name→plug-in registry, and the
//! adapters that sit between the controller and untrusted plug-in code.
//!
//! ## Overview
//!
//! Plug-ins are resolved once at startup into a registry keyed by name; an
//! unresolved name is a fatal configuration error before any crawling
//! happens. Each plug-in carries a default configuration that the user's
//! per-layer configuration is merged over.
//!
//! The **connector adapter** wraps one connector for one layer: it invokes
//! the connector for a batch of node identifiers (with transient-failure
//! retry), pipes every returned edge row through the layer's routers, drops
//! unsolicited node rows, and coerces declared column types.
//!
//! The **strategy adapter** wraps one sampler for one layer: it pre-validates
//! the configuration against the layer's tables, derives a reproducible RNG
//! when a `random_seed` is configured, and replaces the strategy's state rows
//! wholesale after each invocation.

use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::LayerConfig;
use crate::error::{with_retry, SpiderError};
use crate::record::{AggregatedEdge, ColumnType, Frame, NodeId, RawEdge, Record};
use crate::router::Router;
use crate::store::LayerSchema;

/// A data source: given a batch of node identifiers, returns an edge frame
/// and a node frame.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inserted under the plug-in's name in fresh project files and merged
    /// under the user's configuration at runtime.
    fn default_configuration(&self) -> Value {
        Value::Null
    }

    async fn fetch(
        &self,
        node_ids: &[NodeId],
        configuration: &Value,
    ) -> Result<(Frame, Frame), SpiderError>;
}

/// Everything a sampler gets to see for one invocation.
pub struct StrategyInput<'a> {
    /// The aggregated edge frame for this layer.
    pub edges: &'a [AggregatedEdge],
    /// The dense node frame for this layer.
    pub nodes: &'a Frame,
    /// Node identifiers with status `done` for this layer.
    pub known_nodes: &'a HashSet<NodeId>,
    /// The strategy's previous state rows; empty on first call.
    pub state: &'a [Record],
    /// Merged configuration declared under the strategy's name.
    pub configuration: &'a Value,
    pub rng: &'a mut StdRng,
}

/// What a sampler hands back.
#[derive(Debug, Default)]
pub struct StrategyOutcome {
    /// Ordered identifiers to enqueue for the next iteration.
    pub new_seeds: Vec<NodeId>,
    /// Edges to persist into the sparse aggregated table.
    pub sampled_edges: Vec<AggregatedEdge>,
    /// Nodes to flag as sampled.
    pub sampled_nodes: Frame,
    /// Replacement state rows; the adapter clears the old set first.
    pub new_state: Vec<Record>,
}

/// A sampling strategy. Pure: no hidden state beyond what it reads and
/// writes through its declared state rows.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_configuration(&self) -> Value {
        Value::Null
    }

    /// Schema of the strategy's state rows. The adapter drops undeclared
    /// columns and coerces declared ones to these types before the state is
    /// persisted.
    fn state_columns(&self) -> BTreeMap<String, ColumnType> {
        BTreeMap::from([("node_id".to_string(), ColumnType::Text)])
    }

    /// Checks the merged configuration against the layer's tables before the
    /// first invocation. The default accepts everything.
    fn validate_configuration(
        &self,
        _configuration: &Value,
        _schema: &LayerSchema,
    ) -> Result<(), SpiderError> {
        Ok(())
    }

    fn sample(&self, input: StrategyInput<'_>) -> Result<StrategyOutcome, SpiderError>;
}

/// Name→plug-in lookup, resolved once at startup.
#[derive(Default)]
pub struct PluginRegistry {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
    strategies: BTreeMap<String, Arc<dyn Strategy>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in plug-ins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_connector(Arc::new(crate::connectors::CsvConnector::new()));
        registry.register_strategy(Arc::new(crate::strategies::RandomStrategy));
        registry.register_strategy(Arc::new(crate::strategies::SnowballStrategy));
        registry.register_strategy(Arc::new(crate::strategies::SpikyBallStrategy));
        registry
    }

    pub fn register_connector(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.name().to_string(), connector);
    }

    pub fn register_strategy(&mut self, strategy: Arc<dyn Strategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    pub fn connector(&self, name: &str) -> Result<Arc<dyn Connector>, SpiderError> {
        self.connectors.get(name).cloned().ok_or_else(|| {
            SpiderError::config("connector", format!("`{name}` is not a registered connector"))
        })
    }

    pub fn strategy(&self, name: &str) -> Result<Arc<dyn Strategy>, SpiderError> {
        self.strategies.get(name).cloned().ok_or_else(|| {
            SpiderError::config("sampler", format!("`{name}` is not a registered strategy"))
        })
    }

    pub fn connector_names(&self) -> Vec<&str> {
        self.connectors.keys().map(String::as_str).collect()
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }
}

/// Merges the user configuration over the plug-in default, object key by
/// object key; scalars replace wholesale.
pub fn merge_configuration(default: &Value, user: &Value) -> Value {
    match (default, user) {
        (Value::Object(base), Value::Object(over)) => {
            let mut merged = base.clone();
            for (key, value) in over {
                let slot = merged.entry(key.clone()).or_insert(Value::Null);
                let replacement = merge_configuration(slot, value);
                *slot = replacement;
            }
            Value::Object(merged)
        }
        (default, Value::Null) => default.clone(),
        (_, user) => user.clone(),
    }
}

/// One layer's connector, compiled routers, and coercion schemas.
pub struct ConnectorAdapter {
    layer: String,
    connector: Arc<dyn Connector>,
    configuration: Value,
    routers: Vec<Router>,
    edge_columns: BTreeMap<String, ColumnType>,
    node_columns: BTreeMap<String, ColumnType>,
}

impl ConnectorAdapter {
    pub fn bind(
        layer: &str,
        layer_config: &LayerConfig,
        registry: &PluginRegistry,
    ) -> Result<Self, SpiderError> {
        let name = layer_config.connector.name().ok_or_else(|| {
            SpiderError::config(format!("layers.{layer}.connector"), "connector binding is empty")
        })?;
        let connector = registry.connector(name).map_err(|_| {
            SpiderError::config(
                format!("layers.{layer}.connector"),
                format!("`{name}` is not a registered connector"),
            )
        })?;
        let configuration = merge_configuration(
            &connector.default_configuration(),
            &layer_config.connector.configuration(),
        );
        let routers = layer_config
            .routers
            .iter()
            .enumerate()
            .map(|(index, spec)| Router::compile(layer, index, spec))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ConnectorAdapter {
            layer: layer.to_string(),
            connector,
            configuration,
            routers,
            edge_columns: layer_config.edge_raw_table.columns.clone(),
            node_columns: layer_config.node_table.columns.clone(),
        })
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    /// Fetches one batch: invokes the connector (with transient retry),
    /// routes every edge row, validates and coerces the node frame.
    pub async fn fetch_batch(
        &self,
        node_ids: &[NodeId],
    ) -> Result<(Vec<RawEdge>, Frame), SpiderError> {
        let (edge_frame, mut node_frame) = with_retry(
            &format!("connector `{}`", self.connector.name()),
            || self.connector.fetch(node_ids, &self.configuration),
        )
        .await
        .map_err(|err| match err {
            err @ (SpiderError::TransientIo(_) | SpiderError::Config { .. }) => err,
            other => SpiderError::plugin(self.connector.name(), other.to_string()),
        })?;

        let mut edges = Vec::new();
        for record in &edge_frame.rows {
            for router in &self.routers {
                edges.extend(router.route(record));
            }
        }
        for edge in &mut edges {
            for (column, column_type) in &self.edge_columns {
                if let Some(value) = edge.columns.get(column) {
                    let coerced = column_type.coerce(column, value);
                    edge.columns.insert(column.clone(), coerced);
                }
            }
        }

        let requested: HashSet<NodeId> = node_ids.iter().cloned().collect();
        node_frame.retain_named(&requested);
        node_frame.coerce_columns(&self.node_columns);

        debug!(
            "layer `{}`: batch of {} ids routed into {} edges, {} node rows",
            self.layer,
            node_ids.len(),
            edges.len(),
            node_frame.len()
        );
        Ok((edges, node_frame))
    }
}

/// One layer's sampler with its merged configuration.
pub struct StrategyAdapter {
    layer: String,
    strategy: Arc<dyn Strategy>,
    configuration: Value,
    state_columns: BTreeMap<String, ColumnType>,
    random_seed: Option<u64>,
}

impl StrategyAdapter {
    pub fn bind(
        layer: &str,
        layer_config: &LayerConfig,
        registry: &PluginRegistry,
        schema: &LayerSchema,
        random_seed: Option<u64>,
    ) -> Result<Self, SpiderError> {
        let name = layer_config.sampler.name().ok_or_else(|| {
            SpiderError::config(format!("layers.{layer}.sampler"), "sampler binding is empty")
        })?;
        let strategy = registry.strategy(name).map_err(|_| {
            SpiderError::config(
                format!("layers.{layer}.sampler"),
                format!("`{name}` is not a registered strategy"),
            )
        })?;
        let configuration = merge_configuration(
            &strategy.default_configuration(),
            &layer_config.sampler.configuration(),
        );
        strategy.validate_configuration(&configuration, schema)?;
        let state_columns = strategy.state_columns();
        Ok(StrategyAdapter {
            layer: layer.to_string(),
            strategy,
            configuration,
            state_columns,
            random_seed,
        })
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Invokes the sampler with a per-(layer, iteration) RNG so that a
    /// resumed run draws the same samples as an uninterrupted one.
    pub fn sample(
        &self,
        edges: &[AggregatedEdge],
        nodes: &Frame,
        known_nodes: &HashSet<NodeId>,
        state: &[Record],
        iteration: i64,
    ) -> Result<StrategyOutcome, SpiderError> {
        let mut rng = match self.random_seed {
            Some(seed) => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                self.layer.hash(&mut hasher);
                iteration.hash(&mut hasher);
                StdRng::seed_from_u64(seed ^ hasher.finish())
            }
            None => StdRng::from_entropy(),
        };
        let mut outcome = self.strategy.sample(StrategyInput {
            edges,
            nodes,
            known_nodes,
            state,
            configuration: &self.configuration,
            rng: &mut rng,
        })?;
        self.shape_state(&mut outcome.new_state);
        debug!(
            "layer `{}`: strategy `{}` kept {} edges, {} nodes, proposed {} seeds",
            self.layer,
            self.strategy.name(),
            outcome.sampled_edges.len(),
            outcome.sampled_nodes.len(),
            outcome.new_seeds.len()
        );
        Ok(outcome)
    }

    /// Conforms state rows to the schema the strategy declared at
    /// registration: undeclared columns are dropped, declared ones coerced.
    fn shape_state(&self, state: &mut [Record]) {
        for record in state {
            record.0.retain(|column, _| {
                let declared = self.state_columns.contains_key(column);
                if !declared {
                    warn!(
                        "strategy `{}` emitted undeclared state column `{}`, dropping",
                        self.strategy.name(),
                        column
                    );
                }
                declared
            });
            for (column, column_type) in &self.state_columns {
                if let Some(value) = record.0.get(column) {
                    let coerced = column_type.coerce(column, value);
                    record.0.insert(column.clone(), coerced);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unresolved_names_are_config_errors() {
        let registry = PluginRegistry::with_builtins();
        assert!(registry.connector("csv").is_ok());
        assert!(registry.strategy("spikyball").is_ok());
        assert!(matches!(
            registry.connector("telegram"),
            Err(SpiderError::Config { .. })
        ));
        assert!(matches!(
            registry.strategy("unknown"),
            Err(SpiderError::Config { .. })
        ));
    }

    #[test]
    fn builtin_names_enumerate() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(registry.connector_names(), vec!["csv"]);
        assert_eq!(registry.strategy_names(), vec!["random", "snowball", "spikyball"]);
    }

    #[test]
    fn user_configuration_wins_key_by_key() {
        let default = json!({"n": 10, "mode": "out", "nested": {"a": 1, "b": 2}});
        let user = json!({"n": 2, "nested": {"b": 3}});
        let merged = merge_configuration(&default, &user);
        assert_eq!(merged["n"], json!(2));
        assert_eq!(merged["mode"], json!("out"));
        assert_eq!(merged["nested"]["a"], json!(1));
        assert_eq!(merged["nested"]["b"], json!(3));
    }

    #[test]
    fn null_user_configuration_keeps_defaults() {
        let default = json!({"n": 10});
        assert_eq!(merge_configuration(&default, &Value::Null), default);
    }

    struct NoisyStateStrategy;

    impl Strategy for NoisyStateStrategy {
        fn name(&self) -> &'static str {
            "noisy-state"
        }

        fn state_columns(&self) -> BTreeMap<String, ColumnType> {
            BTreeMap::from([
                ("node_id".to_string(), ColumnType::Text),
                ("visits".to_string(), ColumnType::Integer),
            ])
        }

        fn sample(&self, _input: StrategyInput<'_>) -> Result<StrategyOutcome, SpiderError> {
            let mut record = Record::new();
            record.insert("node_id", json!("a"));
            record.insert("visits", json!("7"));
            record.insert("scratch", json!("not declared"));
            Ok(StrategyOutcome {
                new_state: vec![record],
                ..Default::default()
            })
        }
    }

    #[test]
    fn state_rows_are_shaped_by_the_declared_schema() {
        let mut registry = PluginRegistry::new();
        registry.register_strategy(Arc::new(NoisyStateStrategy));
        let layer_config: LayerConfig =
            serde_yaml::from_str("connector: csv\nsampler: noisy-state\n").unwrap();
        let adapter = StrategyAdapter::bind(
            "posts",
            &layer_config,
            &registry,
            &LayerSchema::default(),
            Some(1),
        )
        .unwrap();

        let outcome = adapter
            .sample(&[], &Frame::new(), &HashSet::new(), &[], 0)
            .unwrap();

        let state = &outcome.new_state[0];
        assert_eq!(state.get_str("node_id"), Some("a"));
        assert_eq!(state.get("visits"), Some(&json!(7)));
        assert!(state.get("scratch").is_none());
    }
}
