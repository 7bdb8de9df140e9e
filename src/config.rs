//! # Configuration Module
//!
//! Typed view over the YAML project file that drives every other component.
//!
//! ## Overview
//!
//! A project file names the store, the iteration budget, the seed set, and
//! one or more layers; each layer binds a connector, an ordered list of
//! routers, a sampling strategy, and the column schemas of its tables. The
//! raw YAML is deserialized with serde and then validated in one pass;
//! validation failures surface as [`SpiderError::Config`] carrying the dotted
//! path of the offending key.
//!
//! Plug-in name resolution is deliberately not done here: the builder checks
//! names against the registry once, at startup, so that this module stays
//! free of registry dependencies.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::SpiderError;
use crate::record::{ColumnType, NodeId};

/// Behavior when a layer queue empties without new seeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptySeedPolicy {
    Stop,
    Continue,
}

/// Recognized aggregation folds for user-declared columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    Sum,
    Min,
    Max,
    Avg,
    Count,
}

impl AggregateFn {
    /// Only `count` is defined over non-numeric columns.
    pub fn requires_numeric(&self) -> bool {
        !matches!(self, AggregateFn::Count)
    }
}

/// A plug-in binding: either a bare name (defaults apply) or a single-entry
/// mapping of name to configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginSpec {
    Name(String),
    Configured(BTreeMap<String, Value>),
}

impl PluginSpec {
    pub fn name(&self) -> Option<&str> {
        match self {
            PluginSpec::Name(name) => Some(name),
            PluginSpec::Configured(map) => map.keys().next().map(String::as_str),
        }
    }

    /// The configuration declared under the plug-in's name, if any.
    pub fn configuration(&self) -> Value {
        match self {
            PluginSpec::Name(_) => Value::Null,
            PluginSpec::Configured(map) => {
                map.values().next().cloned().unwrap_or(Value::Null)
            }
        }
    }
}

/// One target emitter within a router specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Record field whose scalar(s) become edge targets.
    pub field: String,
    /// Regex with a single capture group; one edge per successful match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Emit on this layer instead of the current one, and enqueue the target
    /// as a seed there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_with: Option<String>,
    /// Any further keys become literal columns on the emitted edges.
    #[serde(flatten)]
    pub literals: BTreeMap<String, Value>,
}

/// A router specification, declared per layer in evaluation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSpec {
    /// Field holding the edge source.
    pub source: String,
    /// Ordered target emitters.
    pub target: Vec<TargetSpec>,
    /// Extra columns: a string value names a record field to copy, any other
    /// scalar is carried as a literal.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Column schema for the raw edge and node tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableConfig {
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnType>,
}

/// One aggregated column: its storage type and fold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggColumn {
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub aggregate: AggregateFn,
    /// Raw-edge column the fold reads; defaults to the aggregated column's
    /// own name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_column: Option<String>,
}

/// Column schema for the aggregated edge table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggTableConfig {
    #[serde(default)]
    pub columns: BTreeMap<String, AggColumn>,
}

/// Configuration of a single layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub connector: PluginSpec,
    #[serde(default)]
    pub routers: Vec<RouterSpec>,
    pub sampler: PluginSpec,
    /// If true, every routed edge immediately enqueues its target; otherwise
    /// only the strategy enqueues.
    #[serde(default)]
    pub eager: bool,
    #[serde(default)]
    pub edge_raw_table: TableConfig,
    #[serde(default)]
    pub edge_agg_table: AggTableConfig,
    #[serde(default)]
    pub node_table: TableConfig,
}

/// Inline seed declarations: a per-layer mapping or a flat list applied to
/// every declared layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeedSpec {
    PerLayer(BTreeMap<String, Vec<NodeId>>),
    Flat(Vec<NodeId>),
}

fn default_project_name() -> String {
    "spider".to_string()
}

fn default_max_iteration() -> i64 {
    10_000
}

fn default_batch_size() -> usize {
    150
}

fn default_wait_base() -> f64 {
    1.0
}

/// The validated, typed project configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    /// Store locator; empty or absent means in-memory.
    #[serde(default)]
    pub db_url: Option<String>,
    /// Optional schema namespace; not supported by the SQLite store.
    #[serde(default)]
    pub db_schema: Option<String>,
    #[serde(default = "default_max_iteration")]
    pub max_iteration: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub random_wait: bool,
    /// Base of the uniform [0, 2·base] inter-batch delay.
    #[serde(default = "default_wait_base")]
    pub wait_base_seconds: f64,
    /// Absent means `continue`; the validator logs the applied default.
    #[serde(default)]
    pub empty_seeds: Option<EmptySeedPolicy>,
    #[serde(default)]
    pub seeds: Option<SeedSpec>,
    /// Newline-delimited seed list; takes precedence over `seeds`.
    #[serde(default)]
    pub seed_file: Option<PathBuf>,
    /// Seeds strategy randomness for reproducible runs.
    #[serde(default)]
    pub random_seed: Option<u64>,
    pub layers: BTreeMap<String, LayerConfig>,
}

impl Configuration {
    /// Reads and validates a project file.
    pub fn load(path: &Path) -> Result<Self, SpiderError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            SpiderError::config(
                path.display().to_string(),
                format!("cannot read configuration file: {err}"),
            )
        })?;
        let configuration: Configuration = serde_yaml::from_str(&text)
            .map_err(|err| SpiderError::config(path.display().to_string(), err.to_string()))?;
        configuration.validate()?;
        Ok(configuration)
    }

    /// One-pass structural validation; reports the offending dotted path.
    pub fn validate(&self) -> Result<(), SpiderError> {
        if self.layers.is_empty() {
            return Err(SpiderError::config("layers", "at least one layer must be declared"));
        }
        if self.db_schema.is_some() {
            return Err(SpiderError::config("db_schema", "SQLite does not support schemas"));
        }
        if self.max_iteration < 1 {
            return Err(SpiderError::config("max_iteration", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(SpiderError::config("batch_size", "must be greater than 0"));
        }
        if self.seeds.is_none() && self.seed_file.is_none() {
            return Err(SpiderError::config(
                "seeds",
                "either seeds or seed_file must be provided",
            ));
        }
        if self.empty_seeds.is_none() {
            info!("empty_seeds not set, defaulting to `continue`");
        }

        for (layer_name, layer) in &self.layers {
            let at = |key: &str| format!("layers.{layer_name}.{key}");

            if layer.connector.name().is_none() {
                return Err(SpiderError::config(at("connector"), "connector binding is empty"));
            }
            if layer.sampler.name().is_none() {
                return Err(SpiderError::config(at("sampler"), "sampler binding is empty"));
            }
            for (index, router) in layer.routers.iter().enumerate() {
                let at_router = |key: &str| format!("layers.{layer_name}.routers[{index}].{key}");
                if router.source.is_empty() {
                    return Err(SpiderError::config(at_router("source"), "source field is empty"));
                }
                if router.target.is_empty() {
                    return Err(SpiderError::config(at_router("target"), "no target emitters declared"));
                }
                for (t_index, target) in router.target.iter().enumerate() {
                    if target.field.is_empty() {
                        return Err(SpiderError::config(
                            format!("layers.{layer_name}.routers[{index}].target[{t_index}].field"),
                            "field is empty",
                        ));
                    }
                    if let Some(dispatch) = &target.dispatch_with {
                        if !self.layers.contains_key(dispatch) {
                            return Err(SpiderError::config(
                                format!(
                                    "layers.{layer_name}.routers[{index}].target[{t_index}].dispatch_with"
                                ),
                                format!("layer `{dispatch}` is not declared"),
                            ));
                        }
                    }
                }
            }
            for (column, agg) in &layer.edge_agg_table.columns {
                if agg.has_invalid_fold() {
                    return Err(SpiderError::config(
                        format!("layers.{layer_name}.edge_agg_table.columns.{column}"),
                        "non-numeric columns may only carry `count`",
                    ));
                }
            }
        }
        Ok(())
    }

    /// The effective empty-seeds policy.
    pub fn empty_seeds_policy(&self) -> EmptySeedPolicy {
        self.empty_seeds.unwrap_or(EmptySeedPolicy::Continue)
    }

    /// Resolves the bootstrap seed set per layer: the seed file takes
    /// precedence over inline seeds, and a flat list is applied to every
    /// declared layer.
    pub fn resolve_seeds(&self) -> Result<BTreeMap<String, Vec<NodeId>>, SpiderError> {
        if let Some(path) = &self.seed_file {
            let ids = read_seed_file(path)?;
            return Ok(self
                .layers
                .keys()
                .map(|layer| (layer.clone(), ids.clone()))
                .collect());
        }
        match &self.seeds {
            Some(SeedSpec::PerLayer(map)) => {
                for layer in map.keys() {
                    if !self.layers.contains_key(layer) {
                        return Err(SpiderError::config(
                            format!("seeds.{layer}"),
                            "seeds declared for an undeclared layer",
                        ));
                    }
                }
                Ok(map.clone())
            }
            Some(SeedSpec::Flat(ids)) => Ok(self
                .layers
                .keys()
                .map(|layer| (layer.clone(), ids.clone()))
                .collect()),
            None => Ok(BTreeMap::new()),
        }
    }
}

impl AggColumn {
    fn has_invalid_fold(&self) -> bool {
        self.aggregate.requires_numeric() && self.column_type != ColumnType::Integer
    }
}

/// Reads a newline-delimited seed file: one NodeId per non-empty line,
/// `#`-prefixed lines are comments.
pub fn read_seed_file(path: &Path) -> Result<Vec<NodeId>, SpiderError> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        SpiderError::config(
            "seed_file",
            format!("cannot read {}: {err}", path.display()),
        )
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
project_name: test
max_iteration: 3
seeds:
  posts: [A]
layers:
  posts:
    connector:
      csv:
        edge_list_location: edges.csv
        mode: out
    routers:
      - source: source
        target:
          - field: target
    sampler:
      random:
        n: 2
"#
    }

    #[test]
    fn minimal_configuration_parses_and_validates() {
        let configuration: Configuration = serde_yaml::from_str(minimal_yaml()).unwrap();
        configuration.validate().unwrap();
        assert_eq!(configuration.batch_size, 150);
        assert_eq!(configuration.max_iteration, 3);
        assert_eq!(
            configuration.empty_seeds_policy(),
            EmptySeedPolicy::Continue
        );
        let layer = &configuration.layers["posts"];
        assert_eq!(layer.connector.name(), Some("csv"));
        assert_eq!(layer.sampler.name(), Some("random"));
    }

    #[test]
    fn missing_seeds_is_a_config_error() {
        let yaml = r#"
layers:
  posts:
    connector: csv
    sampler: random
"#;
        let configuration: Configuration = serde_yaml::from_str(yaml).unwrap();
        let err = configuration.validate().unwrap_err();
        assert!(matches!(err, SpiderError::Config { ref path, .. } if path == "seeds"));
    }

    #[test]
    fn dispatch_to_undeclared_layer_is_rejected() {
        let yaml = r#"
seeds: [A]
layers:
  posts:
    connector: csv
    sampler: random
    routers:
      - source: from
        target:
          - field: mentions
            dispatch_with: users
"#;
        let configuration: Configuration = serde_yaml::from_str(yaml).unwrap();
        let err = configuration.validate().unwrap_err();
        assert!(matches!(err, SpiderError::Config { ref path, .. } if path.contains("dispatch_with")));
    }

    #[test]
    fn flat_seed_list_applies_to_every_layer() {
        let yaml = r#"
seeds: [A, B]
layers:
  one:
    connector: csv
    sampler: random
  two:
    connector: csv
    sampler: random
"#;
        let configuration: Configuration = serde_yaml::from_str(yaml).unwrap();
        let resolved = configuration.resolve_seeds().unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["one"], vec!["A", "B"]);
        assert_eq!(resolved["two"], vec!["A", "B"]);
    }

    #[test]
    fn non_numeric_aggregate_is_rejected() {
        let yaml = r#"
seeds: [A]
layers:
  posts:
    connector: csv
    sampler: random
    edge_agg_table:
      columns:
        kind:
          type: Text
          aggregate: sum
"#;
        let configuration: Configuration = serde_yaml::from_str(yaml).unwrap();
        let err = configuration.validate().unwrap_err();
        assert!(matches!(err, SpiderError::Config { ref path, .. } if path.contains("edge_agg_table")));
    }

    #[test]
    fn seed_file_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeds.txt");
        std::fs::write(&path, "# header\nA\n\nB\n  \n# tail\nC\n").unwrap();
        assert_eq!(read_seed_file(&path).unwrap(), vec!["A", "B", "C"]);
    }
}
