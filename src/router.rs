//! # Router Module
//!
//! Translates one connector record into zero or more typed edges, each
//! addressed to a layer.
//!
//! ## Overview
//!
//! A router is compiled once per layer at startup from its specification:
//! the `source` field, an ordered list of target emitters, and any further
//! keys as extra columns. Compilation validates the shape (patterns must
//! carry exactly one capture group, dispatch targets must be known) so the
//! per-record path is pure map lookups and regex scans.
//!
//! Emission rules:
//! - a record without a usable source value is dropped silently;
//! - a targetspec whose field yields no scalars (or whose pattern never
//!   matches) produces zero edges, which is not an error;
//! - edges come out in targetspec declaration order, then in the order of
//!   the scalars within the field;
//! - `dispatch_with` re-addresses the edge to the named layer and flags the
//!   target for seeding there.

use regex::Regex;
use serde_json::Value;

use crate::config::RouterSpec;
use crate::error::SpiderError;
use crate::record::{NodeId, RawEdge, Record};

enum ExtraSource {
    /// A string value in the spec names a record field to copy.
    Field(String),
    /// Any other scalar is carried verbatim.
    Literal(Value),
}

struct CompiledTarget {
    field: String,
    pattern: Option<Regex>,
    dispatch_with: Option<String>,
    literals: Vec<(String, Value)>,
}

/// A compiled edge router bound to a layer.
pub struct Router {
    layer: String,
    source_field: String,
    targets: Vec<CompiledTarget>,
    extras: Vec<(String, ExtraSource)>,
}

fn node_id_of(value: &Value) -> Option<NodeId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Router {
    /// Compiles a router specification for `layer`, validating its shape.
    pub fn compile(layer: &str, index: usize, spec: &RouterSpec) -> Result<Self, SpiderError> {
        let at = |key: &str| format!("layers.{layer}.routers[{index}].{key}");

        let mut targets = Vec::with_capacity(spec.target.len());
        for (t_index, target) in spec.target.iter().enumerate() {
            let pattern = match &target.pattern {
                None => None,
                Some(raw) => {
                    let regex = Regex::new(raw).map_err(|err| {
                        SpiderError::config(
                            at(&format!("target[{t_index}].pattern")),
                            err.to_string(),
                        )
                    })?;
                    // captures_len counts the implicit whole-match group.
                    if regex.captures_len() != 2 {
                        return Err(SpiderError::config(
                            at(&format!("target[{t_index}].pattern")),
                            "pattern must have exactly one capture group",
                        ));
                    }
                    Some(regex)
                }
            };
            targets.push(CompiledTarget {
                field: target.field.clone(),
                pattern,
                dispatch_with: target.dispatch_with.clone(),
                literals: target
                    .literals
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            });
        }

        let extras = spec
            .extra
            .iter()
            .map(|(column, value)| {
                let source = match value {
                    Value::String(field) => ExtraSource::Field(field.clone()),
                    other => ExtraSource::Literal(other.clone()),
                };
                (column.clone(), source)
            })
            .collect();

        Ok(Router {
            layer: layer.to_string(),
            source_field: spec.source.clone(),
            targets,
            extras,
        })
    }

    /// The record fields this router reads, for validation against the
    /// layer's declared columns.
    pub fn referenced_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.source_field.as_str()];
        fields.extend(self.targets.iter().map(|t| t.field.as_str()));
        fields.extend(self.extras.iter().filter_map(|(_, source)| match source {
            ExtraSource::Field(field) => Some(field.as_str()),
            ExtraSource::Literal(_) => None,
        }));
        fields
    }

    /// Routes one record into edges. Deterministic: identical records yield
    /// identical edges in identical order.
    pub fn route(&self, record: &Record) -> Vec<RawEdge> {
        let Some(source) = record.get(&self.source_field).and_then(node_id_of) else {
            return Vec::new();
        };

        let extras: Vec<(String, Value)> = self
            .extras
            .iter()
            .map(|(column, source)| {
                let value = match source {
                    ExtraSource::Field(field) => {
                        record.get(field).cloned().unwrap_or(Value::Null)
                    }
                    ExtraSource::Literal(value) => value.clone(),
                };
                (column.clone(), value)
            })
            .collect();

        let mut edges = Vec::new();
        for target in &self.targets {
            let layer = target.dispatch_with.as_deref().unwrap_or(&self.layer);
            for scalar in record.scalars(&target.field) {
                match &target.pattern {
                    None => {
                        if let Some(id) = node_id_of(scalar) {
                            edges.push(self.edge(layer, &source, id, target, &extras));
                        }
                    }
                    Some(regex) => {
                        let Some(text) = scalar.as_str() else { continue };
                        for captures in regex.captures_iter(text) {
                            if let Some(capture) = captures.get(1) {
                                edges.push(self.edge(
                                    layer,
                                    &source,
                                    capture.as_str().to_string(),
                                    target,
                                    &extras,
                                ));
                            }
                        }
                    }
                }
            }
        }
        edges
    }

    fn edge(
        &self,
        layer: &str,
        source: &str,
        target_id: NodeId,
        target: &CompiledTarget,
        extras: &[(String, Value)],
    ) -> RawEdge {
        let mut columns = std::collections::BTreeMap::new();
        for (column, value) in &target.literals {
            columns.insert(column.clone(), value.clone());
        }
        // Router-level extras win over targetspec literals on conflict.
        for (column, value) in extras {
            columns.insert(column.clone(), value.clone());
        }
        RawEdge {
            layer: layer.to_string(),
            source: source.to_string(),
            target: target_id,
            columns,
            dispatched: target.dispatch_with.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetSpec;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn spec_yaml(yaml: &str) -> RouterSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn regex_target_emits_one_edge_per_match_in_order() {
        let spec = spec_yaml(
            r#"
source: from
target:
  - field: body
    pattern: "@(\\w+)"
"#,
        );
        let router = Router::compile("posts", 0, &spec).unwrap();
        let edges = router.route(&record(&[
            ("from", json!("a")),
            ("body", json!("see @bob and @carol")),
        ]));
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].target, "bob");
        assert_eq!(edges[1].target, "carol");
        assert!(edges.iter().all(|e| e.source == "a" && e.layer == "posts"));
    }

    #[test]
    fn missing_source_drops_record_silently() {
        let spec = spec_yaml("source: from\ntarget:\n  - field: to\n");
        let router = Router::compile("posts", 0, &spec).unwrap();
        assert!(router.route(&record(&[("to", json!("b"))])).is_empty());
        assert!(router
            .route(&record(&[("from", json!("")), ("to", json!("b"))]))
            .is_empty());
    }

    #[test]
    fn list_fields_emit_per_element() {
        let spec = spec_yaml("source: from\ntarget:\n  - field: mentions\n");
        let router = Router::compile("posts", 0, &spec).unwrap();
        let edges = router.route(&record(&[
            ("from", json!("a")),
            ("mentions", json!(["x", "y"])),
        ]));
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].target, "x");
        assert_eq!(edges[1].target, "y");
    }

    #[test]
    fn dispatch_with_readdresses_the_edge() {
        let spec = spec_yaml(
            r#"
source: from
target:
  - field: mentions
    dispatch_with: users
"#,
        );
        let router = Router::compile("posts", 0, &spec).unwrap();
        let edges = router.route(&record(&[
            ("from", json!("a")),
            ("mentions", json!("bob")),
        ]));
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].layer, "users");
        assert!(edges[0].dispatched);
    }

    #[test]
    fn extras_copy_fields_and_carry_literals() {
        let spec = spec_yaml(
            r#"
source: handle
target:
  - field: text
    pattern: "https://www\\.twitter\\.com/(\\w+)"
    kind: twitter-url
view_count: view_count
"#,
        );
        let router = Router::compile("posts", 0, &spec).unwrap();
        let edges = router.route(&record(&[
            ("handle", json!("Tony")),
            ("text", json!("Check this out: https://www.twitter.com/ernie")),
            ("view_count", json!(123)),
        ]));
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].source, "Tony");
        assert_eq!(edges[0].target, "ernie");
        assert_eq!(edges[0].columns["view_count"], json!(123));
        assert_eq!(edges[0].columns["kind"], json!("twitter-url"));
    }

    #[test]
    fn pattern_without_single_capture_group_is_rejected() {
        let spec = RouterSpec {
            source: "from".into(),
            target: vec![TargetSpec {
                field: "body".into(),
                pattern: Some(r"@\w+".into()),
                dispatch_with: None,
                literals: BTreeMap::new(),
            }],
            extra: BTreeMap::new(),
        };
        assert!(Router::compile("posts", 0, &spec).is_err());
    }

    #[test]
    fn routing_is_deterministic() {
        let spec = spec_yaml(
            r#"
source: from
target:
  - field: body
    pattern: "@(\\w+)"
  - field: mentions
"#,
        );
        let router = Router::compile("posts", 0, &spec).unwrap();
        let input = record(&[
            ("from", json!("a")),
            ("body", json!("@x @y")),
            ("mentions", json!(["m", "n"])),
        ]);
        let first = router.route(&input);
        let second = router.route(&input);
        assert_eq!(first, second);
        let targets: Vec<_> = first.iter().map(|e| e.target.as_str()).collect();
        assert_eq!(targets, vec!["x", "y", "m", "n"]);
    }
}
