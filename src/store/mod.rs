//! # Store Module
//!
//! Durable, table-oriented storage with per-iteration atomicity, backed by
//! SQLite.
//!
//! ## Overview
//!
//! The store owns five table families: per layer `raw_edges_<layer>` (the
//! append-only dense edge log), `agg_edges_<layer>` (the sampled aggregated
//! edges), and `nodes_<layer>` (dense nodes, with a `sampled` flag marking
//! the sparse subset); plus the global `seeds`, `app_state`, and
//! `strategy_state` tables. Per-layer tables are created lazily on first
//! write, with user-declared columns appended (see [`schema`]).
//!
//! All multi-row mutations run inside a scoped [`SqliteStore::transaction`];
//! nested calls share the outermost scope, so either every write of an
//! iteration boundary commits or none does. Constraint violations surface as
//! configuration errors; transport problems surface as retryable store
//! errors.

pub mod schema;
pub mod seeds;

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::SpiderError;
use crate::record::{AggregatedEdge, Frame, RawEdge, Record};
pub use schema::LayerSchema;

/// The singleton engine state row.
#[derive(Debug, Clone, PartialEq)]
pub struct AppState {
    pub iteration: i64,
    pub max_iteration: i64,
    pub phase: String,
    pub last_updated: String,
}

pub struct SqliteStore {
    pub(crate) conn: Connection,
    layers: BTreeMap<String, LayerSchema>,
    ready_layers: HashSet<String>,
    seed_cache: moka::sync::Cache<String, bool>,
    tx_depth: u32,
}

fn timestamp_now() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn value_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        // Structured values are stored as their JSON text.
        other => SqlValue::Text(other.to_string()),
    }
}

pub(crate) fn sql_to_value(value: rusqlite::types::ValueRef<'_>) -> Value {
    match value {
        rusqlite::types::ValueRef::Null => Value::Null,
        rusqlite::types::ValueRef::Integer(i) => Value::from(i),
        rusqlite::types::ValueRef::Real(f) => {
            serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        rusqlite::types::ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        rusqlite::types::ValueRef::Blob(_) => Value::Null,
    }
}

impl SqliteStore {
    /// Opens the store. An empty or absent `db_url` yields an in-memory
    /// database; otherwise the url is treated as a file path (a
    /// `sqlite://`-style prefix is stripped).
    pub fn open(
        db_url: Option<&str>,
        layers: BTreeMap<String, LayerSchema>,
    ) -> Result<Self, SpiderError> {
        let conn = match db_url.filter(|url| !url.is_empty()) {
            None => {
                info!("opening in-memory store");
                Connection::open_in_memory()?
            }
            Some(url) => {
                let path = url
                    .trim_start_matches("sqlite:///")
                    .trim_start_matches("sqlite://");
                info!("opening store at {}", path);
                let conn = Connection::open(path)?;
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn
            }
        };
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::create_global_tables(&conn)?;

        Ok(SqliteStore {
            conn,
            layers,
            ready_layers: HashSet::new(),
            seed_cache: moka::sync::Cache::builder().max_capacity(100_000).build(),
            tx_depth: 0,
        })
    }

    /// Scoped transaction; nested calls share the outermost scope.
    pub fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, SpiderError>,
    ) -> Result<T, SpiderError> {
        if self.tx_depth == 0 {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        self.tx_depth += 1;
        let result = f(self);
        self.tx_depth -= 1;
        if self.tx_depth == 0 {
            match result {
                Ok(_) => self.conn.execute_batch("COMMIT")?,
                Err(_) => {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    // The dedupe cache may hold keys whose rows just
                    // vanished with the rollback.
                    self.seed_cache.invalidate_all();
                }
            }
        }
        result
    }

    /// Rolls back the open transaction scope, if any. Used when a
    /// cancellation is latched mid-batch.
    pub fn rollback(&mut self) {
        if self.tx_depth > 0 {
            self.tx_depth = 0;
            let _ = self.conn.execute_batch("ROLLBACK");
            self.seed_cache.invalidate_all();
        }
    }

    pub(crate) fn layer_schema(&self, layer: &str) -> Result<&LayerSchema, SpiderError> {
        self.layers.get(layer).ok_or_else(|| {
            SpiderError::config(format!("layers.{layer}"), "layer is not declared")
        })
    }

    /// Creates the layer's tables if this is the first write to it.
    pub(crate) fn ensure_layer(&mut self, layer: &str) -> Result<(), SpiderError> {
        if self.ready_layers.contains(layer) {
            return Ok(());
        }
        let layer_schema = self.layer_schema(layer)?.clone();
        schema::create_layer_tables(&self.conn, layer, &layer_schema)?;
        self.ready_layers.insert(layer.to_string());
        debug!("layer `{}` tables ready", layer);
        Ok(())
    }

    /// Inserts or replaces node rows by name. Dense writes pass
    /// `sampled = false`; a row already marked sampled stays sampled.
    pub fn upsert_nodes(
        &mut self,
        layer: &str,
        frame: &Frame,
        iteration: i64,
        sampled: bool,
    ) -> Result<usize, SpiderError> {
        if frame.is_empty() {
            return Ok(0);
        }
        self.ensure_layer(layer)?;
        let columns: Vec<String> = self.layer_schema(layer)?.node_columns.keys().cloned().collect();
        let table = schema::nodes_table(layer);

        let user_cols: String = columns.iter().map(|c| format!(r#", "{c}""#)).collect();
        let user_params: String = (0..columns.len()).map(|i| format!(", ?{}", i + 4)).collect::<String>();
        let user_updates: String = columns
            .iter()
            .map(|c| format!(r#", "{c}" = excluded."{c}""#))
            .collect();
        let sql = format!(
            r#"INSERT INTO "{table}" (name, iteration, sampled{user_cols})
               VALUES (?1, ?2, ?3{user_params})
               ON CONFLICT (name) DO UPDATE SET
                   iteration = excluded.iteration,
                   sampled = MAX(sampled, excluded.sampled){user_updates}"#
        );

        self.transaction(|store| {
            let mut written = 0;
            let mut stmt = store.conn.prepare_cached(&sql)?;
            for row in &frame.rows {
                let Some(name) = row.get_str("name") else {
                    continue;
                };
                let mut params: Vec<SqlValue> = vec![
                    SqlValue::Text(name.to_string()),
                    SqlValue::Integer(iteration),
                    SqlValue::Integer(sampled as i64),
                ];
                for column in &columns {
                    params.push(value_to_sql(row.get(column).unwrap_or(&Value::Null)));
                }
                stmt.execute(params_from_iter(params))?;
                written += 1;
            }
            Ok(written)
        })
    }

    /// Appends raw edges in emission order. Edges may address any declared
    /// layer (cross-layer dispatch), so rows are grouped by their layer tag.
    pub fn append_raw_edges(
        &mut self,
        edges: &[RawEdge],
        iteration: i64,
    ) -> Result<usize, SpiderError> {
        if edges.is_empty() {
            return Ok(0);
        }
        let mut layers: Vec<&str> = edges.iter().map(|e| e.layer.as_str()).collect();
        layers.sort_unstable();
        layers.dedup();
        for layer in &layers {
            self.ensure_layer(layer)?;
        }

        self.transaction(|store| {
            let mut written = 0;
            for edge in edges {
                let columns: Vec<String> =
                    store.layer_schema(&edge.layer)?.raw_columns.keys().cloned().collect();
                let table = schema::raw_edges_table(&edge.layer);
                let user_cols: String = columns.iter().map(|c| format!(r#", "{c}""#)).collect();
                let user_params: String =
                    (0..columns.len()).map(|i| format!(", ?{}", i + 4)).collect();
                let sql = format!(
                    r#"INSERT INTO "{table}" (iteration, source, target{user_cols})
                       VALUES (?1, ?2, ?3{user_params})"#
                );
                let mut params: Vec<SqlValue> = vec![
                    SqlValue::Integer(iteration),
                    SqlValue::Text(edge.source.clone()),
                    SqlValue::Text(edge.target.clone()),
                ];
                for column in &columns {
                    params.push(value_to_sql(edge.columns.get(column).unwrap_or(&Value::Null)));
                }
                let mut stmt = store.conn.prepare_cached(&sql)?;
                stmt.execute(params_from_iter(params))?;
                written += 1;
            }
            Ok(written)
        })
    }

    /// Replaces sampled aggregated edges by (source, target).
    pub fn upsert_aggregated_edges(
        &mut self,
        layer: &str,
        edges: &[AggregatedEdge],
        iteration: i64,
    ) -> Result<usize, SpiderError> {
        if edges.is_empty() {
            return Ok(0);
        }
        self.ensure_layer(layer)?;
        let columns: Vec<String> = self.layer_schema(layer)?.agg_columns.keys().cloned().collect();
        let table = schema::agg_edges_table(layer);
        let user_cols: String = columns.iter().map(|c| format!(r#", "{c}""#)).collect();
        let user_params: String = (0..columns.len()).map(|i| format!(", ?{}", i + 5)).collect();
        let user_updates: String = columns
            .iter()
            .map(|c| format!(r#", "{c}" = excluded."{c}""#))
            .collect();
        let sql = format!(
            r#"INSERT INTO "{table}" (source, target, weight, iteration{user_cols})
               VALUES (?1, ?2, ?3, ?4{user_params})
               ON CONFLICT (source, target) DO UPDATE SET
                   weight = excluded.weight,
                   iteration = excluded.iteration{user_updates}"#
        );

        self.transaction(|store| {
            let mut written = 0;
            let mut stmt = store.conn.prepare_cached(&sql)?;
            for edge in edges {
                let mut params: Vec<SqlValue> = vec![
                    SqlValue::Text(edge.source.clone()),
                    SqlValue::Text(edge.target.clone()),
                    SqlValue::Integer(edge.weight),
                    SqlValue::Integer(iteration),
                ];
                for column in &columns {
                    params.push(value_to_sql(edge.columns.get(column).unwrap_or(&Value::Null)));
                }
                stmt.execute(params_from_iter(params))?;
                written += 1;
            }
            Ok(written)
        })
    }

    /// The sparse view of a layer: its sampled aggregated edges and the nodes
    /// flagged as sampled.
    pub fn read_layer_frame(
        &mut self,
        layer: &str,
    ) -> Result<(Vec<AggregatedEdge>, Frame), SpiderError> {
        self.ensure_layer(layer)?;
        let columns: Vec<String> = self.layer_schema(layer)?.agg_columns.keys().cloned().collect();
        let table = schema::agg_edges_table(layer);
        let user_cols: String = columns.iter().map(|c| format!(r#", "{c}""#)).collect();
        let sql =
            format!(r#"SELECT source, target, weight{user_cols} FROM "{table}" ORDER BY rowid"#);

        let mut edges = Vec::new();
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut edge_columns = BTreeMap::new();
            for (index, column) in columns.iter().enumerate() {
                edge_columns.insert(column.clone(), sql_to_value(row.get_ref(index + 3)?));
            }
            edges.push(AggregatedEdge {
                layer: layer.to_string(),
                source: row.get(0)?,
                target: row.get(1)?,
                weight: row.get(2)?,
                columns: edge_columns,
            });
        }
        drop(rows);
        drop(stmt);

        let nodes = self.read_nodes(layer, true)?;
        Ok((edges, nodes))
    }

    /// The dense node frame of a layer (every node the connectors described).
    pub fn read_node_frame(&mut self, layer: &str) -> Result<Frame, SpiderError> {
        self.read_nodes(layer, false)
    }

    fn read_nodes(&mut self, layer: &str, sampled_only: bool) -> Result<Frame, SpiderError> {
        self.ensure_layer(layer)?;
        let columns: Vec<String> = self.layer_schema(layer)?.node_columns.keys().cloned().collect();
        let table = schema::nodes_table(layer);
        let user_cols: String = columns.iter().map(|c| format!(r#", "{c}""#)).collect();
        let filter = if sampled_only { "WHERE sampled = 1" } else { "" };
        let sql = format!(r#"SELECT name{user_cols} FROM "{table}" {filter} ORDER BY name"#);

        let mut frame = Frame::new();
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            record.insert("name", row.get::<_, String>(0)?);
            for (index, column) in columns.iter().enumerate() {
                record.0.insert(column.clone(), sql_to_value(row.get_ref(index + 1)?));
            }
            frame.push(record);
        }
        Ok(frame)
    }

    /// Layers that received raw edges during `iteration`.
    pub fn touched_layers(&mut self, iteration: i64) -> Result<Vec<String>, SpiderError> {
        let layers: Vec<String> = self.layers.keys().cloned().collect();
        let mut touched = Vec::new();
        for layer in layers {
            if !self.ready_layers.contains(&layer) {
                continue;
            }
            let table = schema::raw_edges_table(&layer);
            let sql = format!(r#"SELECT EXISTS (SELECT 1 FROM "{table}" WHERE iteration = ?1)"#);
            let hit: bool = self.conn.query_row(&sql, [iteration], |row| row.get(0))?;
            if hit {
                touched.push(layer);
            }
        }
        Ok(touched)
    }

    pub fn load_state(&self) -> Result<Option<AppState>, SpiderError> {
        use rusqlite::OptionalExtension;
        let state = self
            .conn
            .query_row(
                "SELECT iteration, max_iteration, phase, last_updated FROM app_state WHERE id = 1",
                [],
                |row| {
                    Ok(AppState {
                        iteration: row.get(0)?,
                        max_iteration: row.get(1)?,
                        phase: row.get(2)?,
                        last_updated: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    /// Writes the singleton state row. The stored iteration is monotonically
    /// non-decreasing.
    pub fn save_state(&mut self, iteration: i64, max_iteration: i64, phase: &str) -> Result<(), SpiderError> {
        self.conn.execute(
            r#"INSERT INTO app_state (id, iteration, max_iteration, phase, last_updated)
               VALUES (1, ?1, ?2, ?3, ?4)
               ON CONFLICT (id) DO UPDATE SET
                   iteration = MAX(iteration, excluded.iteration),
                   max_iteration = excluded.max_iteration,
                   phase = excluded.phase,
                   last_updated = excluded.last_updated"#,
            rusqlite::params![iteration, max_iteration, phase, timestamp_now()],
        )?;
        Ok(())
    }

    /// The strategy's previous state rows for a layer, oldest first.
    pub fn read_strategy_state(
        &mut self,
        layer: &str,
        strategy: &str,
    ) -> Result<Vec<Record>, SpiderError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT data FROM strategy_state WHERE layer = ?1 AND strategy = ?2 ORDER BY position",
        )?;
        let mut rows = stmt.query(rusqlite::params![layer, strategy])?;
        let mut state = Vec::new();
        while let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            let value: Value = serde_json::from_str(&text)
                .map_err(|err| SpiderError::Store(format!("corrupt strategy state: {err}")))?;
            if let Value::Object(map) = value {
                state.push(map.into_iter().collect());
            }
        }
        Ok(state)
    }

    /// Clears the old state rows and writes the replacement set.
    pub fn replace_strategy_state(
        &mut self,
        layer: &str,
        strategy: &str,
        rows: &[Record],
    ) -> Result<(), SpiderError> {
        self.transaction(|store| {
            store.conn.execute(
                "DELETE FROM strategy_state WHERE layer = ?1 AND strategy = ?2",
                rusqlite::params![layer, strategy],
            )?;
            let mut stmt = store.conn.prepare_cached(
                "INSERT INTO strategy_state (layer, strategy, position, data) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (position, record) in rows.iter().enumerate() {
                let data = serde_json::to_string(&record.0)?;
                stmt.execute(rusqlite::params![layer, strategy, position as i64, data])?;
            }
            Ok(())
        })
    }

    pub(crate) fn seed_cache(&self) -> &moka::sync::Cache<String, bool> {
        &self.seed_cache
    }

    /// Whether the layer's tables have been created this run.
    pub(crate) fn layer_is_ready(&self, layer: &str) -> bool {
        self.ready_layers.contains(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ColumnType;
    use serde_json::json;

    fn store_with_layer() -> SqliteStore {
        let mut layer_schema = LayerSchema::default();
        layer_schema.raw_columns.insert("views".to_string(), ColumnType::Integer);
        layer_schema.agg_columns.insert("views".to_string(), ColumnType::Integer);
        layer_schema.node_columns.insert("kind".to_string(), ColumnType::Text);
        let layers = BTreeMap::from([("posts".to_string(), layer_schema)]);
        SqliteStore::open(None, layers).unwrap()
    }

    fn edge(source: &str, target: &str, views: i64) -> RawEdge {
        RawEdge {
            layer: "posts".to_string(),
            source: source.to_string(),
            target: target.to_string(),
            columns: BTreeMap::from([("views".to_string(), json!(views))]),
            dispatched: false,
        }
    }

    #[test]
    fn raw_edges_append_in_order() {
        let mut store = store_with_layer();
        store
            .append_raw_edges(&[edge("a", "b", 1), edge("a", "c", 2), edge("a", "b", 3)], 0)
            .unwrap();
        let rows: Vec<(String, i64)> = {
            let mut stmt = store
                .conn
                .prepare(r#"SELECT target, views FROM "raw_edges_posts" ORDER BY id"#)
                .unwrap();
            let result = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();
            result
        };
        assert_eq!(rows, vec![("b".into(), 1), ("c".into(), 2), ("b".into(), 3)]);
    }

    #[test]
    fn node_upsert_keeps_sampled_flag() {
        let mut store = store_with_layer();
        let frame = Frame::from_rows(vec![[
            ("name".to_string(), json!("a")),
            ("kind".to_string(), json!("post")),
        ]
        .into_iter()
        .collect()]);
        store.upsert_nodes("posts", &frame, 0, true).unwrap();
        store.upsert_nodes("posts", &frame, 1, false).unwrap();
        let (_, nodes) = store.read_layer_frame("posts").unwrap();
        assert_eq!(nodes.len(), 1, "a dense re-observation must not unsample");
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let mut store = store_with_layer();
        let result: Result<(), SpiderError> = store.transaction(|s| {
            s.append_raw_edges(&[edge("a", "b", 1)], 0)?;
            Err(SpiderError::Store("boom".into()))
        });
        assert!(result.is_err());
        let count: i64 = store
            .conn
            .query_row(r#"SELECT COUNT(*) FROM "raw_edges_posts""#, [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn app_state_iteration_is_monotonic() {
        let mut store = store_with_layer();
        store.save_state(3, 10, "gathering").unwrap();
        store.save_state(1, 10, "stopping").unwrap();
        let state = store.load_state().unwrap().unwrap();
        assert_eq!(state.iteration, 3);
        assert_eq!(state.phase, "stopping");
    }

    #[test]
    fn strategy_state_is_replaced_wholesale() {
        let mut store = store_with_layer();
        let old = vec![[("node_id".to_string(), json!("a"))].into_iter().collect()];
        let new = vec![
            [("node_id".to_string(), json!("b"))].into_iter().collect(),
            [("node_id".to_string(), json!("c"))].into_iter().collect(),
        ];
        store.replace_strategy_state("posts", "random", &old).unwrap();
        store.replace_strategy_state("posts", "random", &new).unwrap();
        let state = store.read_strategy_state("posts", "random").unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(state[0].get_str("node_id"), Some("b"));
    }
}
