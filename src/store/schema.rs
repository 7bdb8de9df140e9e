//! Lazy schema management for the per-layer table families.
//!
//! The global tables (`seeds`, `app_state`, `strategy_state`) are created when
//! the store opens. The per-layer families (`raw_edges_<layer>`,
//! `agg_edges_<layer>`, `nodes_<layer>`) are created on first write to the
//! layer, with the user-declared columns appended to the core columns. When a
//! table already exists from a previous run, missing user columns are added
//! with `ALTER TABLE`.

use std::collections::BTreeMap;

use rusqlite::Connection;

use crate::config::{AggTableConfig, LayerConfig, TableConfig};
use crate::error::SpiderError;
use crate::record::ColumnType;

/// Column declarations of one layer, derived from its configuration.
#[derive(Debug, Clone, Default)]
pub struct LayerSchema {
    pub raw_columns: BTreeMap<String, ColumnType>,
    pub agg_columns: BTreeMap<String, ColumnType>,
    pub node_columns: BTreeMap<String, ColumnType>,
}

impl LayerSchema {
    pub fn from_config(layer: &LayerConfig) -> Self {
        let table_columns = |table: &TableConfig| table.columns.clone();
        let agg_columns = |table: &AggTableConfig| {
            table
                .columns
                .iter()
                .map(|(name, column)| (name.clone(), column.column_type))
                .collect()
        };
        LayerSchema {
            raw_columns: table_columns(&layer.edge_raw_table),
            agg_columns: agg_columns(&layer.edge_agg_table),
            node_columns: table_columns(&layer.node_table),
        }
    }
}

/// Validates that a name is safe to splice into an SQL identifier.
pub fn check_identifier(kind: &str, name: &str) -> Result<(), SpiderError> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if head_ok && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Ok(());
    }
    Err(SpiderError::config(
        kind.to_string(),
        format!("`{name}` is not a valid identifier (use letters, digits, underscores)"),
    ))
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Text => "TEXT",
        ColumnType::Integer => "INTEGER",
    }
}

pub fn raw_edges_table(layer: &str) -> String {
    format!("raw_edges_{layer}")
}

pub fn agg_edges_table(layer: &str) -> String {
    format!("agg_edges_{layer}")
}

pub fn nodes_table(layer: &str) -> String {
    format!("nodes_{layer}")
}

/// Creates the global tables. Idempotent.
pub fn create_global_tables(conn: &Connection) -> Result<(), SpiderError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS seeds (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            layer      TEXT NOT NULL,
            node_id    TEXT NOT NULL,
            iteration  INTEGER NOT NULL,
            status     TEXT NOT NULL DEFAULT 'pending',
            visited_at TEXT,
            UNIQUE (layer, node_id)
        );
        CREATE INDEX IF NOT EXISTS seeds_by_status ON seeds (layer, status, id);

        CREATE TABLE IF NOT EXISTS app_state (
            id            INTEGER PRIMARY KEY CHECK (id = 1),
            iteration     INTEGER NOT NULL,
            max_iteration INTEGER NOT NULL,
            phase         TEXT NOT NULL,
            last_updated  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS strategy_state (
            layer    TEXT NOT NULL,
            strategy TEXT NOT NULL,
            position INTEGER NOT NULL,
            data     TEXT NOT NULL,
            PRIMARY KEY (layer, strategy, position)
        );
        "#,
    )?;
    Ok(())
}

/// Creates (or upgrades) the three per-layer tables.
pub fn create_layer_tables(
    conn: &Connection,
    layer: &str,
    schema: &LayerSchema,
) -> Result<(), SpiderError> {
    check_identifier("layer", layer)?;
    for name in schema
        .raw_columns
        .keys()
        .chain(schema.agg_columns.keys())
        .chain(schema.node_columns.keys())
    {
        check_identifier("column", name)?;
    }

    let raw = raw_edges_table(layer);
    conn.execute(
        &format!(
            r#"CREATE TABLE IF NOT EXISTS "{raw}" (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                iteration INTEGER NOT NULL,
                source    TEXT NOT NULL,
                target    TEXT NOT NULL
            )"#
        ),
        [],
    )?;
    conn.execute(
        &format!(r#"CREATE INDEX IF NOT EXISTS "{raw}_by_pair" ON "{raw}" (source, target)"#),
        [],
    )?;
    add_missing_columns(conn, &raw, &schema.raw_columns)?;

    let agg = agg_edges_table(layer);
    conn.execute(
        &format!(
            r#"CREATE TABLE IF NOT EXISTS "{agg}" (
                source    TEXT NOT NULL,
                target    TEXT NOT NULL,
                weight    INTEGER NOT NULL,
                iteration INTEGER NOT NULL,
                PRIMARY KEY (source, target)
            )"#
        ),
        [],
    )?;
    add_missing_columns(conn, &agg, &schema.agg_columns)?;

    let nodes = nodes_table(layer);
    conn.execute(
        &format!(
            r#"CREATE TABLE IF NOT EXISTS "{nodes}" (
                name      TEXT PRIMARY KEY,
                iteration INTEGER NOT NULL,
                sampled   INTEGER NOT NULL DEFAULT 0
            )"#
        ),
        [],
    )?;
    add_missing_columns(conn, &nodes, &schema.node_columns)?;

    Ok(())
}

fn add_missing_columns(
    conn: &Connection,
    table: &str,
    columns: &BTreeMap<String, ColumnType>,
) -> Result<(), SpiderError> {
    if columns.is_empty() {
        return Ok(());
    }
    let mut existing = Vec::new();
    let mut stmt = conn.prepare(&format!(r#"PRAGMA table_info("{table}")"#))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        existing.push(row.get::<_, String>(1)?);
    }
    drop(rows);
    drop(stmt);

    for (name, column_type) in columns {
        if existing.iter().any(|have| have == name) {
            continue;
        }
        conn.execute(
            &format!(
                r#"ALTER TABLE "{table}" ADD COLUMN "{name}" {}"#,
                sql_type(*column_type)
            ),
            [],
        )?;
    }
    Ok(())
}
