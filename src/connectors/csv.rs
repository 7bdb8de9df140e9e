//! A CSV-reading, network-rippin' connector for testing and offline runs.
//!
//! Reads an edge list (and optionally a node list) from disk and serves the
//! rows matching the requested batch. `mode` selects the match side: `in`
//! (target in batch), `out` (source in batch), or `both`. Parsed files are
//! cached in-process between batches unless `cache: false`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::error::SpiderError;
use crate::plugin::Connector;
use crate::record::{Frame, NodeId, Record};

#[derive(Debug, Deserialize)]
struct CsvConnectorConfiguration {
    edge_list_location: String,
    mode: String,
    #[serde(default)]
    node_list_location: Option<String>,
    #[serde(default = "default_cache")]
    cache: bool,
}

fn default_cache() -> bool {
    true
}

pub struct CsvConnector {
    cache: Mutex<HashMap<String, Frame>>,
}

impl CsvConnector {
    pub fn new() -> Self {
        CsvConnector {
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn load(&self, location: &str, use_cache: bool) -> Result<Frame, SpiderError> {
        if use_cache {
            if let Some(frame) = self.cache.lock().await.get(location) {
                return Ok(frame.clone());
            }
        }
        let frame = read_csv(Path::new(location))?;
        if use_cache {
            self.cache
                .lock()
                .await
                .insert(location.to_string(), frame.clone());
        }
        Ok(frame)
    }
}

impl Default for CsvConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for CsvConnector {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn default_configuration(&self) -> Value {
        json!({
            "edge_list_location": "",
            "node_list_location": null,
            "mode": "in",
            "cache": true,
        })
    }

    async fn fetch(
        &self,
        node_ids: &[NodeId],
        configuration: &Value,
    ) -> Result<(Frame, Frame), SpiderError> {
        let configuration: CsvConnectorConfiguration =
            serde_json::from_value(configuration.clone()).map_err(|err| {
                SpiderError::config("connector.csv", err.to_string())
            })?;

        let edges = self
            .load(&configuration.edge_list_location, configuration.cache)
            .await?;
        let matches = |row: &Record, field: &str| {
            row.get_str(field)
                .map(|value| node_ids.iter().any(|id| id == value))
                .unwrap_or(false)
        };
        let selected: Vec<Record> = match configuration.mode.as_str() {
            "in" => edges.rows.iter().filter(|r| matches(r, "target")).cloned().collect(),
            "out" => edges.rows.iter().filter(|r| matches(r, "source")).cloned().collect(),
            "both" => edges
                .rows
                .iter()
                .filter(|r| matches(r, "source") || matches(r, "target"))
                .cloned()
                .collect(),
            other => {
                return Err(SpiderError::config(
                    "connector.csv.mode",
                    format!("`{other}` is not one of `in`, `out` or `both`"),
                ))
            }
        };

        let nodes = match &configuration.node_list_location {
            Some(location) if !location.is_empty() => {
                let all = self.load(location, configuration.cache).await?;
                Frame::from_rows(
                    all.rows
                        .iter()
                        .filter(|row| {
                            row.get_str("name")
                                .map(|name| node_ids.iter().any(|id| id == name))
                                .unwrap_or(false)
                        })
                        .cloned()
                        .collect(),
                )
            }
            _ => Frame::new(),
        };

        Ok((Frame::from_rows(selected), nodes))
    }
}

/// Minimal CSV reader: header row, comma-separated, values kept as text
/// (quoting with `"` supported, no embedded newlines).
fn read_csv(path: &Path) -> Result<Frame, SpiderError> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| SpiderError::TransientIo(format!("{}: {err}", path.display())))?;
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let Some(header_line) = lines.next() else {
        return Ok(Frame::new());
    };
    let header: Vec<String> = split_csv_line(header_line);

    let mut frame = Frame::new();
    for line in lines {
        let cells = split_csv_line(line);
        let mut record = Record::new();
        for (column, cell) in header.iter().zip(cells) {
            record.insert(column.clone(), Value::String(cell));
        }
        frame.push(record);
    }
    Ok(frame)
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => {
                cells.push(std::mem::take(&mut cell));
            }
            _ => cell.push(c),
        }
    }
    cells.push(cell);
    cells
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_edges(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("edges.csv");
        std::fs::write(&path, "source,target,views\nA,B,10\nA,C,0\nB,D,5\n").unwrap();
        path.to_string_lossy().into_owned()
    }

    fn configuration(location: &str, mode: &str) -> Value {
        json!({"edge_list_location": location, "mode": mode, "cache": false})
    }

    #[tokio::test]
    async fn out_mode_selects_rows_by_source() {
        let dir = tempfile::tempdir().unwrap();
        let location = write_edges(&dir);
        let connector = CsvConnector::new();
        let (edges, nodes) = connector
            .fetch(&["A".to_string()], &configuration(&location, "out"))
            .await
            .unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges.rows[0].get_str("target"), Some("B"));
        assert_eq!(edges.rows[1].get_str("target"), Some("C"));
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn both_mode_selects_either_side() {
        let dir = tempfile::tempdir().unwrap();
        let location = write_edges(&dir);
        let connector = CsvConnector::new();
        let (edges, _) = connector
            .fetch(&["B".to_string()], &configuration(&location, "both"))
            .await
            .unwrap();
        assert_eq!(edges.len(), 2);
    }

    #[tokio::test]
    async fn unknown_mode_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let location = write_edges(&dir);
        let connector = CsvConnector::new();
        let result = connector
            .fetch(&["A".to_string()], &configuration(&location, "sideways"))
            .await;
        assert!(matches!(result, Err(SpiderError::Config { .. })));
    }

    #[test]
    fn quoted_cells_parse() {
        let cells = split_csv_line(r#"a,"b,c","say ""hi""""#);
        assert_eq!(cells, vec!["a", "b,c", r#"say "hi""#]);
    }
}
