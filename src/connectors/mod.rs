//! Built-in connectors.
//!
//! Only the CSV connector ships with the engine; network connectors register
//! through [`crate::plugin::PluginRegistry`] from external crates.

mod csv;

pub use csv::CsvConnector;
