//! # spiderexpress
//!
//! A network-sampling engine: a crawler whose frontier is driven by a
//! pluggable statistical sampling strategy, and whose data sources are
//! pluggable connectors returning tabular edge and node data.
//!
//! Provides the main components: `Spider`, `SpiderBuilder`, the `Connector`
//! and `Strategy` plug-in traits, and the SQLite-backed store that makes
//! long-running crawls resumable.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spiderexpress::SpiderBuilder;
//!
//! async fn run_crawl() -> Result<(), spiderexpress::SpiderError> {
//!     let spider = SpiderBuilder::new()
//!         .with_configuration_file("project.yml".as_ref())?
//!         .build()?;
//!     spider.run().await?;
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod builder;
pub mod cli;
pub mod config;
pub mod connectors;
pub mod error;
pub mod plugin;
pub mod record;
pub mod router;
pub mod spider;
pub mod stats;
pub mod store;
pub mod strategies;

pub use builder::SpiderBuilder;
pub use config::Configuration;
pub use error::SpiderError;
pub use plugin::{Connector, PluginRegistry, Strategy, StrategyInput, StrategyOutcome};
pub use record::{Frame, NodeId, RawEdge, Record};
pub use router::Router;
pub use spider::{Phase, Spider};
pub use stats::StatCollector;
pub use store::SqliteStore;

pub use async_trait::async_trait;
pub use tokio;
