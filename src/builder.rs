//! # Builder Module
//!
//! Provides the `SpiderBuilder`, a fluent API for assembling a configured
//! [`Spider`] from a project file, a plug-in registry, and tuning knobs.
//!
//! ## Overview
//!
//! The builder is where all startup validation happens: the configuration is
//! checked, every referenced plug-in name is resolved against the registry,
//! routers are compiled, and each strategy pre-validates its configuration
//! against the layer's table schemas. A `Spider` that builds successfully
//! will not fail on name resolution at crawl time.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spiderexpress::SpiderBuilder;
//!
//! let spider = SpiderBuilder::new()
//!     .with_configuration_file("project.yml".as_ref())?
//!     .max_concurrent_batches(4)
//!     .build()?;
//! spider.run().await?;
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::aggregate::Aggregator;
use crate::config::Configuration;
use crate::error::SpiderError;
use crate::plugin::{Connector, ConnectorAdapter, PluginRegistry, Strategy, StrategyAdapter};
use crate::spider::Spider;
use crate::stats::StatCollector;
use crate::store::{LayerSchema, SqliteStore};

pub struct SpiderBuilder {
    configuration: Option<Configuration>,
    registry: PluginRegistry,
    max_concurrent_batches: usize,
    channel_capacity: usize,
}

impl Default for SpiderBuilder {
    fn default() -> Self {
        SpiderBuilder {
            configuration: None,
            registry: PluginRegistry::with_builtins(),
            max_concurrent_batches: num_cpus::get().clamp(2, 8),
            channel_capacity: 32,
        }
    }
}

impl SpiderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an already constructed (and thereby validated) configuration.
    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    /// Loads and validates a project file.
    pub fn with_configuration_file(mut self, path: &Path) -> Result<Self, SpiderError> {
        self.configuration = Some(Configuration::load(path)?);
        Ok(self)
    }

    /// Registers an additional connector plug-in.
    pub fn register_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.registry.register_connector(connector);
        self
    }

    /// Registers an additional strategy plug-in.
    pub fn register_strategy(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.registry.register_strategy(strategy);
        self
    }

    /// Caps how many connector batches may be in flight at once.
    pub fn max_concurrent_batches(mut self, limit: usize) -> Self {
        self.max_concurrent_batches = limit;
        self
    }

    /// Capacity of the channel between connector tasks and the store writer.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Resolves plug-ins, compiles routers, and opens the store.
    pub fn build(self) -> Result<Spider, SpiderError> {
        let configuration = self
            .configuration
            .ok_or_else(|| SpiderError::config("configuration", "no configuration provided"))?;
        configuration.validate()?;
        if self.max_concurrent_batches == 0 {
            return Err(SpiderError::config(
                "max_concurrent_batches",
                "must be greater than 0",
            ));
        }

        let schemas: BTreeMap<String, LayerSchema> = configuration
            .layers
            .iter()
            .map(|(name, layer)| (name.clone(), LayerSchema::from_config(layer)))
            .collect();

        let mut connectors = BTreeMap::new();
        let mut strategies = BTreeMap::new();
        for (name, layer) in &configuration.layers {
            connectors.insert(
                name.clone(),
                Arc::new(ConnectorAdapter::bind(name, layer, &self.registry)?),
            );
            strategies.insert(
                name.clone(),
                StrategyAdapter::bind(
                    name,
                    layer,
                    &self.registry,
                    &schemas[name],
                    configuration.random_seed,
                )?,
            );
        }

        let store = SqliteStore::open(configuration.db_url.as_deref(), schemas)?;
        let aggregator = Aggregator::new(&configuration);
        let stats = Arc::new(StatCollector::new());

        Ok(Spider::new(
            configuration,
            store,
            connectors,
            strategies,
            aggregator,
            stats,
            self.max_concurrent_batches,
            self.channel_capacity,
        ))
    }
}
