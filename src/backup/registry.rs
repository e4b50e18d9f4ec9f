use crate::backup::adapter::{Adapter, AdapterConfig};
use crate::backup::process::CommandRunner;
use std::sync::Arc;

/// Adapters in the order they were declared.
pub struct AdapterRegistry {
    adapters: Vec<Box<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new(adapters: Vec<Box<dyn Adapter>>) -> Self {
        Self { adapters }
    }

    /// All adapters share one runner.
    pub fn from_configs(configs: &[AdapterConfig], runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(configs.iter().map(|c| c.build(runner.clone())).collect())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &dyn Adapter> {
        self.adapters
            .iter()
            .map(|a| a.as_ref())
            .filter(|a| a.is_enabled())
    }
}
