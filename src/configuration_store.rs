//! A thread-safe in-memory storage for the currently active experiments configuration.
//! [`ConfigurationStore`] provides concurrent access for readers (assignment resolution) and
//! writers (whatever process loads configuration).
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::{
    experiment::{ExperimentConfig, ExperimentsConfig},
    source::ExperimentConfigSource,
    Result,
};

/// `ConfigurationStore` provides a thread-safe (`Sync`) storage for experiments configuration that
/// allows concurrent access for readers and writers.
///
/// `ExperimentsConfig` itself is immutable and can only be replaced completely.
#[derive(Default)]
pub struct ConfigurationStore {
    configuration: RwLock<Option<Arc<ExperimentsConfig>>>,
}

impl ConfigurationStore {
    /// Create a new empty configuration store.
    pub fn new() -> Self {
        ConfigurationStore::default()
    }

    /// Create a store holding `config`.
    pub fn with_configuration(config: ExperimentsConfig) -> Self {
        let store = ConfigurationStore::new();
        store.set_configuration(Arc::new(config));
        store
    }

    /// Get currently-active configuration. Returns None if configuration hasn't been stored yet.
    pub fn get_configuration(&self) -> Option<Arc<ExperimentsConfig>> {
        // A writer only swaps an `Arc`, so a poisoned lock still holds a consistent value.
        let configuration = self
            .configuration
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        configuration.clone()
    }

    /// Set new configuration.
    pub fn set_configuration(&self, config: Arc<ExperimentsConfig>) {
        let mut configuration_slot = self
            .configuration
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        *configuration_slot = Some(config);
    }
}

#[async_trait]
impl ExperimentConfigSource for ConfigurationStore {
    async fn get_experiment_config(
        &self,
        org_id: &str,
        experiment_key: &str,
    ) -> Result<Option<ExperimentConfig>> {
        let Some(configuration) = self.get_configuration() else {
            log::warn!(target: "tokpulse", org_id, experiment_key; "resolving an experiment before configuration has been loaded");
            // Missing configuration is treated as a normal scenario: every experiment resolves
            // to the default experience until configuration arrives.
            return Ok(None);
        };

        Ok(configuration.get(org_id, experiment_key)?.cloned())
    }
}
