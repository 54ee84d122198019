use std::sync::Arc;

use async_trait::async_trait;

use crate::{experiment::ExperimentConfig, Result};

/// Read-only lookup of active experiment configuration.
///
/// `Ok(None)` means the experiment does not exist. Errors mean the configuration could not be
/// obtained; the resolver treats both the same way (no assignment) but reports errors.
#[async_trait]
pub trait ExperimentConfigSource: Send + Sync {
    async fn get_experiment_config(
        &self,
        org_id: &str,
        experiment_key: &str,
    ) -> Result<Option<ExperimentConfig>>;
}

#[async_trait]
impl<T: ExperimentConfigSource + ?Sized> ExperimentConfigSource for Arc<T> {
    async fn get_experiment_config(
        &self,
        org_id: &str,
        experiment_key: &str,
    ) -> Result<Option<ExperimentConfig>> {
        (**self).get_experiment_config(org_id, experiment_key).await
    }
}
