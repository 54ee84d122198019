use std::sync::Arc;

use crate::{
    adapters::{edge::EdgeHandler, render::ExperimentProvider, server::ServerAdapter},
    assignment::{Assignment, AssignmentSet},
    carrier::CarrierAssignments,
    exposure::{ExposureRecorder, ExposureRecorderConfig, ExposureResult, ExposureStats},
    resolver::{Resolver, ResolverConfig},
    subject::RequestContext,
    ClientConfig,
};

/// Entry point tying assignment resolution and exposure recording together.
///
/// In order to create a client instance, first create [`ClientConfig`]. A client is cheap to share
/// behind an `Arc`, and the adapters it hands out share its resolver and exposure ledger.
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use tokpulse_experiments::{Client, ClientConfig, ConfigurationStore};
/// let client = Client::new(ClientConfig::new(Arc::new(ConfigurationStore::new())));
/// ```
pub struct Client {
    resolver: Arc<Resolver>,
    recorder: Arc<ExposureRecorder>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let resolver = Resolver::new(ResolverConfig {
            config_source: config.config_source,
            telemetry: config.telemetry.clone(),
            bucketer: config.bucketer,
            lookup_timeout: config.lookup_timeout,
            assignment_ttl: config.assignment_ttl,
        });
        let recorder = ExposureRecorder::new(ExposureRecorderConfig {
            sink: config.telemetry,
            timeout: config.exposure_timeout,
            retention: config.exposure_retention,
            capacity: config.exposure_capacity,
        });

        Client {
            resolver: Arc::new(resolver),
            recorder: Arc::new(recorder),
        }
    }

    /// Get the assignment of a single experiment for the subject of `ctx`.
    ///
    /// Returns `None` if the experiment is unknown, not running, or its configuration could not
    /// be looked up. The caller should render the default experience in that case.
    pub async fn get_assignment(
        &self,
        ctx: &RequestContext,
        experiment_key: &str,
    ) -> Option<Assignment> {
        self.resolver.get_assignment(ctx, experiment_key).await
    }

    /// Resolve a batch of experiments on top of the assignments the subject already carries.
    pub async fn resolve_assignments(
        &self,
        ctx: &RequestContext,
        experiment_keys: &[impl AsRef<str>],
        carrier: &CarrierAssignments,
    ) -> AssignmentSet {
        self.resolver.resolve(ctx, experiment_keys, carrier).await
    }

    /// Record that the subject of `ctx` encountered `experiment_key` on `surface`.
    pub async fn record_exposure(
        &self,
        ctx: &RequestContext,
        experiment_key: &str,
        surface: &str,
    ) -> Option<ExposureResult> {
        self.recorder
            .record_exposure(
                &ctx.org_id,
                ctx.store_id.as_deref(),
                ctx.subject.as_str(),
                experiment_key,
                surface,
            )
            .await
    }

    pub fn exposure_stats(&self) -> ExposureStats {
        self.recorder.stats()
    }

    /// Handler for the edge assignment endpoint.
    pub fn edge_handler(&self) -> EdgeHandler {
        EdgeHandler::new(self.resolver.clone(), self.recorder.clone())
    }

    pub fn server_adapter(&self) -> ServerAdapter {
        ServerAdapter::new(self.resolver.clone(), self.recorder.clone())
    }

    /// Provider for one render cycle of the subject in `ctx`.
    pub fn provider(&self, ctx: RequestContext) -> ExperimentProvider {
        ExperimentProvider::new(self.resolver.clone(), self.recorder.clone(), ctx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        configuration_store::testing::fixture_store,
        exposure::{surface, ExposureEvent, ExposureStatus},
        subject::{SubjectKey, SubjectOrigin},
        Error, Result,
    };

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn context(subject_key: &str) -> RequestContext {
        RequestContext::new("org1", SubjectKey::new(subject_key, SubjectOrigin::Customer))
    }

    #[tokio::test]
    async fn assigns_pinned_scenario() {
        init();
        let client = ClientConfig::new(fixture_store()).to_client();

        let assignment = client
            .get_assignment(&context("user42"), "exp1")
            .await
            .unwrap();

        assert_eq!(assignment.variant_key, "treatment");
        assert_eq!(assignment.ttl, ClientConfig::DEFAULT_ASSIGNMENT_TTL);
    }

    #[tokio::test]
    async fn unknown_experiment_records_nothing() {
        init();
        let mut config = ClientConfig::new(fixture_store());
        config.telemetry(|_event: &ExposureEvent| -> Result<()> {
            panic!("no exposure expected")
        });
        let client = config.to_client();

        assert_eq!(
            client.get_assignment(&context("user42"), "unknown").await,
            None
        );
        assert_eq!(client.exposure_stats().attempts, 0);
    }

    #[tokio::test]
    async fn counts_exposures() {
        init();
        let mut config = ClientConfig::new(fixture_store());
        config
            .telemetry(|event: &ExposureEvent| -> Result<()> {
                if event.record.surface == surface::EDGE {
                    Err(Error::Telemetry("edge sink offline".into()))
                } else {
                    Ok(())
                }
            })
            .exposure_timeout(Duration::from_millis(50));
        let client = config.to_client();
        let ctx = context("user42");

        let first = client
            .record_exposure(&ctx, "exp1", surface::SERVER)
            .await
            .unwrap();
        let second = client
            .record_exposure(&ctx, "exp1", surface::SERVER)
            .await
            .unwrap();
        let failed = client.record_exposure(&ctx, "exp1", surface::EDGE).await;

        assert_eq!(first.status, ExposureStatus::Recorded);
        assert_eq!(second.status, ExposureStatus::AlreadyRecorded);
        assert_eq!(failed, None);

        let stats = client.exposure_stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.recorded, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test]
    async fn adapters_share_the_exposure_ledger() {
        init();
        let client = ClientConfig::new(fixture_store()).to_client();
        let ctx = context("user42");

        let mut provider = client.provider(ctx.clone());
        assert_eq!(
            provider.use_experiment("exp1").await.as_deref(),
            Some("treatment")
        );

        let again = client
            .record_exposure(&ctx, "exp1", surface::REACT)
            .await
            .unwrap();
        assert_eq!(again.status, ExposureStatus::AlreadyRecorded);
    }
}
