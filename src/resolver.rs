//! Assignment resolution: configuration lookup plus evaluation, with every failure absorbed.
use std::{collections::BTreeSet, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::{future::join_all, FutureExt};

use crate::{
    assignment::{Assignment, AssignmentSet},
    bucketer::Bucketer,
    carrier::CarrierAssignments,
    eval::evaluate,
    experiment::ExperimentConfig,
    source::ExperimentConfigSource,
    subject::RequestContext,
    telemetry::{ErrorContext, TelemetrySink},
    Error, Result,
};

pub struct ResolverConfig {
    pub config_source: Arc<dyn ExperimentConfigSource>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub bucketer: Arc<dyn Bucketer>,
    /// Lookups taking longer than this are abandoned and treated as failed.
    pub lookup_timeout: Duration,
    /// Validity period stamped on every assignment.
    pub assignment_ttl: Duration,
}

/// Resolves assignments for a request context.
///
/// The resolver never fails: a missing, non-running, unreachable, slow, or panicking configuration
/// lookup all degrade to "no assignment" and the caller falls back to the default experience.
pub struct Resolver {
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Resolver {
        Resolver { config }
    }

    pub fn assignment_ttl(&self) -> Duration {
        self.config.assignment_ttl
    }

    /// Resolve a single experiment for the subject of `ctx`.
    pub async fn get_assignment(
        &self,
        ctx: &RequestContext,
        experiment_key: &str,
    ) -> Option<Assignment> {
        self.get_assignment_at(ctx, experiment_key, Utc::now()).await
    }

    /// Build the assignment set of a request.
    ///
    /// Every carrier entry is kept as is. Requested experiments missing from the carrier are
    /// looked up concurrently; one failing lookup only drops its own experiment from the result.
    pub async fn resolve(
        &self,
        ctx: &RequestContext,
        experiment_keys: &[impl AsRef<str>],
        carrier: &CarrierAssignments,
    ) -> AssignmentSet {
        let now = Utc::now();
        let mut set = AssignmentSet::from_carrier(carrier, now, self.config.assignment_ttl);

        let mut pending = BTreeSet::new();
        for experiment_key in experiment_keys.iter().map(AsRef::as_ref) {
            if set.contains(experiment_key) {
                log::debug!(target: "tokpulse",
                            org_id = ctx.org_id,
                            subject_key = ctx.subject.as_str(),
                            experiment_key;
                            "using assignment from carrier");
            } else {
                pending.insert(experiment_key);
            }
        }

        let resolved = join_all(
            pending
                .into_iter()
                .map(|experiment_key| self.get_assignment_at(ctx, experiment_key, now)),
        )
        .await;

        for assignment in resolved.into_iter().flatten() {
            set.insert_resolved(assignment);
        }

        set
    }

    pub(crate) async fn get_assignment_at(
        &self,
        ctx: &RequestContext,
        experiment_key: &str,
        now: DateTime<Utc>,
    ) -> Option<Assignment> {
        let config = match self.lookup(&ctx.org_id, experiment_key).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                log::debug!(target: "tokpulse",
                            org_id = ctx.org_id,
                            experiment_key;
                            "unknown experiment");
                return None;
            }
            Err(err) => {
                log::warn!(target: "tokpulse",
                           org_id = ctx.org_id,
                           experiment_key;
                           "failed to look up experiment configuration: {err}");
                self.config.telemetry.log_error(
                    &err,
                    &ErrorContext {
                        operation: "get_assignment",
                        org_id: ctx.org_id.clone(),
                        experiment_key: Some(experiment_key.into()),
                        subject_key: Some(ctx.subject.key().clone()),
                    },
                );
                return None;
            }
        };

        evaluate(
            &config,
            &ctx.org_id,
            ctx.subject.as_str(),
            &*self.config.bucketer,
            now,
            self.config.assignment_ttl,
        )
    }

    async fn lookup(
        &self,
        org_id: &str,
        experiment_key: &str,
    ) -> Result<Option<ExperimentConfig>> {
        let lookup = AssertUnwindSafe(
            self.config
                .config_source
                .get_experiment_config(org_id, experiment_key),
        )
        .catch_unwind();

        match tokio::time::timeout(self.config.lookup_timeout, lookup).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(Error::LookupPanicked),
            Err(_elapsed) => Err(Error::LookupTimeout),
        }
    }
}
