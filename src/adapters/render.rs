//! Render-scoped experiment provider.
//!
//! A provider lives for one render cycle (one page, one component tree). It is seeded with the
//! assignments a previous response handed to the client, resolves anything else lazily, and fires
//! an exposure the first time each experiment is actually used.
use std::{collections::HashSet, sync::Arc};

use chrono::Utc;

use crate::{
    assignment::{Assignment, AssignmentSet},
    carrier::{self, is_valid_token},
    exposure::{surface, ExposureRecorder},
    resolver::Resolver,
    subject::RequestContext,
    Str,
};

pub struct ExperimentProvider {
    resolver: Arc<Resolver>,
    recorder: Arc<ExposureRecorder>,
    context: RequestContext,
    assignments: AssignmentSet,
    exposed: HashSet<Str>,
}

impl ExperimentProvider {
    pub fn new(
        resolver: Arc<Resolver>,
        recorder: Arc<ExposureRecorder>,
        context: RequestContext,
    ) -> ExperimentProvider {
        ExperimentProvider {
            resolver,
            recorder,
            context,
            assignments: AssignmentSet::new(),
            exposed: HashSet::new(),
        }
    }

    /// Seed with known assignments, e.g. the `assignments` map of an assignment endpoint
    /// response. Entries that are not valid carrier tokens are skipped.
    pub fn with_assignments<K, V>(mut self, assignments: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let now = Utc::now();
        let ttl = self.resolver.assignment_ttl();
        for (experiment_key, variant_key) in assignments {
            let (experiment_key, variant_key) = (experiment_key.as_ref(), variant_key.as_ref());
            if !(is_valid_token(experiment_key) && is_valid_token(variant_key)) {
                log::debug!(target: "tokpulse", experiment_key, variant_key; "skipping malformed seed assignment");
                continue;
            }
            self.assignments.insert_cached(Assignment {
                experiment_key: experiment_key.into(),
                variant_key: variant_key.into(),
                assigned_at: now,
                ttl,
            });
        }
        self
    }

    /// Seed from a propagation header value.
    pub fn with_propagation_header(self, header: &str) -> Self {
        let assignments = carrier::parse_propagation_header(header);
        self.with_assignments(assignments)
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn assignments(&self) -> &AssignmentSet {
        &self.assignments
    }

    /// Variant of `experiment_key` for this provider's subject, or `None` if the experiment is
    /// unknown or not running.
    ///
    /// The first successful call per experiment records a `react` exposure. Later calls, and calls
    /// for experiments without a variant, record nothing. A failed exposure write is retried on the
    /// next call.
    pub async fn use_experiment(&mut self, experiment_key: &str) -> Option<Str> {
        if !self.assignments.contains(experiment_key) {
            let assignment = self
                .resolver
                .get_assignment(&self.context, experiment_key)
                .await?;
            self.assignments.insert_resolved(assignment);
        }

        let variant_key = self.assignments.variant(experiment_key)?.clone();

        if !self.exposed.contains(experiment_key) {
            let recorded = self
                .recorder
                .record_exposure(
                    &self.context.org_id,
                    self.context.store_id.as_deref(),
                    self.context.subject.as_str(),
                    experiment_key,
                    surface::REACT,
                )
                .await;
            if recorded.is_some() {
                self.exposed.insert(experiment_key.into());
            }
        }

        Some(variant_key)
    }
}
