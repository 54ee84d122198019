//! Pure assignment evaluation.
//!
//! Evaluation has no side effects and does not look up anything: the variant is a function of the
//! organization, experiment, subject, and experiment configuration only.
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    assignment::Assignment,
    bucketer::{scope_key, Bucketer},
    experiment::ExperimentConfig,
};

/// Evaluate `config` for a subject.
///
/// Returns `None` unless the experiment is running. Subjects whose bucket falls below
/// `traffic_allocation * 100` get the treatment variant, everyone else gets control.
pub fn evaluate(
    config: &ExperimentConfig,
    org_id: &str,
    subject_key: &str,
    bucketer: &dyn Bucketer,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Option<Assignment> {
    if !config.is_running() {
        log::trace!(target: "tokpulse",
                    org_id,
                    experiment_key = config.key(),
                    status:debug = config.status();
                    "experiment is not running");
        return None;
    }

    let bucket = bucketer.bucket(&scope_key(org_id, config.key(), subject_key));
    let threshold = config.traffic_allocation() * 100.0;

    let variant_key = if f64::from(bucket) < threshold {
        config.treatment_variant()
    } else {
        config.control_variant()
    };

    log::trace!(target: "tokpulse",
                org_id,
                experiment_key = config.key(),
                subject_key,
                bucket,
                variant_key;
                "evaluated experiment");

    Some(Assignment {
        experiment_key: config.key().clone(),
        variant_key,
        assigned_at: now,
        ttl,
    })
}
