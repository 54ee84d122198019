use std::{
    collections::{btree_map, BTreeMap},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::{carrier::CarrierAssignments, Str};

/// A subject's variant for one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub experiment_key: Str,
    pub variant_key: Str,
    pub assigned_at: DateTime<Utc>,
    /// How long the assignment stays valid in the carrier it was written to.
    #[serde(rename = "ttlSeconds", serialize_with = "serialize_seconds")]
    pub ttl: Duration,
}

fn serialize_seconds<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(ttl.as_secs())
}

/// Where an entry of an [`AssignmentSet`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AssignmentSource {
    /// Read from the inbound carrier: the subject already had this assignment.
    Carrier,
    /// Resolved during this request.
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentEntry {
    #[serde(flatten)]
    pub assignment: Assignment,
    pub source: AssignmentSource,
}

/// All assignments of one subject for the duration of one request or render cycle.
///
/// Entries read from the carrier are never replaced by fresh resolutions, even if the experiment's
/// traffic allocation changed since the assignment was made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AssignmentSet {
    entries: BTreeMap<Str, AssignmentEntry>,
}

impl AssignmentSet {
    pub fn new() -> AssignmentSet {
        AssignmentSet::default()
    }

    /// Seed the set from an inbound carrier. Carrier entries carry no timestamp, so they are
    /// stamped with `now`.
    pub fn from_carrier(carrier: &CarrierAssignments, now: DateTime<Utc>, ttl: Duration) -> Self {
        let entries = carrier
            .iter()
            .map(|(experiment_key, variant_key)| {
                let entry = AssignmentEntry {
                    assignment: Assignment {
                        experiment_key: experiment_key.clone(),
                        variant_key: variant_key.clone(),
                        assigned_at: now,
                        ttl,
                    },
                    source: AssignmentSource::Carrier,
                };
                (experiment_key.clone(), entry)
            })
            .collect();
        AssignmentSet { entries }
    }

    /// Add an entry read from a carrier, replacing any resolved entry for the same experiment.
    pub fn insert_cached(&mut self, assignment: Assignment) {
        self.entries.insert(
            assignment.experiment_key.clone(),
            AssignmentEntry {
                assignment,
                source: AssignmentSource::Carrier,
            },
        );
    }

    /// Add a freshly resolved assignment unless the experiment is already present.
    ///
    /// Returns `false` if an existing entry was kept.
    pub fn insert_resolved(&mut self, assignment: Assignment) -> bool {
        match self.entries.entry(assignment.experiment_key.clone()) {
            btree_map::Entry::Occupied(_) => false,
            btree_map::Entry::Vacant(slot) => {
                slot.insert(AssignmentEntry {
                    assignment,
                    source: AssignmentSource::Resolved,
                });
                true
            }
        }
    }

    pub fn contains(&self, experiment_key: &str) -> bool {
        self.entries.contains_key(experiment_key)
    }

    pub fn get(&self, experiment_key: &str) -> Option<&AssignmentEntry> {
        self.entries.get(experiment_key)
    }

    pub fn variant(&self, experiment_key: &str) -> Option<&Str> {
        self.get(experiment_key)
            .map(|entry| &entry.assignment.variant_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Str, &AssignmentEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every current assignment, experiment key to variant key.
    pub fn assignments(&self) -> BTreeMap<Str, Str> {
        self.variants_where(|_| true)
    }

    /// Assignments resolved during this request.
    pub fn new_assignments(&self) -> BTreeMap<Str, Str> {
        self.variants_where(|entry| entry.source == AssignmentSource::Resolved)
    }

    fn variants_where(&self, predicate: impl Fn(&AssignmentEntry) -> bool) -> BTreeMap<Str, Str> {
        self.entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(key, entry)| (key.clone(), entry.assignment.variant_key.clone()))
            .collect()
    }
}
