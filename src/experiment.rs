//! Experiment configuration: the wire format served by configuration sources and the validated
//! form the resolver works with.
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{carrier::is_valid_token, error::ConfigError, Error, Result, Str};

/// Variant returned when an experiment lists no control variant.
pub const DEFAULT_CONTROL_VARIANT: &str = "control";
/// Variant returned when an experiment lists no treatment variant.
pub const DEFAULT_TREATMENT_VARIANT: &str = "treatment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
}

/// Experiment configuration as served by the configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentConfigWire {
    pub key: String,
    pub status: ExperimentStatus,
    pub variants: Vec<String>,
    pub traffic_allocation: f64,
}

/// Validated experiment configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    key: Str,
    status: ExperimentStatus,
    /// First variant is control, second is treatment. May hold fewer than two entries, in which
    /// case the default variant names are used.
    variants: Box<[Str]>,
    /// Fraction of subjects routed to treatment, within `[0, 1]`.
    traffic_allocation: f64,
}

impl ExperimentConfig {
    pub fn new(
        key: impl Into<String>,
        status: ExperimentStatus,
        variants: impl IntoIterator<Item = impl Into<String>>,
        traffic_allocation: f64,
    ) -> std::result::Result<ExperimentConfig, ConfigError> {
        ExperimentConfig::try_from(ExperimentConfigWire {
            key: key.into(),
            status,
            variants: variants.into_iter().map(Into::into).collect(),
            traffic_allocation,
        })
    }

    pub fn key(&self) -> &Str {
        &self.key
    }

    pub fn status(&self) -> ExperimentStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }

    pub fn variants(&self) -> &[Str] {
        &self.variants
    }

    pub fn traffic_allocation(&self) -> f64 {
        self.traffic_allocation
    }

    pub fn control_variant(&self) -> Str {
        match &*self.variants {
            [control, _, ..] => control.clone(),
            _ => DEFAULT_CONTROL_VARIANT.into(),
        }
    }

    pub fn treatment_variant(&self) -> Str {
        match &*self.variants {
            [_, treatment, ..] => treatment.clone(),
            _ => DEFAULT_TREATMENT_VARIANT.into(),
        }
    }
}

impl TryFrom<ExperimentConfigWire> for ExperimentConfig {
    type Error = ConfigError;

    fn try_from(wire: ExperimentConfigWire) -> std::result::Result<Self, ConfigError> {
        if wire.key.is_empty() {
            return Err(ConfigError::EmptyKey);
        }
        if !is_valid_token(&wire.key) {
            return Err(ConfigError::InvalidKey(wire.key));
        }

        let mut seen = HashSet::with_capacity(wire.variants.len());
        for variant in &wire.variants {
            if !is_valid_token(variant) {
                return Err(ConfigError::InvalidVariant(variant.clone()));
            }
            if !seen.insert(variant.as_str()) {
                return Err(ConfigError::DuplicateVariant(variant.clone()));
            }
        }

        if !wire.traffic_allocation.is_finite() {
            return Err(ConfigError::InvalidTrafficAllocation(wire.traffic_allocation));
        }
        let traffic_allocation = wire.traffic_allocation.clamp(0.0, 1.0);
        if traffic_allocation != wire.traffic_allocation {
            log::warn!(target: "tokpulse",
                       experiment_key = wire.key.as_str(),
                       traffic_allocation = wire.traffic_allocation;
                       "traffic allocation outside of [0, 1], clamping");
        }

        Ok(ExperimentConfig {
            key: wire.key.into(),
            status: wire.status,
            variants: wire.variants.into_iter().map(Str::from).collect(),
            traffic_allocation,
        })
    }
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
///
/// If one experiment uses a status this version does not know about, the rest of the
/// organization's experiments are still served.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Configuration document holding experiments of one or more organizations.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExperimentsConfigWire {
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    experiments: HashMap<String, HashMap<String, TryParse<ExperimentConfigWire>>>,
}

/// Compiled configuration document. Every experiment is validated once, when the document is
/// loaded.
#[derive(Debug, Default)]
pub struct ExperimentsConfig {
    pub created_at: Option<DateTime<Utc>>,
    experiments: HashMap<Str, HashMap<Str, std::result::Result<ExperimentConfig, ConfigError>>>,
}

impl ExperimentsConfig {
    pub fn from_json(json: &[u8]) -> Result<ExperimentsConfig> {
        let wire: ExperimentsConfigWire = serde_json::from_slice(json).map_err(|err| {
            log::warn!(target: "tokpulse", "failed to parse experiments configuration: {err:?}");
            Error::ConfigurationParseError(err.into())
        })?;

        let experiments = wire
            .experiments
            .into_iter()
            .map(|(org_id, experiments)| {
                let experiments = experiments
                    .into_iter()
                    .map(|(key, experiment)| {
                        let compiled = compile_experiment(&org_id, &key, experiment);
                        (Str::from(key), compiled)
                    })
                    .collect();
                (Str::from(org_id), experiments)
            })
            .collect();

        Ok(ExperimentsConfig {
            created_at: wire.created_at,
            experiments,
        })
    }

    /// Build a configuration from already validated experiments.
    pub fn from_experiments(
        experiments: impl IntoIterator<Item = (impl Into<Str>, ExperimentConfig)>,
    ) -> ExperimentsConfig {
        let mut config = ExperimentsConfig::default();
        for (org_id, experiment) in experiments {
            config
                .experiments
                .entry(org_id.into())
                .or_default()
                .insert(experiment.key.clone(), Ok(experiment));
        }
        config
    }

    /// Look up an experiment.
    ///
    /// Returns `Ok(None)` for unknown experiments and an error for experiments that failed
    /// validation.
    pub fn get(&self, org_id: &str, experiment_key: &str) -> Result<Option<&ExperimentConfig>> {
        let Some(result) = self
            .experiments
            .get(org_id)
            .and_then(|experiments| experiments.get(experiment_key))
        else {
            return Ok(None);
        };

        match result {
            Ok(config) => Ok(Some(config)),
            Err(err) => Err(Error::InvalidExperimentConfig {
                experiment_key: experiment_key.into(),
                source: err.clone(),
            }),
        }
    }
}

fn compile_experiment(
    org_id: &str,
    key: &str,
    experiment: TryParse<ExperimentConfigWire>,
) -> std::result::Result<ExperimentConfig, ConfigError> {
    let Some(wire) = Option::<ExperimentConfigWire>::from(experiment) else {
        log::warn!(target: "tokpulse", org_id, experiment_key = key; "failed to parse experiment configuration");
        return Err(ConfigError::Unparseable);
    };

    if wire.key != key {
        log::warn!(target: "tokpulse",
                   org_id,
                   experiment_key = key,
                   declared_key = wire.key.as_str();
                   "experiment key does not match its entry, using the entry key");
    }

    ExperimentConfig::try_from(ExperimentConfigWire {
        key: key.to_owned(),
        ..wire
    })
    .inspect_err(|err| {
        log::warn!(target: "tokpulse", org_id, experiment_key = key; "invalid experiment configuration: {err}");
    })
}
