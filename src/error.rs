use std::sync::Arc;

use crate::Str;

/// Represents a result type for operations in this crate.
///
/// Most public entry points do not return it: the resolver and the exposure recorder absorb
/// errors and degrade to `None`. `Result` is what collaborators (configuration sources, telemetry
/// sinks) hand back to them.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors raised while resolving assignments or recording exposures.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Experiment configuration exists but did not pass validation when it was loaded.
    #[error("invalid configuration for experiment {experiment_key}")]
    InvalidExperimentConfig {
        experiment_key: Str,
        #[source]
        source: ConfigError,
    },

    /// Configuration document could not be parsed.
    #[error("error parsing experiments configuration")]
    ConfigurationParseError(#[source] Arc<serde_json::Error>),

    /// Configuration lookup did not complete within the configured timeout.
    #[error("experiment configuration lookup timed out")]
    LookupTimeout,

    /// Configuration source panicked while serving a lookup.
    #[error("experiment configuration lookup panicked")]
    LookupPanicked,

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Telemetry sink rejected an event.
    #[error("telemetry sink failed: {0}")]
    Telemetry(Str),

    /// Telemetry sink did not accept an event within the configured timeout.
    #[error("telemetry sink timed out")]
    TelemetryTimeout,

    /// Failed to serialize a response body.
    #[error("serialization failed")]
    Serialization(#[source] Arc<serde_json::Error>),
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

/// Reasons an experiment configuration is rejected at the loading boundary.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("experiment configuration could not be parsed")]
    Unparseable,
    #[error("experiment key is empty")]
    EmptyKey,
    #[error("experiment key {0:?} is not a valid carrier token")]
    InvalidKey(String),
    #[error("variant {0:?} is not a valid carrier token")]
    InvalidVariant(String),
    #[error("variant {0:?} is listed more than once")]
    DuplicateVariant(String),
    #[error("traffic allocation {0} is not a finite number")]
    InvalidTrafficAllocation(f64),
}
