use std::{sync::Arc, time::Duration};

use crate::{
    bucketer::{Bucketer, RollingHashBucketer},
    source::ExperimentConfigSource,
    telemetry::{LogTelemetry, TelemetrySink},
    Client,
};

/// Configuration for [`Client`].
pub struct ClientConfig {
    pub(crate) config_source: Arc<dyn ExperimentConfigSource>,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
    pub(crate) bucketer: Arc<dyn Bucketer>,
    pub(crate) lookup_timeout: Duration,
    pub(crate) exposure_timeout: Duration,
    pub(crate) assignment_ttl: Duration,
    pub(crate) exposure_retention: Duration,
    pub(crate) exposure_capacity: usize,
}

impl ClientConfig {
    /// Create a default configuration reading experiments from `config_source`.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use tokpulse_experiments::{ClientConfig, ConfigurationStore};
    /// ClientConfig::new(Arc::new(ConfigurationStore::new()));
    /// ```
    pub fn new(config_source: Arc<dyn ExperimentConfigSource>) -> Self {
        ClientConfig {
            config_source,
            telemetry: Arc::new(LogTelemetry),
            bucketer: Arc::new(RollingHashBucketer),
            lookup_timeout: ClientConfig::DEFAULT_LOOKUP_TIMEOUT,
            exposure_timeout: ClientConfig::DEFAULT_EXPOSURE_TIMEOUT,
            assignment_ttl: ClientConfig::DEFAULT_ASSIGNMENT_TTL,
            exposure_retention: ClientConfig::DEFAULT_EXPOSURE_RETENTION,
            exposure_capacity: ClientConfig::DEFAULT_EXPOSURE_CAPACITY,
        }
    }

    /// Set the sink receiving exposure events and absorbed errors. Defaults to writing them
    /// through the `log` crate.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use tokpulse_experiments::{ClientConfig, ConfigurationStore, ExposureEvent, Result};
    /// let mut config = ClientConfig::new(Arc::new(ConfigurationStore::new()));
    /// config.telemetry(|event: &ExposureEvent| -> Result<()> {
    ///     println!("{:?}", event);
    ///     Ok(())
    /// });
    /// ```
    pub fn telemetry(&mut self, telemetry: impl TelemetrySink + 'static) -> &mut Self {
        self.telemetry = Arc::new(telemetry);
        self
    }

    /// Override the bucketing hash. The default reproduces the rolling 32-bit hash existing
    /// assignments were made with; changing it reshuffles every subject.
    pub fn bucketer(&mut self, bucketer: impl Bucketer + 'static) -> &mut Self {
        self.bucketer = Arc::new(bucketer);
        self
    }

    /// Default time to wait for an experiment configuration lookup.
    pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(250);

    pub fn lookup_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Default time to wait for the telemetry sink to accept an exposure.
    pub const DEFAULT_EXPOSURE_TIMEOUT: Duration = Duration::from_millis(300);

    pub fn exposure_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.exposure_timeout = timeout;
        self
    }

    /// Default validity of an assignment, also used as the carrier cookie max-age.
    pub const DEFAULT_ASSIGNMENT_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

    pub fn assignment_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.assignment_ttl = ttl;
        self
    }

    /// Default period during which a recorded exposure suppresses duplicates.
    pub const DEFAULT_EXPOSURE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

    pub fn exposure_retention(&mut self, retention: Duration) -> &mut Self {
        self.exposure_retention = retention;
        self
    }

    /// Default number of exposures remembered for deduplication.
    pub const DEFAULT_EXPOSURE_CAPACITY: usize = 100_000;

    pub fn exposure_capacity(&mut self, capacity: usize) -> &mut Self {
        self.exposure_capacity = capacity;
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use tokpulse_experiments::{Client, ClientConfig, ConfigurationStore};
    /// let client: Client = ClientConfig::new(Arc::new(ConfigurationStore::new())).to_client();
    /// ```
    pub fn to_client(self) -> Client {
        Client::new(self)
    }
}
