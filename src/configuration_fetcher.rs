//! An HTTP client that looks up experiment configuration from the experiments service.
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::{StatusCode, Url};

use crate::{
    error::Error,
    experiment::{ExperimentConfig, ExperimentConfigWire},
    source::ExperimentConfigSource,
    Result,
};

pub struct ConfigurationFetcherConfig {
    pub base_url: String,
    pub api_key: String,
    /// SDK name reported to the server.
    pub sdk_name: String,
    /// Version of SDK reported to the server.
    pub sdk_version: String,
}

const CONFIG_ENDPOINT: &str = "/experiments/v1/config";

/// A client that fetches experiment configuration from the server, one experiment per request.
pub struct ConfigurationFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    config: ConfigurationFetcherConfig,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl ConfigurationFetcher {
    pub fn new(config: ConfigurationFetcherConfig) -> ConfigurationFetcher {
        ConfigurationFetcher {
            client: reqwest::Client::new(),
            config,
            unauthorized: AtomicBool::new(false),
        }
    }

    fn config_url(&self, org_id: &str, experiment_key: &str) -> Result<Url> {
        Url::parse_with_params(
            &format!("{}{}", self.config.base_url, CONFIG_ENDPOINT),
            &[
                ("apiKey", &*self.config.api_key),
                ("orgId", org_id),
                ("experimentKey", experiment_key),
                ("sdkName", &*self.config.sdk_name),
                ("sdkVersion", &*self.config.sdk_version),
            ],
        )
        .map_err(Error::InvalidBaseUrl)
    }
}

#[async_trait]
impl ExperimentConfigSource for ConfigurationFetcher {
    async fn get_experiment_config(
        &self,
        org_id: &str,
        experiment_key: &str,
    ) -> Result<Option<ExperimentConfig>> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let url = self.config_url(org_id, experiment_key)?;

        log::debug!(target: "tokpulse", org_id, experiment_key; "fetching experiment configuration");
        let response = self.client.get(url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = response.error_for_status().map_err(|err| {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                log::warn!(target: "tokpulse", "client is not authorized. Check your API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Error::Unauthorized
            } else {
                log::warn!(target: "tokpulse", "received non-200 response while fetching experiment configuration: {:?}", err);
                Error::from(err)
            }
        })?;

        let wire: ExperimentConfigWire = response.json().await?;
        let config =
            ExperimentConfig::try_from(wire).map_err(|err| Error::InvalidExperimentConfig {
                experiment_key: experiment_key.into(),
                source: err,
            })?;

        log::debug!(target: "tokpulse", org_id, experiment_key; "successfully fetched experiment configuration");

        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(base_url: &str) -> ConfigurationFetcher {
        ConfigurationFetcher::new(ConfigurationFetcherConfig {
            base_url: base_url.to_owned(),
            api_key: "api-key".to_owned(),
            sdk_name: "tokpulse-experiments".to_owned(),
            sdk_version: "0.1.0".to_owned(),
        })
    }

    #[test]
    fn builds_config_url() {
        let url = fetcher("https://experiments.example.com/api")
            .config_url("org1", "exp 1")
            .unwrap();

        assert_eq!(
            url.as_str(),
            "https://experiments.example.com/api/experiments/v1/config?apiKey=api-key&orgId=org1&experimentKey=exp+1&sdkName=tokpulse-experiments&sdkVersion=0.1.0"
        );
    }

    #[tokio::test]
    async fn rejects_invalid_base_url() {
        let result = fetcher("not a url").get_experiment_config("org1", "exp1").await;

        assert!(matches!(result, Err(Error::InvalidBaseUrl(_))));
    }

    #[tokio::test]
    async fn short_circuits_once_unauthorized() {
        let fetcher = fetcher("https://experiments.example.com/api");
        fetcher.unauthorized.store(true, Ordering::Relaxed);

        let result = fetcher.get_experiment_config("org1", "exp1").await;

        assert!(matches!(result, Err(Error::Unauthorized)));
    }
}
