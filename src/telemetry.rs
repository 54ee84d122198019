//! The telemetry collaborator receives exposure events and absorbed errors.
use async_trait::async_trait;
use serde::Serialize;

use crate::{exposure::ExposureEvent, Error, Result, Str};

/// Where an absorbed error happened.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    pub operation: &'static str,
    pub org_id: Str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment_key: Option<Str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_key: Option<Str>,
}

/// Sink for exposure events and errors.
///
/// Implementations must tolerate concurrent callers. `log_exposure` is awaited under a timeout;
/// `log_error` is fire-and-forget.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Persist an exposure event.
    async fn log_exposure(&self, event: &ExposureEvent) -> Result<()>;

    /// Report an error that was absorbed instead of surfacing to the request path.
    fn log_error(&self, error: &Error, context: &ErrorContext);
}

/// Default sink that writes everything through the `log` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTelemetry;

#[async_trait]
impl TelemetrySink for LogTelemetry {
    async fn log_exposure(&self, event: &ExposureEvent) -> Result<()> {
        log::info!(target: "tokpulse", event:serde; "exposure");
        Ok(())
    }

    fn log_error(&self, error: &Error, context: &ErrorContext) {
        log::warn!(target: "tokpulse", context:serde; "{error}");
    }
}

#[async_trait]
impl<T> TelemetrySink for T
where
    T: Fn(&ExposureEvent) -> Result<()> + Send + Sync,
{
    async fn log_exposure(&self, event: &ExposureEvent) -> Result<()> {
        self(event)
    }

    fn log_error(&self, error: &Error, context: &ErrorContext) {
        log::warn!(target: "tokpulse", context:serde; "{error}");
    }
}
