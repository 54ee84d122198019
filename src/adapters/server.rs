//! In-process helper for backend API routes.
use std::sync::Arc;

use crate::{
    adapters::{self, http::Headers},
    assignment::AssignmentSet,
    carrier::{CarrierUpdate, PROPAGATION_HEADER},
    exposure::{surface, ExposureRecorder, ExposureResult},
    resolver::Resolver,
    subject::RequestContext,
    Str,
};

/// Assignments of one request plus the carrier changes to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAssignments {
    pub context: RequestContext,
    pub set: AssignmentSet,
    pub carrier_update: CarrierUpdate,
}

impl ServerAssignments {
    pub fn variant(&self, experiment_key: &str) -> Option<&Str> {
        self.set.variant(experiment_key)
    }

    /// Write `Set-Cookie` headers and the propagation header into `headers`.
    pub fn apply_to(&self, headers: &mut Headers) {
        for cookie in &self.carrier_update.set_cookies {
            headers.append("Set-Cookie", cookie.as_str());
        }
        if let Some(value) = &self.carrier_update.propagation_header {
            headers.insert(PROPAGATION_HEADER, value.as_str());
        }
    }
}

pub struct ServerAdapter {
    resolver: Arc<Resolver>,
    recorder: Arc<ExposureRecorder>,
    surface: &'static str,
}

impl ServerAdapter {
    pub fn new(resolver: Arc<Resolver>, recorder: Arc<ExposureRecorder>) -> ServerAdapter {
        ServerAdapter {
            resolver,
            recorder,
            surface: surface::SERVER,
        }
    }

    /// Report exposures under a different surface name.
    pub fn with_surface(mut self, surface: &'static str) -> ServerAdapter {
        self.surface = surface;
        self
    }

    /// Resolve `experiment_keys` for the request described by `headers`.
    ///
    /// Returns `None` when the request does not name an organization. A subject key generated for
    /// this request is persisted through an extra `tp_aid` cookie in the carrier update.
    pub async fn assignments(
        &self,
        headers: &Headers,
        experiment_keys: &[impl AsRef<str>],
    ) -> Option<ServerAssignments> {
        let context = adapters::request_context(headers)?;
        let carrier = adapters::inbound_carrier(headers);

        let set = self
            .resolver
            .resolve(&context, experiment_keys, &carrier)
            .await;

        let max_age = self.resolver.assignment_ttl();
        let mut carrier_update = CarrierUpdate::from_assignment_set(&set, max_age);
        if let Some(cookie) = adapters::anonymous_id_cookie(&context.subject, max_age) {
            carrier_update.set_cookies.push(cookie);
        }

        log::debug!(target: "tokpulse",
                    org_id = context.org_id,
                    subject_key = context.subject.as_str(),
                    assignments:serde = set.assignments();
                    "resolved request assignments");

        Some(ServerAssignments {
            context,
            set,
            carrier_update,
        })
    }

    pub async fn record_exposure(
        &self,
        context: &RequestContext,
        experiment_key: &str,
    ) -> Option<ExposureResult> {
        self.recorder
            .record_exposure(
                &context.org_id,
                context.store_id.as_deref(),
                context.subject.as_str(),
                experiment_key,
                self.surface,
            )
            .await
    }

    /// Record exposures for every experiment resolved during the request.
    pub async fn record_new_exposures(
        &self,
        assignments: &ServerAssignments,
    ) -> Vec<ExposureResult> {
        let new_assignments = assignments.set.new_assignments();
        futures::future::join_all(
            new_assignments
                .keys()
                .map(|experiment_key| self.record_exposure(&assignments.context, experiment_key)),
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        bucketer::RollingHashBucketer,
        configuration_store::testing::fixture_store,
        exposure::{ExposureRecorderConfig, ExposureStatus},
        resolver::ResolverConfig,
        telemetry::testing::RecordingTelemetry,
    };

    fn adapter(telemetry: Arc<RecordingTelemetry>) -> ServerAdapter {
        let _ = env_logger::builder().is_test(true).try_init();

        let resolver = Resolver::new(ResolverConfig {
            config_source: fixture_store(),
            telemetry: telemetry.clone(),
            bucketer: Arc::new(RollingHashBucketer),
            lookup_timeout: Duration::from_millis(250),
            assignment_ttl: Duration::from_secs(3600),
        });
        let recorder = ExposureRecorder::new(ExposureRecorderConfig {
            sink: telemetry,
            timeout: Duration::from_millis(300),
            retention: Duration::from_secs(3600),
            capacity: 1000,
        });
        ServerAdapter::new(Arc::new(resolver), Arc::new(recorder))
    }

    fn headers(entries: &[(&str, &str)]) -> Headers {
        entries.iter().copied().collect()
    }

    #[tokio::test]
    async fn resolves_and_emits_carrier_update() {
        let adapter = adapter(Arc::default());

        let assignments = adapter
            .assignments(
                &headers(&[
                    ("X-TokPulse-Org", "org1"),
                    ("X-TokPulse-Customer", "user42"),
                    ("Cookie", "tp_xp_checkout-layout=classic"),
                ]),
                &["exp1", "checkout-layout"],
            )
            .await
            .unwrap();

        assert_eq!(assignments.variant("exp1").map(Str::as_str), Some("treatment"));
        assert_eq!(
            assignments.variant("checkout-layout").map(Str::as_str),
            Some("classic")
        );
        assert_eq!(
            assignments.carrier_update,
            CarrierUpdate {
                set_cookies: vec![
                    "tp_xp_exp1=treatment; Max-Age=3600; SameSite=Lax; Path=/".to_owned()
                ],
                propagation_header: Some("checkout-layout=classic,exp1=treatment".to_owned()),
            }
        );

        let mut response_headers = Headers::new();
        assignments.apply_to(&mut response_headers);
        assert_eq!(response_headers.get_all("set-cookie").count(), 1);
        assert_eq!(
            response_headers.get("x-tokpulse-xp"),
            Some("checkout-layout=classic,exp1=treatment")
        );
    }

    #[tokio::test]
    async fn reads_propagated_header() {
        let adapter = adapter(Arc::default());

        let assignments = adapter
            .assignments(
                &headers(&[
                    ("X-TokPulse-Org", "org1"),
                    ("X-TokPulse-Customer", "user75"),
                    ("X-TokPulse-XP", "exp1=treatment"),
                ]),
                &["exp1"],
            )
            .await
            .unwrap();

        assert_eq!(assignments.variant("exp1").map(Str::as_str), Some("treatment"));
        assert!(assignments.carrier_update.set_cookies.is_empty());
    }

    #[tokio::test]
    async fn persists_generated_subject() {
        let adapter = adapter(Arc::default());

        let assignments = adapter
            .assignments(&headers(&[("X-TokPulse-Org", "org1")]), &["holdout"])
            .await
            .unwrap();

        assert!(assignments.context.subject.is_ephemeral());
        let expected = format!("tp_aid={}; ", assignments.context.subject);
        assert!(assignments
            .carrier_update
            .set_cookies
            .iter()
            .any(|cookie| cookie.starts_with(&expected)));
    }

    #[tokio::test]
    async fn requires_organization() {
        let adapter = adapter(Arc::default());

        assert_eq!(
            adapter
                .assignments(&headers(&[("X-TokPulse-Customer", "user42")]), &["exp1"])
                .await,
            None
        );
    }

    #[tokio::test]
    async fn records_server_exposures_once() {
        let telemetry = Arc::new(RecordingTelemetry::default());
        let adapter = adapter(telemetry.clone());
        let request = headers(&[
            ("X-TokPulse-Org", "org1"),
            ("X-TokPulse-Store", "store-1"),
            ("X-TokPulse-Customer", "user42"),
        ]);

        let assignments = adapter
            .assignments(&request, &["exp1", "holdout"])
            .await
            .unwrap();
        let recorded = adapter.record_new_exposures(&assignments).await;
        assert_eq!(recorded.len(), 2);

        let again = adapter
            .record_exposure(&assignments.context, "exp1")
            .await
            .unwrap();
        assert_eq!(again.status, ExposureStatus::AlreadyRecorded);

        let exposures = telemetry.exposures.lock().unwrap();
        assert_eq!(exposures.len(), 2);
        assert!(exposures
            .iter()
            .all(|event| event.record.surface == "server"
                && event.store_id.as_deref() == Some("store-1")));
    }
}
