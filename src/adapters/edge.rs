//! The assignment endpoint served from edge functions.
//!
//! ```text
//! POST /api/experiments/assign
//! X-TokPulse-Org: org1
//! Cookie: tp_sid=...; tp_xp_exp1=treatment
//!
//! {"experiments": ["exp1", "checkout-layout"]}
//! ```
//!
//! responds with
//!
//! ```text
//! 200 OK
//! Set-Cookie: tp_xp_checkout-layout=one-page; Max-Age=2592000; SameSite=Lax; Path=/
//! X-TokPulse-XP: checkout-layout=one-page,exp1=treatment
//!
//! {"assignments": {"checkout-layout": "one-page", "exp1": "treatment"},
//!  "newAssignments": {"checkout-layout": "one-page"}}
//! ```
use std::{collections::BTreeMap, panic::AssertUnwindSafe, sync::Arc};

use derive_more::From;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::{
    adapters::{
        http::{InboundRequest, OutboundResponse},
        server::ServerAdapter,
    },
    exposure::{surface, ExposureRecorder},
    resolver::Resolver,
    Error, Str,
};

pub const ASSIGN_PATH: &str = "/api/experiments/assign";

#[derive(Debug, Deserialize)]
struct AssignRequestBody {
    experiments: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AssignResponseBody {
    assignments: BTreeMap<Str, Str>,
    new_assignments: BTreeMap<Str, Str>,
}

#[derive(Debug, From)]
enum Rejection {
    NotFound,
    #[from]
    InvalidBody(serde_json::Error),
    MissingOrganization,
    #[from]
    Internal(Error),
}

pub struct EdgeHandler {
    adapter: ServerAdapter,
    track_exposures: bool,
}

impl EdgeHandler {
    pub fn new(resolver: Arc<Resolver>, recorder: Arc<ExposureRecorder>) -> EdgeHandler {
        EdgeHandler {
            adapter: ServerAdapter::new(resolver, recorder).with_surface(surface::EDGE),
            track_exposures: false,
        }
    }

    /// Record an `edge` exposure for every assignment made by the endpoint. Off by default: the
    /// client usually records exposures when it renders a variant.
    pub fn with_exposure_tracking(mut self, enabled: bool) -> EdgeHandler {
        self.track_exposures = enabled;
        self
    }

    /// Handle a request. Never fails: every problem is mapped to an error response.
    pub async fn handle(&self, request: &InboundRequest) -> OutboundResponse {
        let result = AssertUnwindSafe(self.try_handle(request))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(response)) => response,
            Ok(Err(Rejection::NotFound)) => OutboundResponse::error(404, "Not found"),
            Ok(Err(Rejection::InvalidBody(err))) => {
                log::debug!(target: "tokpulse", "rejecting assignment request: {err}");
                OutboundResponse::error(400, "Invalid request body")
            }
            Ok(Err(Rejection::MissingOrganization)) => {
                OutboundResponse::error(400, "Missing organization")
            }
            Ok(Err(Rejection::Internal(err))) => {
                log::error!(target: "tokpulse", "assignment request failed: {err}");
                OutboundResponse::error(500, "Internal server error")
            }
            Err(_panic) => {
                log::error!(target: "tokpulse", "assignment request panicked");
                OutboundResponse::error(500, "Internal server error")
            }
        }
    }

    async fn try_handle(
        &self,
        request: &InboundRequest,
    ) -> std::result::Result<OutboundResponse, Rejection> {
        if !request.method.eq_ignore_ascii_case("POST") || request.path != ASSIGN_PATH {
            return Err(Rejection::NotFound);
        }

        let body: AssignRequestBody = serde_json::from_slice(&request.body)?;

        let assignments = self
            .adapter
            .assignments(&request.headers, body.experiments.as_slice())
            .await
            .ok_or(Rejection::MissingOrganization)?;

        if self.track_exposures {
            self.adapter.record_new_exposures(&assignments).await;
        }

        let mut response = OutboundResponse::json(
            200,
            &AssignResponseBody {
                assignments: assignments.set.assignments(),
                new_assignments: assignments.set.new_assignments(),
            },
        )?;
        assignments.apply_to(&mut response.headers);

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;
    use crate::{
        bucketer::{Bucketer, RollingHashBucketer},
        configuration_store::testing::fixture_store,
        exposure::ExposureRecorderConfig,
        resolver::ResolverConfig,
        telemetry::testing::RecordingTelemetry,
    };

    fn handler_with(
        telemetry: Arc<RecordingTelemetry>,
        bucketer: Arc<dyn Bucketer>,
    ) -> EdgeHandler {
        let _ = env_logger::builder().is_test(true).try_init();

        let resolver = Resolver::new(ResolverConfig {
            config_source: fixture_store(),
            telemetry: telemetry.clone(),
            bucketer,
            lookup_timeout: Duration::from_millis(250),
            assignment_ttl: Duration::from_secs(2_592_000),
        });
        let recorder = ExposureRecorder::new(ExposureRecorderConfig {
            sink: telemetry,
            timeout: Duration::from_millis(300),
            retention: Duration::from_secs(3600),
            capacity: 1000,
        });
        EdgeHandler::new(Arc::new(resolver), Arc::new(recorder))
    }

    fn handler(telemetry: Arc<RecordingTelemetry>) -> EdgeHandler {
        handler_with(telemetry, Arc::new(RollingHashBucketer))
    }

    fn assign_request(body: &str) -> InboundRequest {
        InboundRequest::new("POST", ASSIGN_PATH)
            .with_header("X-TokPulse-Org", "org1")
            .with_header("X-TokPulse-Customer", "user42")
            .with_body(body)
    }

    fn body(response: &OutboundResponse) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[tokio::test]
    async fn assigns_and_sets_carriers() {
        let handler = handler(Arc::default());

        let response = handler
            .handle(
                &assign_request(r#"{"experiments": ["exp1", "checkout-layout", "hero-copy"]}"#)
                    .with_header("Cookie", "tp_xp_exp1=control"),
            )
            .await;

        assert_eq!(response.status, 200);
        assert_eq!(
            body(&response),
            json!({
                "assignments": {"checkout-layout": "one-page", "exp1": "control"},
                "newAssignments": {"checkout-layout": "one-page"},
            })
        );
        assert_eq!(
            response.headers.get_all("Set-Cookie").collect::<Vec<_>>(),
            ["tp_xp_checkout-layout=one-page; Max-Age=2592000; SameSite=Lax; Path=/"]
        );
        assert_eq!(
            response.headers.get("X-TokPulse-XP"),
            Some("checkout-layout=one-page,exp1=control")
        );
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let handler = handler(Arc::default());

        for request in [
            InboundRequest::new("POST", "/api/experiments"),
            InboundRequest::new("GET", ASSIGN_PATH),
        ] {
            let response = handler.handle(&request).await;
            assert_eq!(response.status, 404);
            assert_eq!(body(&response), json!({"error": "Not found"}));
        }
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let handler = handler(Arc::default());

        for payload in ["not json", r#"{"experiments": "exp1"}"#, "{}"] {
            let response = handler.handle(&assign_request(payload)).await;
            assert_eq!(response.status, 400);
            assert_eq!(body(&response), json!({"error": "Invalid request body"}));
        }

        let response = handler
            .handle(&InboundRequest::new("POST", ASSIGN_PATH).with_body(r#"{"experiments": []}"#))
            .await;
        assert_eq!(response.status, 400);
        assert_eq!(body(&response), json!({"error": "Missing organization"}));
    }

    struct PanickingBucketer;

    impl Bucketer for PanickingBucketer {
        fn bucket(&self, _scope: &str) -> u32 {
            panic!("bucketer exploded")
        }
    }

    #[tokio::test]
    async fn unexpected_failure_is_internal_error() {
        let handler = handler_with(Arc::default(), Arc::new(PanickingBucketer));

        let response = handler
            .handle(&assign_request(r#"{"experiments": ["exp1"]}"#))
            .await;

        assert_eq!(response.status, 500);
        assert_eq!(body(&response), json!({"error": "Internal server error"}));
    }

    #[tokio::test]
    async fn tracks_edge_exposures_when_enabled() {
        let telemetry = Arc::new(RecordingTelemetry::default());
        let handler = handler(telemetry.clone()).with_exposure_tracking(true);

        let request = assign_request(r#"{"experiments": ["exp1", "holdout"]}"#);
        handler.handle(&request).await;
        handler.handle(&request).await;

        let exposures = telemetry.exposures.lock().unwrap();
        assert_eq!(exposures.len(), 2);
        assert!(exposures.iter().all(|event| event.record.surface == "edge"));
    }

    #[tokio::test]
    async fn does_not_track_exposures_by_default() {
        let telemetry = Arc::new(RecordingTelemetry::default());
        let handler = handler(telemetry.clone());

        let response = handler
            .handle(&assign_request(r#"{"experiments": ["exp1"]}"#))
            .await;

        assert_eq!(response.status, 200);
        assert_eq!(telemetry.exposure_count(), 0);
    }
}
