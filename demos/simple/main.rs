use std::sync::Arc;

use tokpulse_experiments::{
    adapters::http::InboundRequest, ClientConfig, ConfigurationStore, ExperimentsConfig,
    RequestContext, SubjectIdentity,
};

const CONFIGURATION: &str = r#"{
  "experiments": {
    "org1": {
      "exp1": {
        "key": "exp1",
        "status": "RUNNING",
        "variants": ["control", "treatment"],
        "trafficAllocation": 0.5
      }
    }
  }
}"#;

#[tokio::main(flavor = "current_thread")]
pub async fn main() {
    env_logger::init();

    let configuration = ExperimentsConfig::from_json(CONFIGURATION.as_bytes())
        .expect("configuration should be valid JSON");
    let store = Arc::new(ConfigurationStore::with_configuration(configuration));
    let client = ClientConfig::new(store).to_client();

    // Resolve directly for a known customer.
    let identity = SubjectIdentity {
        customer_id: Some("user42".to_owned()),
        ..SubjectIdentity::default()
    };
    let ctx = RequestContext::new("org1", identity.subject_key());
    let variant = client
        .get_assignment(&ctx, "exp1")
        .await
        .map(|assignment| assignment.variant_key.to_string())
        // default experience
        .unwrap_or_else(|| "control".to_owned());
    println!("Assignment: {variant}");

    // Record the exposure once the variant is rendered. Repeated calls are no-ops.
    client.record_exposure(&ctx, "exp1", "server").await;
    client.record_exposure(&ctx, "exp1", "server").await;
    println!("Exposure stats: {:?}", client.exposure_stats());

    // Serve the edge endpoint.
    let response = client
        .edge_handler()
        .handle(
            &InboundRequest::new("POST", "/api/experiments/assign")
                .with_header("X-TokPulse-Org", "org1")
                .with_header("Cookie", "tp_sid=session-7")
                .with_body(r#"{"experiments": ["exp1"]}"#),
        )
        .await;
    println!("Edge response: {}", response.status);
    for (name, value) in response.headers.iter() {
        println!("  {name}: {value}");
    }
    println!("  {}", String::from_utf8_lossy(&response.body));
}
