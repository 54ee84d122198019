use std::sync::Arc;

use async_trait::async_trait;
use fastly::http::StatusCode;
use fastly::kv_store::KVStoreError;
use fastly::{Error, KVStore, Request, Response};
use tokpulse_experiments::{
    adapters::http::{Headers, InboundRequest, OutboundResponse},
    ClientConfig, ConfigurationStore, ErrorContext, ExperimentsConfig, ExposureEvent,
    TelemetrySink,
};

const KV_STORE_NAME: &str = "tokpulse-experiments-kv-store";
const CONFIGURATION_KEY: &str = "experiments-configuration";

/// Writes exposures and errors to stderr, which ends up in the service's log stream.
struct StderrTelemetry;

#[async_trait]
impl TelemetrySink for StderrTelemetry {
    async fn log_exposure(&self, event: &ExposureEvent) -> tokpulse_experiments::Result<()> {
        let line = serde_json::to_string(event)
            .map_err(|e| tokpulse_experiments::Error::Telemetry(e.to_string().into()))?;
        eprintln!("exposure {}", line);
        Ok(())
    }

    fn log_error(&self, error: &tokpulse_experiments::Error, context: &ErrorContext) {
        eprintln!(
            "{} failed for org {} (experiment {:?}): {}",
            context.operation, context.org_id, context.experiment_key, error
        );
    }
}

/// Read the configuration document from the KV store. Returns `None` if it is missing or invalid;
/// the endpoint then serves carried assignments only.
pub(crate) fn load_configuration() -> Option<ExperimentsConfig> {
    let kv_store = match KVStore::open(KV_STORE_NAME) {
        Ok(Some(store)) => store,
        Ok(None) => {
            eprintln!("KV Store {} does not exist", KV_STORE_NAME);
            return None;
        }
        Err(e) => {
            eprintln!("KV Store error: {:?}", e);
            return None;
        }
    };

    let mut kv_store_item = match kv_store.lookup(CONFIGURATION_KEY) {
        Ok(item) => item,
        Err(KVStoreError::ItemNotFound) => {
            eprintln!("Missing experiments configuration in KV Store");
            return None;
        }
        Err(e) => {
            eprintln!("KV Store error: {:?}", e);
            return None;
        }
    };

    match ExperimentsConfig::from_json(&kv_store_item.take_body().into_bytes()) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Failed to parse experiments configuration: {:?}", e);
            None
        }
    }
}

fn inbound_request(req: &mut Request) -> InboundRequest {
    let headers: Headers = req
        .get_headers()
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some((name.as_str().to_owned(), value.to_owned()))
        })
        .collect();

    InboundRequest {
        method: req.get_method_str().to_owned(),
        path: req.get_path().to_owned(),
        headers,
        body: req.take_body_bytes(),
    }
}

fn outbound_response(response: OutboundResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut resp = Response::from_status(status).with_body(response.body);
    for (name, value) in response.headers.iter() {
        resp.append_header(name, value);
    }
    resp
}

pub fn handle_assign(mut req: Request) -> Result<Response, Error> {
    let request = inbound_request(&mut req);

    let store = ConfigurationStore::new();
    if let Some(configuration) = load_configuration() {
        store.set_configuration(Arc::new(configuration));
    }

    let mut config = ClientConfig::new(Arc::new(store));
    config.telemetry(StderrTelemetry);
    let client = config.to_client();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    let response = runtime.block_on(client.edge_handler().handle(&request));

    Ok(outbound_response(response))
}
