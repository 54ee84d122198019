use fastly::{http::StatusCode, mime, Error, Request, Response};
use serde_json::json;

use super::assign::load_configuration;

/// Liveness plus whether the experiments configuration is present. Without it the service still
/// answers, with carried assignments only.
pub fn handle_health(_req: Request) -> Result<Response, Error> {
    let configuration = match load_configuration() {
        Some(config) => json!({
            "loaded": true,
            "createdAt": config.created_at.map(|at| at.to_rfc3339()),
        }),
        None => json!({ "loaded": false }),
    };

    Ok(Response::from_status(StatusCode::OK)
        .with_content_type(mime::APPLICATION_JSON)
        .with_body(json!({ "status": "ok", "configuration": configuration }).to_string()))
}
