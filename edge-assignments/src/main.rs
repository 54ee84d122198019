mod handlers;

use fastly::http::{Method, StatusCode};
use fastly::{Error, Request, Response};

const ALLOWED_HEADERS: &str =
    "Content-Type, X-TokPulse-Org, X-TokPulse-Store, X-TokPulse-Customer, X-TokPulse-XP";

#[fastly::main]
fn main(req: Request) -> Result<Response, Error> {
    // Handle CORS preflight requests
    if req.get_method() == Method::OPTIONS {
        return Ok(Response::from_status(StatusCode::NO_CONTENT)
            .with_header("Access-Control-Allow-Origin", "*")
            .with_header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .with_header("Access-Control-Allow-Headers", ALLOWED_HEADERS)
            .with_header("Access-Control-Max-Age", "86400"));
    }

    // Everything except the health check goes to the assignment handler, which owns routing and
    // the 404 response of the assignment API.
    let response = match (req.get_method(), req.get_path()) {
        (&Method::GET, "/health") => handlers::handle_health(req),
        _ => handlers::handle_assign(req),
    }?;

    // Add CORS headers to all responses
    Ok(response
        .with_header("Access-Control-Allow-Origin", "*")
        .with_header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .with_header("Access-Control-Expose-Headers", "X-TokPulse-XP"))
}
