//! Thin adapters wiring assignment resolution and exposure recording into their host's
//! request/response shapes.
//!
//! All adapters read identity and carriers from the same headers and cookies:
//!
//! | Source                       | Meaning                         |
//! |------------------------------|---------------------------------|
//! | `X-TokPulse-Org` header      | organization id (required)      |
//! | `X-TokPulse-Store` header    | store id                        |
//! | `X-TokPulse-Customer` header | customer id                     |
//! | `tp_sid` cookie              | session id                      |
//! | `tp_aid` cookie              | anonymous id                    |
//! | `tp_xp_<key>` cookies        | assignment carrier              |
//! | `X-TokPulse-XP` header       | assignment carrier (propagated) |
pub mod edge;
pub mod http;
pub mod render;
pub mod server;

use std::time::Duration;

use crate::{
    carrier::{self, CarrierAssignments, PROPAGATION_HEADER},
    subject::{RequestContext, SubjectIdentity, SubjectKey},
};

use self::http::Headers;

pub const ORG_HEADER: &str = "X-TokPulse-Org";
pub const STORE_HEADER: &str = "X-TokPulse-Store";
pub const CUSTOMER_HEADER: &str = "X-TokPulse-Customer";
pub const SESSION_COOKIE: &str = "tp_sid";
pub const ANONYMOUS_COOKIE: &str = "tp_aid";

/// Look up a cookie across every `Cookie` header.
fn cookie<'a>(headers: &'a Headers, name: &'a str) -> Option<&'a str> {
    headers
        .get_all("Cookie")
        .flat_map(carrier::parse_cookies)
        .find_map(|(cookie_name, value)| (cookie_name == name).then_some(value))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Identifiers of the end user carried by the request.
pub fn subject_identity(headers: &Headers) -> SubjectIdentity {
    SubjectIdentity {
        customer_id: non_empty(headers.get(CUSTOMER_HEADER)).map(str::to_owned),
        session_id: non_empty(cookie(headers, SESSION_COOKIE)).map(str::to_owned),
        anonymous_id: non_empty(cookie(headers, ANONYMOUS_COOKIE)).map(str::to_owned),
    }
}

/// Build the request context. Returns `None` if the organization header is missing or empty.
pub fn request_context(headers: &Headers) -> Option<RequestContext> {
    let org_id = non_empty(headers.get(ORG_HEADER))?;
    let ctx = RequestContext::new(org_id, subject_identity(headers).subject_key());

    Some(match non_empty(headers.get(STORE_HEADER)) {
        Some(store_id) => ctx.with_store_id(store_id),
        None => ctx,
    })
}

/// Assignments the request already carries. Cookies win over the propagation header when both
/// name the same experiment.
pub fn inbound_carrier(headers: &Headers) -> CarrierAssignments {
    let mut assignments = CarrierAssignments::new();
    for header in headers.get_all(PROPAGATION_HEADER) {
        assignments.extend(carrier::parse_propagation_header(header));
    }
    for header in headers.get_all("Cookie") {
        assignments.extend(carrier::parse_cookie_header(header));
    }
    assignments
}

/// `Set-Cookie` value persisting a generated subject key. `None` for stable keys.
pub fn anonymous_id_cookie(subject: &SubjectKey, max_age: Duration) -> Option<String> {
    subject
        .is_ephemeral()
        .then(|| carrier::cookie(ANONYMOUS_COOKIE, subject.as_str(), max_age))
}
