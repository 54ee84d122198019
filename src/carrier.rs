//! Assignment carriers: the cookie and header formats used to persist assignments between requests
//! and to propagate them to downstream services.
//!
//! Cookie carrier, one cookie per experiment:
//! ```text
//! tp_xp_<experimentKey>=<variantKey>; Max-Age=2592000; SameSite=Lax; Path=/
//! ```
//!
//! Header carrier, all current assignments in one header:
//! ```text
//! X-TokPulse-XP: <key1>=<variant1>,<key2>=<variant2>
//! ```
use std::{collections::BTreeMap, sync::OnceLock, time::Duration};

use regex::Regex;

use crate::{
    assignment::{AssignmentSet, AssignmentSource},
    Str,
};

/// Prefix of assignment cookie names.
pub const COOKIE_PREFIX: &str = "tp_xp_";

/// Header used to propagate assignments to downstream consumers.
pub const PROPAGATION_HEADER: &str = "X-TokPulse-XP";

/// Default lifetime of an assignment cookie.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Experiment key to variant key, as read from a carrier.
pub type CarrierAssignments = BTreeMap<Str, Str>;

// Keys and variants end up in cookie names and in a comma/equals separated header, so they are
// restricted to characters that survive both.
const TOKEN_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,127}$";

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(TOKEN_PATTERN).expect("token pattern should compile"))
}

/// Returns `true` if `value` can be used as an experiment or variant key in a carrier.
pub fn is_valid_token(value: &str) -> bool {
    token_regex().is_match(value)
}

/// Split a `Cookie` header into name/value pairs. Entries without `=` are skipped; surrounding
/// double quotes are stripped from values.
pub fn parse_cookies(header: &str) -> impl Iterator<Item = (&str, &str)> {
    header.split(';').filter_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        (!name.is_empty()).then_some((name, value))
    })
}

/// Read assignments from a `Cookie` header. Unrelated cookies and malformed entries are ignored.
pub fn parse_cookie_header(header: &str) -> CarrierAssignments {
    parse_cookies(header)
        .filter_map(|(name, value)| {
            let experiment_key = name.strip_prefix(COOKIE_PREFIX)?;
            carrier_entry(experiment_key, value)
        })
        .collect()
}

/// Read assignments from a propagation header value. Malformed entries are ignored.
pub fn parse_propagation_header(header: &str) -> CarrierAssignments {
    header
        .split(',')
        .filter_map(|pair| {
            let (experiment_key, variant_key) = pair.split_once('=')?;
            carrier_entry(experiment_key.trim(), variant_key.trim())
        })
        .collect()
}

fn carrier_entry(experiment_key: &str, variant_key: &str) -> Option<(Str, Str)> {
    if is_valid_token(experiment_key) && is_valid_token(variant_key) {
        Some((experiment_key.into(), variant_key.into()))
    } else {
        log::debug!(target: "tokpulse", experiment_key, variant_key; "skipping malformed carrier entry");
        None
    }
}

/// Build a `Set-Cookie` value persisting one assignment.
pub fn set_cookie(experiment_key: &str, variant_key: &str, max_age: Duration) -> String {
    cookie(&format!("{COOKIE_PREFIX}{experiment_key}"), variant_key, max_age)
}

/// Build a site-wide `Set-Cookie` value with the attributes shared by every cookie we write.
pub fn cookie(name: &str, value: &str, max_age: Duration) -> String {
    format!(
        "{name}={value}; Max-Age={}; SameSite=Lax; Path=/",
        max_age.as_secs()
    )
}

/// Build the propagation header value. Returns `None` when there is nothing to propagate.
pub fn propagation_header<'a>(
    assignments: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Option<String> {
    let value = assignments
        .into_iter()
        .map(|(experiment_key, variant_key)| format!("{experiment_key}={variant_key}"))
        .collect::<Vec<_>>()
        .join(",");
    (!value.is_empty()).then_some(value)
}

/// Carrier changes to apply to an outbound response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarrierUpdate {
    /// One `Set-Cookie` value per assignment resolved during this request.
    pub set_cookies: Vec<String>,
    /// Value for [`PROPAGATION_HEADER`] listing every current assignment.
    pub propagation_header: Option<String>,
}

impl CarrierUpdate {
    pub fn from_assignment_set(set: &AssignmentSet, max_age: Duration) -> CarrierUpdate {
        let set_cookies = set
            .iter()
            .filter(|(_, entry)| entry.source == AssignmentSource::Resolved)
            .map(|(key, entry)| set_cookie(key, &entry.assignment.variant_key, max_age))
            .collect();

        CarrierUpdate {
            set_cookies,
            propagation_header: propagation_header(
                set.iter()
                    .map(|(key, entry)| (key.as_str(), entry.assignment.variant_key.as_str())),
            ),
        }
    }
}
