//! Subject identity and the per-request context assignments are resolved in.
use chrono::Utc;
use rand::{thread_rng, Rng};
use serde::Serialize;

use crate::Str;

/// Where a [`SubjectKey`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubjectOrigin {
    Customer,
    Session,
    Anonymous,
    /// Freshly generated for this request. Not stable.
    Generated,
}

/// Opaque key identifying the end user for bucketing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectKey {
    key: Str,
    origin: SubjectOrigin,
}

impl SubjectKey {
    pub fn new(key: impl Into<Str>, origin: SubjectOrigin) -> SubjectKey {
        SubjectKey {
            key: key.into(),
            origin,
        }
    }

    /// Generate a new ephemeral subject key.
    ///
    /// Every call returns a different key, so a subject identified this way gets a new bucket on
    /// every request unless the caller persists the key (see [`SubjectKey::is_ephemeral`]).
    pub fn generate() -> SubjectKey {
        let key = format!(
            "anon_{}_{:08x}",
            Utc::now().timestamp_millis(),
            thread_rng().gen::<u32>()
        );
        SubjectKey::new(key, SubjectOrigin::Generated)
    }

    pub fn key(&self) -> &Str {
        &self.key
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn origin(&self) -> SubjectOrigin {
        self.origin
    }

    /// Returns `true` if the key was generated for this request and must be persisted by the caller
    /// (e.g., written back as a cookie) to keep assignments stable.
    pub fn is_ephemeral(&self) -> bool {
        self.origin == SubjectOrigin::Generated
    }
}

impl std::fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// Identifiers known about the end user, in any combination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectIdentity {
    pub customer_id: Option<String>,
    pub session_id: Option<String>,
    pub anonymous_id: Option<String>,
}

impl SubjectIdentity {
    /// Pick the subject key: customer id, then session id, then anonymous id, then a freshly
    /// generated key. Empty ids count as absent.
    pub fn subject_key(&self) -> SubjectKey {
        let candidates = [
            (&self.customer_id, SubjectOrigin::Customer),
            (&self.session_id, SubjectOrigin::Session),
            (&self.anonymous_id, SubjectOrigin::Anonymous),
        ];

        candidates
            .into_iter()
            .find_map(|(id, origin)| match id.as_deref() {
                Some(id) if !id.is_empty() => Some(SubjectKey::new(id, origin)),
                _ => None,
            })
            .unwrap_or_else(SubjectKey::generate)
    }
}

/// Identity context of a single request or render cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub org_id: Str,
    /// Carried into exposure events. Not part of the bucketing scope.
    pub store_id: Option<Str>,
    pub subject: SubjectKey,
}

impl RequestContext {
    pub fn new(org_id: impl Into<Str>, subject: SubjectKey) -> RequestContext {
        RequestContext {
            org_id: org_id.into(),
            store_id: None,
            subject,
        }
    }

    pub fn with_store_id(mut self, store_id: impl Into<Str>) -> RequestContext {
        self.store_id = Some(store_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(customer: Option<&str>, session: Option<&str>, anon: Option<&str>) -> SubjectIdentity {
        SubjectIdentity {
            customer_id: customer.map(str::to_owned),
            session_id: session.map(str::to_owned),
            anonymous_id: anon.map(str::to_owned),
        }
    }

    #[test]
    fn customer_id_wins() {
        let key = identity(Some("cust"), Some("sess"), Some("anon")).subject_key();
        assert_eq!(key, SubjectKey::new("cust", SubjectOrigin::Customer));
    }

    #[test]
    fn falls_back_through_session_and_anonymous() {
        let key = identity(None, Some("sess"), Some("anon")).subject_key();
        assert_eq!(key, SubjectKey::new("sess", SubjectOrigin::Session));

        let key = identity(Some(""), None, Some("anon")).subject_key();
        assert_eq!(key, SubjectKey::new("anon", SubjectOrigin::Anonymous));
    }

    // Generated keys are not stable across calls. Callers have to persist them; the library does
    // not try to derive a stable key from the request.
    #[test]
    fn generated_key_is_ephemeral_and_unstable() {
        let identity = SubjectIdentity::default();
        let first = identity.subject_key();
        let second = identity.subject_key();

        assert!(first.is_ephemeral());
        assert!(first.as_str().starts_with("anon_"));
        assert_ne!(first, second);
    }
}
