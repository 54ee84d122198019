//! Plain request/response shapes the adapters work with. Host runtimes (Fastly, an API framework,
//! a test) translate their own types into these.
use std::sync::Arc;

use serde::Serialize;

use crate::{Error, Result};

/// Case-insensitive header multimap preserving insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    /// Add a value, keeping existing values of the same header.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Set a header, dropping any previous values.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// First value of the header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl InboundRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> InboundRequest {
        InboundRequest {
            method: method.into(),
            path: path.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl OutboundResponse {
    /// Response with a JSON body and matching `Content-Type`.
    pub fn json(status: u16, body: &impl Serialize) -> Result<OutboundResponse> {
        let body = serde_json::to_vec(body).map_err(|err| Error::Serialization(Arc::new(err)))?;
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/json");
        Ok(OutboundResponse {
            status,
            headers,
            body,
        })
    }

    /// Response with a `{"error": message}` body.
    pub fn error(status: u16, message: &str) -> OutboundResponse {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/json");
        OutboundResponse {
            status,
            headers,
            body: serde_json::json!({ "error": message }).to_string().into_bytes(),
        }
    }
}
