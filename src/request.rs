//! The request contract - what a caller hands to the pipeline
//!
//! `LogRequest` is a plain value, not a framework type: the embedding
//! application copies whatever its HTTP layer holds into this shape. The
//! body is `bytes::Bytes` so handing it to the pipeline never consumes the
//! caller's copy.

use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Multi-map of request headers with case-insensitive lookup.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercased name → value object; repeated headers join with `", "`.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, value) in self.iter() {
            let key = name.to_ascii_lowercase();
            match map.get_mut(&key) {
                Some(serde_json::Value::String(existing)) => {
                    existing.push_str(", ");
                    existing.push_str(value);
                }
                _ => {
                    map.insert(key, serde_json::Value::String(value.to_string()));
                }
            }
        }
        serde_json::Value::Object(map)
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(n, v)| (n.into(), v.into())).collect())
    }
}

/// Bot-management annotations supplied by the edge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotManagement {
    pub score: Option<i64>,
    pub verified_bot: Option<bool>,
    pub ja3_hash: Option<String>,
    pub corporate_proxy: Option<bool>,
}

/// The edge annotation bag (the `cf` object). Every field is optional;
/// missing annotations map to null columns.
#[derive(Debug, Clone, Default)]
pub struct EdgeData {
    pub asn: Option<i64>,
    pub colo: Option<String>,
    pub continent: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub region_code: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub timezone: Option<String>,
    pub http_protocol: Option<String>,
    pub tls_cipher: Option<String>,
    pub tls_version: Option<String>,
    pub tls_client_random: Option<String>,
    pub tls_client_auth: Option<serde_json::Value>,
    pub client_tcp_rtt: Option<i64>,
    pub threat_score: Option<i64>,
    pub bot_management: Option<BotManagement>,
}

/// An incoming request as seen by the pipeline.
#[derive(Debug, Clone, Default)]
pub struct LogRequest {
    pub method: String,
    /// Absolute URL as received.
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub cf: EdgeData,
}

impl LogRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_cf(mut self, cf: EdgeData) -> Self {
        self.cf = cf;
        self
    }
}

/// Per-request evaluation context shared by the filter engine and the
/// assembler. Parses the URL and the cookie header at most once per request
/// no matter how many rules or fields touch them.
pub struct RequestContext<'a> {
    request: &'a LogRequest,
    parsed_url: OnceCell<Option<Url>>,
    cookies: OnceCell<HashMap<String, String>>,
}

impl<'a> RequestContext<'a> {
    pub fn new(request: &'a LogRequest) -> Self {
        Self {
            request,
            parsed_url: OnceCell::new(),
            cookies: OnceCell::new(),
        }
    }

    pub fn request(&self) -> &LogRequest {
        self.request
    }

    /// Parsed URL, memoized. `None` when the raw URL does not parse.
    pub fn url(&self) -> Option<&Url> {
        self.parsed_url
            .get_or_init(|| Url::parse(&self.request.url).ok())
            .as_ref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.headers.get(name)
    }

    /// Cookie value by name. The cookie header is parsed and memoized on
    /// first access.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        let jar = self.cookies.get_or_init(|| {
            let mut jar = HashMap::new();
            if let Some(raw) = self.request.headers.get("cookie") {
                for pair in raw.split(';') {
                    if let Some((k, v)) = pair.split_once('=') {
                        jar.insert(k.trim().to_string(), v.trim().to_string());
                    }
                }
            }
            jar
        });
        jar.get(name).map(String::as_str)
    }
}
