//! Outbound HTTP transports.
//!
//! [`Transport`] is the seam between the executor and the network. The
//! [`instrumented::InstrumentedTransport`] drives DNS, connect and TLS itself
//! so every phase boundary is observed; [`reqwest_client::ReqwestTransport`]
//! wraps a reqwest client, which exposes no connection hooks, and therefore
//! reports only total and transfer time.

pub mod instrumented;
pub mod reqwest_client;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use url::{Host, Url};

use crate::cache::CacheKey;
use crate::errors::{ConfigError, TransportError};
use crate::timing::PhaseBreakdown;

pub use instrumented::InstrumentedTransport;
pub use reqwest_client::ReqwestTransport;

/// HTTP request methods supported by the transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            _ => Err(ConfigError::UnknownValue { field: "method", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

/// Validated request identity plus request shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    url: Url,
    scheme: Scheme,
    method: HttpMethod,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    keep_alive: bool,
}

impl Target {
    /// Parse and validate an absolute http(s) URL.
    pub fn parse(url: &str, method: HttpMethod) -> Result<Self, ConfigError> {
        let parsed = Url::parse(url).map_err(|e| ConfigError::InvalidTarget {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let scheme = match parsed.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };

        if parsed.host().is_none() {
            return Err(ConfigError::InvalidTarget {
                url: url.to_string(),
                reason: "missing host".to_string(),
            });
        }

        Ok(Self {
            url: parsed,
            scheme,
            method,
            headers: Vec::new(),
            body: None,
            keep_alive: true,
        })
    }

    /// Add a request header, validating name and value.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, ConfigError> {
        HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConfigError::InvalidHeader {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        HeaderValue::from_str(value).map_err(|e| ConfigError::InvalidHeader {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        self.headers.push((name.to_string(), value.to_string()));
        Ok(self)
    }

    pub fn with_headers(self, headers: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        headers
            .iter()
            .try_fold(self, |target, (name, value)| target.with_header(name, value))
    }

    pub fn with_query_params(mut self, params: &BTreeMap<String, String>) -> Self {
        if !params.is_empty() {
            let mut pairs = self.url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Host without IPv6 brackets, suitable for DNS lookups and TLS SNI.
    pub fn host(&self) -> String {
        match self.url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => String::new(),
        }
    }

    /// The host as an address when it is an IP literal; no DNS lookup is needed then.
    pub fn ip_literal(&self) -> Option<IpAddr> {
        match self.url.host() {
            Some(Host::Ipv4(ip)) => Some(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => Some(IpAddr::V6(ip)),
            _ => None,
        }
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(match self.scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        })
    }

    /// Value for the `Host` header.
    pub fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    pub fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.method, self.url.as_str())
            .with_headers(&self.headers)
            .with_body(self.body.as_deref())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A complete HTTP response as seen by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Negotiated protocol, e.g. `HTTP/1.1`.
    pub protocol: String,
}

/// Result of one request attempt together with whatever timing was observed,
/// including partial phases of a failed attempt.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub phases: PhaseBreakdown,
    pub total: Duration,
    pub result: Result<HttpResponse, TransportError>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request, bounded by `timeout`. Never panics on network errors.
    async fn execute(&self, target: &Target, timeout: Duration) -> Exchange;

    /// Short transport identifier for logs and reports.
    fn name(&self) -> &'static str;
}

pub(crate) fn timeout_error(timeout: Duration) -> TransportError {
    TransportError::Timeout {
        timeout_ms: timeout.as_millis().min(u64::MAX as u128) as u64,
    }
}
