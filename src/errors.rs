use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid run parameters. Raised before any request is dispatched.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Total request count must be positive")]
    ZeroRequests,
    #[error("Concurrency level must be positive")]
    ZeroConcurrency,
    #[error("Concurrency {concurrency} exceeds total request count {total_requests}")]
    ConcurrencyExceedsTotal { concurrency: usize, total_requests: usize },
    #[error("Per-request timeout must be non-zero")]
    ZeroTimeout,
    #[error("Cache TTL must be non-zero when caching is enabled")]
    ZeroCacheTtl,
    #[error("Iteration count must be positive")]
    ZeroIterations,
    #[error("Invalid target '{url}': {reason}")]
    InvalidTarget { url: String, reason: String },
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Invalid header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("Unknown value '{value}' for {field}")]
    UnknownValue { field: &'static str, value: String },
    #[error("No benchmark runs configured")]
    NoRuns,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure of a single request before a complete response was received.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TransportError {
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("HTTP protocol error: {0}")]
    Protocol(String),
    #[error("Response body error: {0}")]
    Body(String),
    #[error("Request could not be built: {0}")]
    Request(String),
}

impl TransportError {
    /// Stable short label used for error breakdowns.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Dns(_) => "dns",
            TransportError::Connect(_) => "connect",
            TransportError::Tls(_) => "tls",
            TransportError::Timeout { .. } => "timeout",
            TransportError::Protocol(_) => "protocol",
            TransportError::Body(_) => "body",
            TransportError::Request(_) => "request",
        }
    }
}

/// Top-level error for the engine and the binary.
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("HTTP client error: {0}")]
    Client(String),
    #[error("Logging initialization error: {0}")]
    Logging(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
