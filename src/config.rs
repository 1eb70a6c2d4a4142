//! `config.toml` loading.
//!
//! ```toml
//! [logging]
//! level_filter = "info,latency_bench=debug"
//!
//! [transport]
//! kind = "instrumented"
//!
//! [[runs]]
//! name = "uncached"
//! target_url = "http://127.0.0.1:8080/health"
//! total_requests = 200
//! concurrency = 10
//! timeout_ms = 2000
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::ThresholdTable;
use crate::dispatcher::RunConfig;
use crate::errors::ConfigError;
use crate::executor::StatusPolicy;
use crate::logging::{LogRotation, LoggingConfig};
use crate::transport::HttpMethod;

pub const CONFIG_ENV_VAR: &str = "LATENCY_BENCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Config path: explicit argument, then `LATENCY_BENCH_CONFIG`, then `./config.toml`.
pub fn resolve_config_path(arg: Option<String>) -> PathBuf {
    arg.or_else(|| std::env::var(CONFIG_ENV_VAR).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Logging configuration from config.toml
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingTomlConfig {
    pub log_dir: Option<String>,
    pub level_filter: Option<String>,
    /// "daily", "hourly" or "never"
    pub rotation: Option<String>,
    pub console_timestamps: Option<bool>,
    pub file_json_format: Option<bool>,
    pub cleanup_days: Option<u32>,
}

impl LoggingTomlConfig {
    pub fn to_logging_config(&self) -> Result<LoggingConfig, ConfigError> {
        let defaults = LoggingConfig::default();
        let rotation = match &self.rotation {
            Some(value) => LogRotation::parse(value).ok_or_else(|| ConfigError::UnknownValue {
                field: "logging.rotation",
                value: value.clone(),
            })?,
            None => defaults.rotation,
        };

        Ok(LoggingConfig {
            log_dir: self.log_dir.clone().unwrap_or(defaults.log_dir),
            level_filter: self.level_filter.clone().unwrap_or(defaults.level_filter),
            rotation,
            console_timestamps: self.console_timestamps.unwrap_or(defaults.console_timestamps),
            file_json_format: self.file_json_format.unwrap_or(defaults.file_json_format),
            cleanup_days: self.cleanup_days.unwrap_or(defaults.cleanup_days),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Full phase instrumentation
    #[default]
    Instrumented,
    /// reqwest; total and transfer time only
    Reqwest,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransportTomlConfig {
    pub kind: TransportKind,
    pub max_idle_per_host: usize,
}

impl Default for TransportTomlConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Instrumented,
            max_idle_per_host: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheTomlConfig {
    /// LRU bound; unbounded when absent
    pub capacity: Option<usize>,
    pub purge_interval_secs: u64,
}

impl Default for CacheTomlConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            purge_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResourcesTomlConfig {
    pub enabled: bool,
    pub sample_interval_ms: u64,
}

impl Default for ResourcesTomlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: 100,
        }
    }
}

impl ResourcesTomlConfig {
    pub fn interval(&self) -> Option<Duration> {
        if self.enabled && self.sample_interval_ms > 0 {
            Some(Duration::from_millis(self.sample_interval_ms))
        } else {
            None
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_total_requests() -> usize {
    100
}

fn default_concurrency() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_iterations() -> usize {
    1
}

/// One `[[runs]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunToml {
    pub name: String,
    pub target_url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    pub body: Option<String>,
    #[serde(default = "default_total_requests")]
    pub total_requests: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default)]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub warmup_requests: usize,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    pub deadline_secs: Option<u64>,
    #[serde(default)]
    pub failure_statuses: StatusPolicy,
}

impl RunToml {
    pub fn to_run_config(&self) -> Result<RunConfig, ConfigError> {
        Ok(RunConfig {
            name: self.name.clone(),
            url: self.target_url.clone(),
            method: self.method.parse::<HttpMethod>()?,
            headers: self.headers.clone(),
            query_params: self.query_params.clone(),
            body: self.body.clone(),
            keep_alive: self.keep_alive,
            total_requests: self.total_requests,
            concurrency: self.concurrency,
            timeout: Duration::from_millis(self.timeout_ms),
            cache_enabled: self.cache_enabled,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            warmup_requests: self.warmup_requests,
            iterations: self.iterations,
            deadline: self.deadline_secs.map(Duration::from_secs),
            status_policy: self.failure_statuses,
        })
    }
}

/// Whole-file configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingTomlConfig,
    #[serde(default)]
    pub transport: TransportTomlConfig,
    #[serde(default)]
    pub cache: CacheTomlConfig,
    #[serde(default)]
    pub resources: ResourcesTomlConfig,
    #[serde(default)]
    pub thresholds: ThresholdTable,
    #[serde(default)]
    pub runs: Vec<RunToml>,
}

impl AppConfig {
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Run configurations in file order. Each is validated later, before dispatch.
    pub fn run_configs(&self) -> Result<Vec<RunConfig>, ConfigError> {
        if self.runs.is_empty() {
            return Err(ConfigError::NoRuns);
        }
        self.runs.iter().map(RunToml::to_run_config).collect()
    }

    pub fn logging_config(&self) -> Result<LoggingConfig, ConfigError> {
        self.logging.to_logging_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL: &str = r#"
[logging]
log_dir = "bench-logs"
rotation = "hourly"
file_json_format = false

[transport]
kind = "reqwest"

[cache]
capacity = 1000

[thresholds]
dns_ms = 20.0

[[runs]]
name = "uncached"
target_url = "http://127.0.0.1:8080/health"
method = "post"
body = "{}"
total_requests = 50
concurrency = 5
timeout_ms = 1500
keep_alive = false
failure_statuses = "server_errors"
deadline_secs = 60

[runs.headers]
content-type = "application/json"

[[runs]]
name = "cached"
target_url = "http://127.0.0.1:8080/health"
cache_enabled = true
cache_ttl_secs = 3600
warmup_requests = 10
iterations = 3
"#;

    #[test]
    fn test_parses_full_config() {
        let config = AppConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.transport.kind, TransportKind::Reqwest);
        assert_eq!(config.transport.max_idle_per_host, 256);
        assert_eq!(config.cache.capacity, Some(1000));
        assert_eq!(config.cache.purge_interval_secs, 30);
        assert_eq!(config.thresholds.dns_ms, 20.0);
        assert_eq!(config.thresholds.ttfb_ms, 500.0);

        let logging = config.logging_config().unwrap();
        assert_eq!(logging.log_dir, "bench-logs");
        assert_eq!(logging.rotation, LogRotation::Hourly);
        assert!(!logging.file_json_format);

        let runs = config.run_configs().unwrap();
        assert_eq!(runs.len(), 2);
        let first = &runs[0];
        assert_eq!(first.method, HttpMethod::Post);
        assert_eq!(first.timeout, Duration::from_millis(1500));
        assert!(!first.keep_alive);
        assert_eq!(first.status_policy, StatusPolicy::ServerErrors);
        assert_eq!(first.deadline, Some(Duration::from_secs(60)));
        assert_eq!(first.headers.get("content-type").map(String::as_str), Some("application/json"));

        let second = &runs[1];
        assert_eq!(second.method, HttpMethod::Get);
        assert_eq!(second.total_requests, 100);
        assert_eq!(second.cache_ttl, Duration::from_secs(3600));
        assert_eq!(second.iterations, 3);
        assert_eq!(second.status_policy, StatusPolicy::Non2xx);
        assert!(second.validate().is_ok());
    }

    #[test]
    fn test_missing_runs_rejected() {
        let config = AppConfig::from_toml_str("[transport]\nkind = \"instrumented\"").unwrap();
        assert!(matches!(config.run_configs(), Err(ConfigError::NoRuns)));
    }

    #[test]
    fn test_unknown_values_rejected() {
        let bad_method = "[[runs]]\nname = \"x\"\ntarget_url = \"http://a/\"\nmethod = \"BREW\"";
        let config = AppConfig::from_toml_str(bad_method).unwrap();
        assert!(matches!(
            config.run_configs(),
            Err(ConfigError::UnknownValue { field: "method", .. })
        ));

        let bad_rotation = AppConfig::from_toml_str("[logging]\nrotation = \"weekly\"").unwrap();
        assert!(bad_rotation.logging_config().is_err());

        assert!(matches!(
            AppConfig::from_toml_str("[transport]\nkind = \"curl\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = AppConfig::from_toml(file.path()).unwrap();
        assert_eq!(config.runs.len(), 2);

        assert!(matches!(
            AppConfig::from_toml("/nonexistent/latency_bench.toml"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_explicit_config_path_wins() {
        assert_eq!(resolve_config_path(Some("bench.toml".to_string())), PathBuf::from("bench.toml"));
    }

    #[test]
    fn test_resource_interval() {
        assert_eq!(ResourcesTomlConfig::default().interval(), Some(Duration::from_millis(100)));
        let disabled = ResourcesTomlConfig {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(disabled.interval(), None);
    }
}
