//! Dual console + rotating file logging.
//!
//! Console output is human readable; file output goes through a non-blocking
//! rotating appender and is JSON by default so runs can be analysed afterwards.

use std::path::PathBuf;
use tracing_appender::non_blocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::errors::BenchError;

const LOG_FILE_PREFIX: &str = "latency_bench";
const DEFAULT_FILTER: &str = "info,latency_bench=info";

/// Logging configuration options
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Directory to store log files
    pub log_dir: String,
    /// Log level filter (e.g., "info", "latency_bench=debug"); `RUST_LOG` takes precedence
    pub level_filter: String,
    pub rotation: LogRotation,
    /// Whether to include timestamps in console output
    pub console_timestamps: bool,
    /// Whether to use JSON format for file logs
    pub file_json_format: bool,
    /// Days to keep rotated log files
    pub cleanup_days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Daily,
    /// For debugging heavy runs
    Hourly,
    /// Single file, no rotation
    Never,
}

impl LogRotation {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "daily" => Some(LogRotation::Daily),
            "hourly" => Some(LogRotation::Hourly),
            "never" => Some(LogRotation::Never),
            _ => None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            level_filter: DEFAULT_FILTER.to_string(),
            rotation: LogRotation::Daily,
            console_timestamps: true,
            file_json_format: true,
            cleanup_days: 30,
        }
    }
}

/// Initialize dual output logging (console + rotating files)
///
/// File structure:
/// - logs/latency_bench.log.YYYY-MM-DD (daily rotation)
/// - logs/latency_bench.log.YYYY-MM-DD-HH (hourly rotation)
///
/// Returns a guard that must be kept alive for the duration of the application
/// so the background writer keeps flushing.
pub fn init_dual_logging(config: &LoggingConfig) -> Result<WorkerGuard, BenchError> {
    std::fs::create_dir_all(&config.log_dir)?;

    let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level_filter));
    let file_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level_filter));

    let file_name = format!("{}.log", LOG_FILE_PREFIX);
    let file_appender = match config.rotation {
        LogRotation::Daily => tracing_appender::rolling::daily(&config.log_dir, &file_name),
        LogRotation::Hourly => tracing_appender::rolling::hourly(&config.log_dir, &file_name),
        LogRotation::Never => tracing_appender::rolling::never(&config.log_dir, &file_name),
    };
    let (file_writer, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_level(true)
        .with_target(true)
        .with_timer(if config.console_timestamps {
            ChronoUtc::new("%Y-%m-%d %H:%M:%S%.3f UTC".to_string())
        } else {
            ChronoUtc::new(String::new())
        })
        .with_filter(console_filter);

    let file_layer = if config.file_json_format {
        fmt::layer()
            .json()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_level(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_timer(ChronoUtc::new("%Y-%m-%dT%H:%M:%S%.3fZ".to_string()))
            .with_filter(file_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_level(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_timer(ChronoUtc::new("%Y-%m-%d %H:%M:%S%.3f UTC".to_string()))
            .with_filter(file_filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| BenchError::Logging(e.to_string()))?;

    tracing::info!(
        log_dir = %config.log_dir,
        rotation = ?config.rotation,
        json_format = config.file_json_format,
        "📁 Dual logging initialized - console + rotating files"
    );

    Ok(guard)
}

/// Initialize simple console logging for tests or minimal setups.
/// Calling it more than once is harmless.
pub fn init_simple_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("🖥️ Simple console logging initialized");
    }
}

/// Log files written by this tool, sorted by name
pub fn get_current_log_files(log_dir: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_log_file(path))
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

/// Remove log files older than `keep_days`, returning how many were deleted
pub fn cleanup_old_logs(log_dir: &str, keep_days: u32) -> Result<usize, std::io::Error> {
    let cutoff_time = std::time::SystemTime::now() - std::time::Duration::from_secs(keep_days as u64 * 24 * 3600);

    let mut removed_count = 0;
    for path in get_current_log_files(log_dir) {
        let modified = match path.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        if modified < cutoff_time && std::fs::remove_file(&path).is_ok() {
            removed_count += 1;
            tracing::debug!("🗑️ Removed old log file: {:?}", path);
        }
    }

    if removed_count > 0 {
        tracing::info!("🧹 Cleaned up {} old log files (older than {} days)", removed_count, keep_days);
    }

    Ok(removed_count)
}

// Rolling appenders put the date after ".log", so match on the prefix.
fn is_log_file(path: &std::path::Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with(LOG_FILE_PREFIX) && name.contains(".log"))
        .unwrap_or(false)
}

/// Log basic system information for debugging
pub fn log_system_info() {
    tracing::info!(
        package_version = env!("CARGO_PKG_VERSION"),
        target_arch = std::env::consts::ARCH,
        target_os = std::env::consts::OS,
        "📊 Environment information logged"
    );

    tracing::info!(cpu_count = num_cpus::get(), "🖥️ Hardware information logged");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.log_dir, "logs");
        assert_eq!(config.level_filter, "info,latency_bench=info");
        assert_eq!(config.rotation, LogRotation::Daily);
        assert!(config.console_timestamps);
        assert!(config.file_json_format);
        assert_eq!(config.cleanup_days, 30);
    }

    #[test]
    fn test_rotation_parsing() {
        assert_eq!(LogRotation::parse("Hourly"), Some(LogRotation::Hourly));
        assert_eq!(LogRotation::parse("never"), Some(LogRotation::Never));
        assert_eq!(LogRotation::parse("weekly"), None);
    }

    #[test]
    fn test_get_current_log_files() {
        let temp_dir = TempDir::new().unwrap();
        let log_dir = temp_dir.path();

        std::fs::write(log_dir.join("latency_bench.log.2025-01-01"), "test").unwrap();
        std::fs::write(log_dir.join("latency_bench.log.2025-01-02"), "test").unwrap();
        std::fs::write(log_dir.join("other.log"), "test").unwrap();
        std::fs::write(log_dir.join("latency_bench.txt"), "test").unwrap();

        let log_files = get_current_log_files(log_dir.to_str().unwrap());
        assert_eq!(log_files.len(), 2);
        assert!(log_files[0].to_string_lossy().ends_with("2025-01-01"));
        assert!(log_files[1].to_string_lossy().ends_with("2025-01-02"));
    }

    #[test]
    fn test_cleanup_keeps_recent_logs() {
        let temp_dir = TempDir::new().unwrap();
        let log_dir = temp_dir.path();
        std::fs::write(log_dir.join("latency_bench.log.recent"), "recent").unwrap();

        let removed = cleanup_old_logs(log_dir.to_str().unwrap(), 7).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(get_current_log_files(log_dir.to_str().unwrap()).len(), 1);
    }

    #[test]
    fn test_cleanup_missing_dir_is_noop() {
        assert_eq!(cleanup_old_logs("/nonexistent/latency_bench_logs", 1).unwrap(), 0);
    }

    #[test]
    fn test_simple_logging_can_be_called_twice() {
        init_simple_logging();
        init_simple_logging();
    }
}
