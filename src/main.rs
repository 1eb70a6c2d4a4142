use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use latency_bench::cache::{ResponseCache, TtlCache};
use latency_bench::classifier::Classifier;
use latency_bench::config::{resolve_config_path, AppConfig, TransportKind};
use latency_bench::errors::BenchError;
use latency_bench::logging::{cleanup_old_logs, init_dual_logging, init_simple_logging, log_system_info};
use latency_bench::suite::BenchmarkSuite;
use latency_bench::transport::{InstrumentedTransport, ReqwestTransport, Transport};
use latency_bench::Dispatcher;

#[tokio::main]
async fn main() -> Result<(), BenchError> {
    let config_path = resolve_config_path(std::env::args().nth(1));
    let config = match AppConfig::from_toml(&config_path) {
        Ok(config) => config,
        Err(e) => {
            // Logging is configured from the file, so fall back to the console.
            init_simple_logging();
            error!("❌ Failed to load {}: {}", config_path.display(), e);
            return Err(e.into());
        }
    };

    let logging_config = config.logging_config()?;
    let _logging_guard = match init_dual_logging(&logging_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("❌ Failed to initialize logging system: {}", e);
            init_simple_logging();
            warn!("⚠️ Using fallback console-only logging due to error: {}", e);
            None
        }
    };

    if let Err(e) = cleanup_old_logs(&logging_config.log_dir, logging_config.cleanup_days) {
        warn!("⚠️ Failed to clean up old log files: {}", e);
    }
    log_system_info();

    let runs = config.run_configs()?;
    info!(
        config = %config_path.display(),
        runs = runs.len(),
        transport = ?config.transport.kind,
        cache_capacity = ?config.cache.capacity,
        "🔧 Configuration loaded"
    );

    let transport: Arc<dyn Transport> = match config.transport.kind {
        TransportKind::Instrumented => Arc::new(InstrumentedTransport::with_max_idle_per_host(
            config.transport.max_idle_per_host,
        )?),
        TransportKind::Reqwest => Arc::new(ReqwestTransport::with_max_idle_per_host(
            config.transport.max_idle_per_host,
        )?),
    };

    let cache: Arc<ResponseCache> = Arc::new(match config.cache.capacity {
        Some(capacity) => TtlCache::with_capacity(capacity),
        None => TtlCache::new(),
    });

    let shutdown = CancellationToken::new();
    let purge_task = (config.cache.purge_interval_secs > 0).then(|| {
        TtlCache::spawn_purge_task(
            cache.clone(),
            Duration::from_secs(config.cache.purge_interval_secs),
            shutdown.child_token(),
        )
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Shutdown signal received, cancelling active run");
            signal_token.cancel();
        }
    });

    let suite = BenchmarkSuite::new(
        Dispatcher::new(transport, Some(cache.clone())),
        Classifier::new(config.thresholds.clone()),
    )
    .with_resource_monitoring(config.resources.interval());

    info!("🚀 Starting latency benchmark");
    let outcome = suite.run(&runs, shutdown.clone()).await?;

    for report in &outcome.reports {
        report.log_summary();
        info!("{}", report.to_json()?);
    }
    for comparison in &outcome.comparisons {
        comparison.log_summary();
    }

    let cache_stats = cache.stats();
    info!(
        hits = cache_stats.hits,
        misses = cache_stats.misses,
        evictions = cache_stats.evictions,
        expirations = cache_stats.expirations,
        "🗄️ Shared cache statistics"
    );

    shutdown.cancel();
    if let Some(task) = purge_task {
        if let Err(e) = task.await {
            warn!("⚠️ Cache purge task ended abnormally: {}", e);
        }
    }

    if outcome.cancelled {
        warn!("⚠️ Benchmark interrupted; partial results reported above");
    }
    info!("🏁 Benchmark completed");
    Ok(())
}
