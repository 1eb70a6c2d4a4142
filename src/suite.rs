//! Sequential execution of several named runs.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::classifier::{ClassificationContext, Classifier};
use crate::dispatcher::{BenchmarkRun, Dispatcher, RunConfig};
use crate::errors::ConfigError;
use crate::report::{RunComparison, RunReport};
use crate::resources::ResourceMonitor;
use crate::stats::StatisticsAggregator;

/// Reports of a suite, in execution order.
#[derive(Debug, Clone)]
pub struct SuiteOutcome {
    pub reports: Vec<RunReport>,
    /// Every later report compared with the first one.
    pub comparisons: Vec<RunComparison>,
    pub cancelled: bool,
}

pub struct BenchmarkSuite {
    dispatcher: Dispatcher,
    classifier: Classifier,
    monitor_interval: Option<Duration>,
}

impl BenchmarkSuite {
    pub fn new(dispatcher: Dispatcher, classifier: Classifier) -> Self {
        Self {
            dispatcher,
            classifier,
            monitor_interval: Some(ResourceMonitor::DEFAULT_INTERVAL),
        }
    }

    /// Sample process resources at `interval`, or not at all with `None`.
    pub fn with_resource_monitoring(mut self, interval: Option<Duration>) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Validate every configuration, then run each for its iteration count.
    /// Cancelling `cancel` stops the suite after the run in progress and keeps
    /// its reports. A run that ends on its own deadline does not stop the suite.
    pub async fn run(&self, configs: &[RunConfig], cancel: CancellationToken) -> Result<SuiteOutcome, ConfigError> {
        if configs.is_empty() {
            return Err(ConfigError::NoRuns);
        }
        let runs = configs
            .iter()
            .map(RunConfig::validate)
            .collect::<Result<Vec<_>, _>>()?;

        info!("📋 Running suite of {} benchmark runs", runs.len());
        let mut reports = Vec::new();

        'runs: for run in runs {
            for iteration in 1..=run.iterations {
                if cancel.is_cancelled() {
                    break 'runs;
                }
                reports.push(self.run_iteration(&run, iteration, &cancel).await);
            }
        }

        let comparisons = match reports.split_first() {
            Some((baseline, rest)) => rest.iter().map(|r| RunComparison::between(baseline, r)).collect(),
            None => Vec::new(),
        };

        let cancelled = cancel.is_cancelled();
        if cancelled {
            warn!("⚠️ Suite cancelled after {} reports", reports.len());
        }

        Ok(SuiteOutcome {
            reports,
            comparisons,
            cancelled,
        })
    }

    async fn run_iteration(&self, run: &BenchmarkRun, iteration: usize, cancel: &CancellationToken) -> RunReport {
        let mut run = run.clone();
        if iteration > 1 {
            run.warmup_requests = 0;
        }
        info!("▶️ {} iteration {}/{}", run.name, iteration, run.iterations);

        let monitor = self.monitor_interval.map(ResourceMonitor::start);
        let result = self.dispatcher.execute(run, cancel.clone()).await;
        let resources = match monitor {
            Some(monitor) => monitor.stop().await,
            None => None,
        };

        let statistics = StatisticsAggregator::aggregate(&result);
        let context = ClassificationContext {
            cache_enabled: result.run.cache_enabled,
            keep_alive: result.run.target.keep_alive(),
            concurrency: result.run.concurrency,
            resources,
        };
        let classification = self.classifier.classify(&statistics, &context);

        RunReport::new(
            &result,
            statistics,
            classification,
            resources,
            self.dispatcher.transport().name(),
            iteration,
        )
    }
}
