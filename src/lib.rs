//! Concurrent HTTP latency benchmarking engine.
//!
//! A [`dispatcher::Dispatcher`] issues a configured number of requests at a
//! bounded concurrency through a [`transport::Transport`], each request
//! instrumented by a [`timing::PhaseTimer`]. The collected samples are reduced
//! by [`stats::StatisticsAggregator`] and labelled by
//! [`classifier::Classifier`]; [`report::RunReport`] bundles the three into a
//! serializable record.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod report;
pub mod resources;
pub mod stats;
pub mod suite;
pub mod timing;
pub mod transport;

pub use cache::{CacheKey, CacheStats, CachedResponse, FillGuard, FillSlot, ResponseCache, TtlCache};
pub use classifier::{ClassificationContext, ClassificationResult, ClassificationRule, Classifier, Finding, ThresholdTable};
pub use dispatcher::{BenchmarkRun, Dispatcher, RunConfig, RunResult};
pub use errors::{BenchError, ConfigError, TransportError};
pub use executor::{ExecutorSettings, RequestExecutor, RequestOutcome, RequestSample, StatusPolicy};
pub use report::{RunComparison, RunReport};
pub use resources::{ResourceMonitor, ResourceUsage};
pub use stats::{AggregateStatistics, LatencyStats, PhaseStatistics, StatisticsAggregator};
pub use suite::{BenchmarkSuite, SuiteOutcome};
pub use timing::{Phase, PhaseBreakdown, PhaseTimer};
pub use transport::{Exchange, HttpMethod, HttpResponse, InstrumentedTransport, ReqwestTransport, Target, Transport};
