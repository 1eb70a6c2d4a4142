//! Bounded-concurrency request dispatch.
//!
//! A run's total request count is split across `concurrency` workers, each
//! issuing its share sequentially, so at most `concurrency` requests are ever in
//! flight. Workers accumulate samples locally and the dispatcher merges them once
//! every worker has finished.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheStats, ResponseCache, TtlCache};
use crate::errors::ConfigError;
use crate::executor::{ExecutorSettings, RequestExecutor, RequestSample, StatusPolicy};
use crate::transport::{HttpMethod, Target, Transport};

/// Caller-supplied run parameters, validated into a [`BenchmarkRun`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub body: Option<String>,
    pub keep_alive: bool,
    pub total_requests: usize,
    pub concurrency: usize,
    pub timeout: Duration,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    /// Requests issued before the measured run; their samples are discarded.
    pub warmup_requests: usize,
    pub iterations: usize,
    /// Overall deadline for the measured run.
    pub deadline: Option<Duration>,
    pub status_policy: StatusPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            url: String::new(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            body: None,
            keep_alive: true,
            total_requests: 100,
            concurrency: 10,
            timeout: Duration::from_secs(30),
            cache_enabled: false,
            cache_ttl: Duration::from_secs(300),
            warmup_requests: 0,
            iterations: 1,
            deadline: None,
            status_policy: StatusPolicy::Non2xx,
        }
    }
}

impl RunConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Check every parameter and build the immutable run snapshot.
    pub fn validate(&self) -> Result<BenchmarkRun, ConfigError> {
        if self.total_requests == 0 {
            return Err(ConfigError::ZeroRequests);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.concurrency > self.total_requests {
            return Err(ConfigError::ConcurrencyExceedsTotal {
                concurrency: self.concurrency,
                total_requests: self.total_requests,
            });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.cache_enabled && self.cache_ttl.is_zero() {
            return Err(ConfigError::ZeroCacheTtl);
        }
        if self.iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }

        let mut target = Target::parse(&self.url, self.method)?
            .with_headers(&self.headers)?
            .with_query_params(&self.query_params)
            .with_keep_alive(self.keep_alive);
        if let Some(body) = &self.body {
            target = target.with_body(body.clone());
        }

        Ok(BenchmarkRun {
            name: self.name.clone(),
            target,
            total_requests: self.total_requests,
            concurrency: self.concurrency,
            timeout: self.timeout,
            cache_enabled: self.cache_enabled,
            cache_ttl: self.cache_ttl,
            warmup_requests: self.warmup_requests,
            iterations: self.iterations,
            deadline: self.deadline,
            status_policy: self.status_policy,
            started_at: Utc::now(),
        })
    }
}

/// Validated configuration snapshot of one measured run.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkRun {
    pub name: String,
    pub target: Target,
    pub total_requests: usize,
    pub concurrency: usize,
    pub timeout: Duration,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    pub warmup_requests: usize,
    pub iterations: usize,
    pub deadline: Option<Duration>,
    pub status_policy: StatusPolicy,
    pub started_at: DateTime<Utc>,
}

impl BenchmarkRun {
    fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            timeout: self.timeout,
            cache_ttl: self.cache_ttl,
            status_policy: self.status_policy,
        }
    }
}

/// Samples of a finished (or cancelled) run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run: BenchmarkRun,
    /// Ordered by sequence number.
    pub samples: Vec<RequestSample>,
    /// Wall clock from first dispatch to last completion.
    pub elapsed: Duration,
    /// Requests never dispatched or abandoned in flight.
    pub incomplete: usize,
    pub cancelled: bool,
    pub peak_in_flight: usize,
    pub cache_stats: Option<CacheStats>,
}

/// Tracks the number of requests currently in flight and the peak reached.
#[derive(Debug, Default)]
pub struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { gauge: self }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct InFlightGuard<'a> {
    gauge: &'a InFlightGauge,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State shared by the workers of one dispatch.
struct WorkerContext {
    executor: RequestExecutor,
    target: Target,
    use_cache: bool,
    next_sequence: AtomicU64,
    gauge: InFlightGauge,
    cancel: CancellationToken,
}

/// Runs benchmarks. The response cache is an explicit dependency; runs that
/// enable caching without one get a cache of their own.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    cache: Option<Arc<ResponseCache>>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, cache: Option<Arc<ResponseCache>>) -> Self {
        Self { transport, cache }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn run(&self, config: &RunConfig) -> Result<RunResult, ConfigError> {
        self.run_with_cancellation(config, CancellationToken::new()).await
    }

    /// Validate `config`, then warm up and execute the measured run. Nothing is
    /// dispatched when validation fails.
    pub async fn run_with_cancellation(
        &self,
        config: &RunConfig,
        cancel: CancellationToken,
    ) -> Result<RunResult, ConfigError> {
        let run = config.validate()?;
        Ok(self.execute(run, cancel).await)
    }

    /// Execute an already validated run.
    pub async fn execute(&self, mut run: BenchmarkRun, cancel: CancellationToken) -> RunResult {
        if run.warmup_requests > 0 && !cancel.is_cancelled() {
            self.warmup(&run, &cancel).await;
        }

        let cache = if run.cache_enabled {
            Some(self.cache.clone().unwrap_or_else(|| Arc::new(TtlCache::new())))
        } else {
            None
        };

        info!(
            "🚀 Starting run '{}': {} requests at concurrency {} against {} (cache: {}, transport: {})",
            run.name,
            run.total_requests,
            run.concurrency,
            run.target,
            if run.cache_enabled { "on" } else { "off" },
            self.transport.name()
        );

        let run_token = cancel.child_token();
        let deadline_task = run.deadline.map(|deadline| spawn_deadline(deadline, run_token.clone()));

        run.started_at = Utc::now();
        let context = Arc::new(WorkerContext {
            executor: RequestExecutor::new(self.transport.clone(), cache.clone(), run.executor_settings()),
            target: run.target.clone(),
            use_cache: run.cache_enabled,
            next_sequence: AtomicU64::new(0),
            gauge: InFlightGauge::new(),
            cancel: run_token.clone(),
        });

        let started = Instant::now();
        let mut samples = dispatch(context.clone(), run.total_requests, run.concurrency).await;
        let elapsed = started.elapsed();

        let cancelled = run_token.is_cancelled();
        if let Some(task) = deadline_task {
            task.abort();
        }

        samples.sort_by_key(|s| s.sequence);
        let incomplete = run.total_requests.saturating_sub(samples.len());

        if cancelled {
            warn!(
                "⚠️ Run '{}' cancelled: {} of {} requests completed, {} incomplete",
                run.name,
                samples.len(),
                run.total_requests,
                incomplete
            );
        } else {
            info!(
                "✅ Run '{}' finished: {} requests in {:.2}s (peak in flight: {})",
                run.name,
                samples.len(),
                elapsed.as_secs_f64(),
                context.gauge.peak()
            );
        }

        RunResult {
            run,
            samples,
            elapsed,
            incomplete,
            cancelled,
            peak_in_flight: context.gauge.peak(),
            cache_stats: cache.map(|c| c.stats()),
        }
    }

    async fn warmup(&self, run: &BenchmarkRun, cancel: &CancellationToken) {
        let concurrency = run.concurrency.min(run.warmup_requests);
        info!("🔥 Warming up '{}' with {} requests", run.name, run.warmup_requests);

        let context = Arc::new(WorkerContext {
            executor: RequestExecutor::new(self.transport.clone(), None, run.executor_settings()),
            target: run.target.clone(),
            use_cache: false,
            next_sequence: AtomicU64::new(0),
            gauge: InFlightGauge::new(),
            cancel: cancel.child_token(),
        });
        let discarded = dispatch(context, run.warmup_requests, concurrency).await;
        debug!("Discarded {} warmup samples", discarded.len());
    }
}

fn spawn_deadline(deadline: Duration, token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(deadline) => {
                warn!("⏰ Run deadline of {:?} reached, cancelling", deadline);
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}

/// Issue `total` requests over `concurrency` workers and merge their samples.
async fn dispatch(context: Arc<WorkerContext>, total: usize, concurrency: usize) -> Vec<RequestSample> {
    let base = total / concurrency;
    let remainder = total % concurrency;

    let mut workers = JoinSet::new();
    for worker_id in 0..concurrency {
        let share = base + usize::from(worker_id < remainder);
        let context = context.clone();
        workers.spawn(async move { run_worker(&context, share).await });
    }

    let mut samples = Vec::with_capacity(total);
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(mut local) => samples.append(&mut local),
            Err(e) => error!("❌ Worker task failed: {}", e),
        }
    }
    samples
}

async fn run_worker(context: &WorkerContext, share: usize) -> Vec<RequestSample> {
    let mut local = Vec::with_capacity(share);

    for _ in 0..share {
        if context.cancel.is_cancelled() {
            break;
        }
        let sequence = context.next_sequence.fetch_add(1, Ordering::SeqCst);
        let _in_flight = context.gauge.enter();

        tokio::select! {
            biased;
            _ = context.cancel.cancelled() => {
                debug!("Abandoned request {} on cancellation", sequence);
                break;
            }
            sample = context.executor.execute(&context.target, context.use_cache, sequence) => {
                local.push(sample);
            }
        }
    }

    local
}
