//! Single-request execution.
//!
//! The executor optionally consults the response cache, otherwise delegates to
//! the transport and turns the resulting [`Exchange`] into a [`RequestSample`].
//! Failures never escape as errors: transport failures and failing statuses are
//! both recorded in the sample's [`RequestOutcome`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::{CachedResponse, ResponseCache};
use crate::errors::TransportError;
use crate::timing::{serde_ms, PhaseBreakdown};
use crate::transport::{Exchange, Target, Transport};

/// Which response statuses count as application failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StatusPolicy {
    /// Anything outside 200..=299 is a failure.
    #[default]
    #[serde(rename = "non_2xx")]
    Non2xx,
    /// Only 500..=599 is a failure; other statuses count as success.
    #[serde(rename = "server_errors")]
    ServerErrors,
}

impl StatusPolicy {
    pub fn is_failure(&self, status: u16) -> bool {
        match self {
            StatusPolicy::Non2xx => !(200..300).contains(&status),
            StatusPolicy::ServerErrors => (500..600).contains(&status),
        }
    }
}

/// How a single request ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Success { status: u16 },
    /// A complete response whose status the policy treats as failure.
    ApplicationError { status: u16 },
    /// No complete response was received.
    TransportError(TransportError),
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success { .. })
    }

    /// True when a complete HTTP response was received, successful or not.
    pub fn has_response(&self) -> bool {
        !matches!(self, RequestOutcome::TransportError(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RequestOutcome::Success { status } | RequestOutcome::ApplicationError { status } => Some(*status),
            RequestOutcome::TransportError(_) => None,
        }
    }

    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            RequestOutcome::TransportError(e) => Some(e),
            _ => None,
        }
    }
}

/// Outcome and timing of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSample {
    /// Dispatch order within the run.
    pub sequence: u64,
    pub outcome: RequestOutcome,
    #[serde(with = "serde_ms", rename = "total_ms")]
    pub total: Duration,
    pub phases: PhaseBreakdown,
    pub served_from_cache: bool,
    /// Response body bytes received.
    pub bytes: u64,
    /// Negotiated protocol, when a response was received.
    pub protocol: Option<String>,
}

impl RequestSample {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn has_response(&self) -> bool {
        self.outcome.has_response()
    }

    pub fn status(&self) -> Option<u16> {
        self.outcome.status()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutorSettings {
    pub timeout: Duration,
    pub cache_ttl: Duration,
    pub status_policy: StatusPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(300),
            status_policy: StatusPolicy::default(),
        }
    }
}

/// Performs one request at a time; safe to share across workers.
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    cache: Option<Arc<ResponseCache>>,
    settings: ExecutorSettings,
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Option<Arc<ResponseCache>>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            transport,
            cache,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    /// Execute `target` once. With `use_cache`, a live cache entry is served
    /// without network I/O and a successful network response is stored.
    pub async fn execute(&self, target: &Target, use_cache: bool, sequence: u64) -> RequestSample {
        match self.cache.as_ref().filter(|_| use_cache) {
            Some(cache) => self.execute_cached(cache, target, sequence).await,
            None => {
                let exchange = self.transport.execute(target, self.settings.timeout).await;
                self.network_sample(sequence, &exchange)
            }
        }
    }

    async fn execute_cached(&self, cache: &ResponseCache, target: &Target, sequence: u64) -> RequestSample {
        let key = target.cache_key();
        let lookup_started = Instant::now();

        // Concurrent misses on one key wait here for the first fetch.
        let _fill = cache.fill_slot(&key).settle().await;
        if let Some(cached) = cache.get(&key) {
            return self.cached_sample(sequence, cached, lookup_started.elapsed());
        }

        let exchange = self.transport.execute(target, self.settings.timeout).await;
        let sample = self.network_sample(sequence, &exchange);

        if let Ok(response) = &exchange.result {
            if sample.is_success() {
                cache.put(
                    key,
                    CachedResponse {
                        status: response.status,
                        headers: response.headers.clone(),
                        body: response.body.clone(),
                        protocol: Some(response.protocol.clone()),
                    },
                    self.settings.cache_ttl,
                );
            }
        }

        sample
    }

    fn cached_sample(&self, sequence: u64, cached: CachedResponse, lookup: Duration) -> RequestSample {
        RequestSample {
            sequence,
            outcome: self.classify_status(cached.status),
            total: lookup,
            phases: PhaseBreakdown::default(),
            served_from_cache: true,
            bytes: cached.body.len() as u64,
            protocol: cached.protocol,
        }
    }

    fn network_sample(&self, sequence: u64, exchange: &Exchange) -> RequestSample {
        let (outcome, bytes, protocol) = match &exchange.result {
            Ok(response) => (
                self.classify_status(response.status),
                response.body.len() as u64,
                Some(response.protocol.clone()),
            ),
            Err(e) => {
                debug!("Request {} failed: {}", sequence, e);
                (RequestOutcome::TransportError(e.clone()), 0, None)
            }
        };

        RequestSample {
            sequence,
            outcome,
            total: exchange.total,
            phases: exchange.phases.clone(),
            served_from_cache: false,
            bytes,
            protocol,
        }
    }

    fn classify_status(&self, status: u16) -> RequestOutcome {
        if self.settings.status_policy.is_failure(status) {
            RequestOutcome::ApplicationError { status }
        } else {
            RequestOutcome::Success { status }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::transport::{HttpMethod, HttpResponse, MockTransport};
    use async_trait::async_trait;
    use hyper::body::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinSet;

    fn target() -> Target {
        Target::parse("http://127.0.0.1:9/item", HttpMethod::Get).unwrap()
    }

    fn ok_exchange(status: u16) -> Exchange {
        Exchange {
            phases: PhaseBreakdown {
                connect: Some(Duration::from_millis(2)),
                ttfb: Some(Duration::from_millis(8)),
                transfer: Some(Duration::from_millis(1)),
                connection_reused: Some(false),
                ..Default::default()
            },
            total: Duration::from_millis(12),
            result: Ok(HttpResponse {
                status,
                headers: vec![("content-type".to_string(), "text/plain".to_string())],
                body: Bytes::from_static(b"hello"),
                protocol: "HTTP/1.1".to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_success_is_cached_and_served_without_network() {
        let mut transport = MockTransport::new();
        transport.expect_execute().times(1).returning(|_, _| ok_exchange(200));

        let cache = Arc::new(TtlCache::new());
        let executor = RequestExecutor::new(Arc::new(transport), Some(cache.clone()), ExecutorSettings::default());

        let first = executor.execute(&target(), true, 0).await;
        assert!(first.is_success());
        assert!(!first.served_from_cache);
        assert_eq!(first.bytes, 5);
        assert_eq!(first.total, Duration::from_millis(12));
        assert_eq!(cache.len(), 1);

        let second = executor.execute(&target(), true, 1).await;
        assert!(second.served_from_cache);
        assert_eq!(second.status(), Some(200));
        assert!(second.phases.is_empty());
        assert!(second.total < Duration::from_millis(12));
        assert_eq!(second.sequence, 1);
    }

    #[tokio::test]
    async fn test_cache_not_consulted_when_disabled() {
        let mut transport = MockTransport::new();
        transport.expect_execute().times(2).returning(|_, _| ok_exchange(200));

        let cache = Arc::new(TtlCache::new());
        let executor = RequestExecutor::new(Arc::new(transport), Some(cache.clone()), ExecutorSettings::default());

        executor.execute(&target(), false, 0).await;
        executor.execute(&target(), false, 1).await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_failing_status_is_application_error_and_not_cached() {
        let mut transport = MockTransport::new();
        transport.expect_execute().times(2).returning(|_, _| ok_exchange(500));

        let cache = Arc::new(TtlCache::new());
        let executor = RequestExecutor::new(Arc::new(transport), Some(cache.clone()), ExecutorSettings::default());

        let sample = executor.execute(&target(), true, 0).await;
        assert_eq!(sample.outcome, RequestOutcome::ApplicationError { status: 500 });
        assert!(sample.has_response());
        assert_eq!(sample.total, Duration::from_millis(12));
        assert!(cache.is_empty());

        executor.execute(&target(), true, 1).await;
    }

    #[tokio::test]
    async fn test_transport_error_keeps_partial_phases() {
        let mut transport = MockTransport::new();
        transport.expect_execute().times(1).returning(|_, timeout| Exchange {
            phases: PhaseBreakdown {
                dns: Some(Duration::from_millis(3)),
                ..Default::default()
            },
            total: timeout,
            result: Err(TransportError::Timeout { timeout_ms: 50 }),
        });

        let settings = ExecutorSettings {
            timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let executor = RequestExecutor::new(Arc::new(transport), None, settings);
        let sample = executor.execute(&target(), true, 7).await;

        assert!(!sample.has_response());
        assert_eq!(sample.status(), None);
        assert_eq!(sample.phases.dns, Some(Duration::from_millis(3)));
        assert_eq!(sample.total, Duration::from_millis(50));
        assert_eq!(sample.bytes, 0);
        assert_eq!(
            sample.outcome.transport_error(),
            Some(&TransportError::Timeout { timeout_ms: 50 })
        );
    }

    #[tokio::test]
    async fn test_timeout_is_passed_to_transport() {
        let mut transport = MockTransport::new();
        transport
            .expect_execute()
            .withf(|_, timeout| *timeout == Duration::from_millis(250))
            .times(1)
            .returning(|_, _| ok_exchange(204));

        let settings = ExecutorSettings {
            timeout: Duration::from_millis(250),
            ..Default::default()
        };
        let executor = RequestExecutor::new(Arc::new(transport), None, settings);
        assert!(executor.execute(&target(), false, 0).await.is_success());
    }

    struct SlowCountingTransport {
        calls: AtomicUsize,
        status: u16,
    }

    #[async_trait]
    impl Transport for SlowCountingTransport {
        async fn execute(&self, _target: &Target, _timeout: Duration) -> Exchange {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            ok_exchange(self.status)
        }

        fn name(&self) -> &'static str {
            "slow-counting"
        }
    }

    async fn run_concurrently(executor: Arc<RequestExecutor>, count: u64) -> Vec<RequestSample> {
        let mut tasks = JoinSet::new();
        for sequence in 0..count {
            let executor = executor.clone();
            tasks.spawn(async move { executor.execute(&target(), true, sequence).await });
        }
        let mut samples = Vec::new();
        while let Some(sample) = tasks.join_next().await {
            samples.push(sample.unwrap());
        }
        samples
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_fetch() {
        let transport = Arc::new(SlowCountingTransport {
            calls: AtomicUsize::new(0),
            status: 200,
        });
        let cache = Arc::new(TtlCache::new());
        let executor = Arc::new(RequestExecutor::new(
            transport.clone(),
            Some(cache.clone()),
            ExecutorSettings::default(),
        ));

        let samples = run_concurrently(executor, 10).await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(samples.iter().filter(|s| s.served_from_cache).count(), 9);
        assert!(samples.iter().all(|s| s.is_success()));
        let stats = cache.stats();
        assert_eq!(stats.hits, 9);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fill_lets_waiters_fetch() {
        let transport = Arc::new(SlowCountingTransport {
            calls: AtomicUsize::new(0),
            status: 503,
        });
        let cache = Arc::new(TtlCache::new());
        let executor = Arc::new(RequestExecutor::new(
            transport.clone(),
            Some(cache.clone()),
            ExecutorSettings::default(),
        ));

        let samples = run_concurrently(executor, 4).await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
        assert!(samples.iter().all(|s| !s.served_from_cache));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_status_policies() {
        assert!(StatusPolicy::Non2xx.is_failure(404));
        assert!(!StatusPolicy::Non2xx.is_failure(201));
        assert!(!StatusPolicy::ServerErrors.is_failure(404));
        assert!(StatusPolicy::ServerErrors.is_failure(503));
    }

    #[test]
    fn test_sample_serializes_total_in_milliseconds() {
        let sample = RequestSample {
            sequence: 3,
            outcome: RequestOutcome::Success { status: 200 },
            total: Duration::from_micros(2500),
            phases: PhaseBreakdown::default(),
            served_from_cache: false,
            bytes: 10,
            protocol: Some("HTTP/1.1".to_string()),
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["total_ms"], 2.5);
        assert_eq!(json["outcome"]["success"]["status"], 200);
    }
}
