#![allow(dead_code)]

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use warp::http::StatusCode;
use warp::Filter;

use latency_bench::transport::{Exchange, Target, Transport};
use latency_bench::RunConfig;

/// Mock HTTP server bound to an ephemeral local port.
pub struct MockServer {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl MockServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Server answering every request with `status` after `delay`.
pub fn spawn_status_server(status: u16, delay: Duration) -> MockServer {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let route = warp::any().and_then(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok::<_, warp::Rejection>(warp::reply::with_status("ok", status))
        }
    });

    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    MockServer { addr, hits }
}

/// Server answering 200 after `delay`.
pub fn spawn_fixed_delay_server(delay: Duration) -> MockServer {
    spawn_status_server(200, delay)
}

/// Server whose delay cycles through 2, 7, 12, 17 and 22 ms.
pub fn spawn_variable_delay_server() -> MockServer {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    let route = warp::any().and_then(move || {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let delay = Duration::from_millis(2 + (n % 5) as u64 * 5);
            tokio::time::sleep(delay).await;
            Ok::<_, warp::Rejection>(warp::reply::with_status("varied", StatusCode::OK))
        }
    });

    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    MockServer { addr, hits }
}

/// Wraps a transport, counting calls and tracking concurrent executions.
pub struct TrackingTransport {
    inner: Arc<dyn Transport>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl TrackingTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for TrackingTransport {
    async fn execute(&self, target: &Target, timeout: Duration) -> Exchange {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let exchange = self.inner.execute(target, timeout).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        exchange
    }

    fn name(&self) -> &'static str {
        "tracking"
    }
}

/// Run configuration with a short timeout for local servers.
pub fn run_config(name: &str, url: String, total_requests: usize, concurrency: usize) -> RunConfig {
    RunConfig {
        total_requests,
        concurrency,
        timeout: Duration::from_secs(5),
        ..RunConfig::new(name, url)
    }
}
