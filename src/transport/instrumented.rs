//! HTTP/1.1 transport that performs DNS resolution, TCP connect and the TLS
//! handshake itself so each phase boundary is observed directly.
//!
//! Connections are kept in a small idle pool keyed by scheme/host/port. A
//! request that checks out an idle connection reports no DNS, connect or TLS
//! phase and marks the connection as reused.

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{CONNECTION, HOST};
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_native_tls::{native_tls, TlsConnector};
use tracing::{debug, info};

use super::{timeout_error, Exchange, HttpMethod, HttpResponse, Scheme, Target, Transport};
use crate::errors::{BenchError, TransportError};
use crate::timing::PhaseTimer;

type Sender = SendRequest<Full<Bytes>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl PoolKey {
    fn for_target(target: &Target) -> Self {
        Self {
            scheme: target.scheme(),
            host: target.host(),
            port: target.port(),
        }
    }
}

/// Idle keep-alive connections. The lock is never held across I/O.
struct IdlePool {
    idle: Mutex<HashMap<PoolKey, Vec<Sender>>>,
    max_idle_per_host: usize,
}

impl IdlePool {
    fn new(max_idle_per_host: usize) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_host,
        }
    }

    fn checkout(&self, key: &PoolKey) -> Option<Sender> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let senders = idle.get_mut(key)?;
        while let Some(sender) = senders.pop() {
            if !sender.is_closed() {
                return Some(sender);
            }
        }
        None
    }

    fn checkin(&self, key: PoolKey, sender: Sender) {
        if sender.is_closed() {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let senders = idle.entry(key).or_default();
        if senders.len() < self.max_idle_per_host {
            senders.push(sender);
        }
    }

    fn idle_count(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

/// Phase-instrumented HTTP/1.1 client.
pub struct InstrumentedTransport {
    tls: TlsConnector,
    pool: IdlePool,
}

impl InstrumentedTransport {
    pub const DEFAULT_MAX_IDLE_PER_HOST: usize = 256;

    pub fn new() -> Result<Self, BenchError> {
        Self::with_max_idle_per_host(Self::DEFAULT_MAX_IDLE_PER_HOST)
    }

    pub fn with_max_idle_per_host(max_idle_per_host: usize) -> Result<Self, BenchError> {
        let connector = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| BenchError::Client(format!("Failed to build TLS connector: {}", e)))?;

        info!("🔌 Instrumented transport ready (max idle per host: {})", max_idle_per_host);

        Ok(Self {
            tls: TlsConnector::from(connector),
            pool: IdlePool::new(max_idle_per_host),
        })
    }

    /// Number of idle pooled connections across all hosts.
    pub fn idle_connections(&self) -> usize {
        self.pool.idle_count()
    }

    async fn exchange(&self, target: &Target, timer: &mut PhaseTimer) -> Result<HttpResponse, TransportError> {
        let key = PoolKey::for_target(target);

        let (mut sender, reused) = match self.reusable_connection(&key).await {
            Some(sender) => (sender, true),
            None => (self.connect(target, timer).await?, false),
        };
        timer.set_connection_reused(reused);

        timer.request_sent();
        let response = match sender.send_request(build_request(target)?).await {
            Ok(response) => response,
            Err(e) if reused && (e.is_closed() || e.is_canceled() || e.is_incomplete_message()) => {
                // Server dropped the idle connection; retry once on a fresh one.
                debug!("Pooled connection to {} was stale: {}", target.authority(), e);
                sender = self.connect(target, timer).await?;
                timer.set_connection_reused(false);
                timer.request_sent();
                sender
                    .send_request(build_request(target)?)
                    .await
                    .map_err(|e| TransportError::Protocol(e.to_string()))?
            }
            Err(e) => return Err(TransportError::Protocol(e.to_string())),
        };
        timer.first_byte();

        let response = read_response(response).await?;
        timer.complete();

        if target.keep_alive() {
            self.pool.checkin(key, sender);
        }
        Ok(response)
    }

    async fn reusable_connection(&self, key: &PoolKey) -> Option<Sender> {
        while let Some(mut sender) = self.pool.checkout(key) {
            if sender.ready().await.is_ok() {
                return Some(sender);
            }
        }
        None
    }

    async fn connect(&self, target: &Target, timer: &mut PhaseTimer) -> Result<Sender, TransportError> {
        let port = target.port();
        let addr = match target.ip_literal() {
            Some(ip) => SocketAddr::new(ip, port),
            None => {
                let host = target.host();
                timer.dns_start();
                let mut addrs = tokio::net::lookup_host((host.as_str(), port))
                    .await
                    .map_err(|e| TransportError::Dns(format!("{}: {}", host, e)))?;
                let addr = addrs
                    .next()
                    .ok_or_else(|| TransportError::Dns(format!("{}: no addresses returned", host)))?;
                timer.dns_end();
                addr
            }
        };

        timer.connect_start();
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", addr, e)))?;
        timer.connect_end();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }

        match target.scheme() {
            Scheme::Http => handshake(stream).await,
            Scheme::Https => {
                timer.tls_start();
                let tls_stream = self
                    .tls
                    .connect(&target.host(), stream)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                timer.tls_end();
                handshake(tls_stream).await
            }
        }
    }
}

#[async_trait]
impl Transport for InstrumentedTransport {
    async fn execute(&self, target: &Target, timeout: Duration) -> Exchange {
        let mut timer = PhaseTimer::start();
        let result = match tokio::time::timeout(timeout, self.exchange(target, &mut timer)).await {
            Ok(result) => result,
            Err(_) => Err(timeout_error(timeout)),
        };

        Exchange {
            phases: timer.breakdown(),
            total: timer.total(),
            result,
        }
    }

    fn name(&self) -> &'static str {
        "instrumented"
    }
}

async fn handshake<S>(stream: S) -> Result<Sender, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| TransportError::Protocol(format!("HTTP handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Connection closed with error: {}", e);
        }
    });

    Ok(sender)
}

fn build_request(target: &Target) -> Result<Request<Full<Bytes>>, TransportError> {
    let mut builder = Request::builder()
        .method(hyper_method(target.method()))
        .uri(target.path_and_query())
        .header(HOST, target.authority());

    for (name, value) in target.headers() {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !target.keep_alive() {
        builder = builder.header(CONNECTION, "close");
    }

    let body = target.body().cloned().unwrap_or_default();
    builder
        .body(Full::new(body))
        .map_err(|e| TransportError::Request(e.to_string()))
}

async fn read_response(response: Response<hyper::body::Incoming>) -> Result<HttpResponse, TransportError> {
    let status = response.status().as_u16();
    let protocol = format!("{:?}", response.version());
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| TransportError::Body(e.to_string()))?
        .to_bytes();

    Ok(HttpResponse {
        status,
        headers,
        body,
        protocol,
    })
}

fn hyper_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Head => Method::HEAD,
        HttpMethod::Options => Method::OPTIONS,
    }
}
