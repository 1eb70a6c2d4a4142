//! Transport backed by `reqwest`.
//!
//! reqwest exposes no DNS, connect or handshake hooks, so the only phase this
//! transport reports is transfer (response head to body complete). Connection
//! reuse is unknown and left as `None`.

use async_trait::async_trait;
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::info;

use super::{timeout_error, Exchange, HttpMethod, HttpResponse, Target, Transport};
use crate::errors::{BenchError, TransportError};
use crate::timing::PhaseTimer;

pub struct ReqwestTransport {
    pooled: Client,
    unpooled: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, BenchError> {
        Self::with_max_idle_per_host(usize::MAX)
    }

    pub fn with_max_idle_per_host(max_idle_per_host: usize) -> Result<Self, BenchError> {
        let pooled = Client::builder()
            .no_proxy()
            .pool_max_idle_per_host(max_idle_per_host)
            .build()
            .map_err(|e| BenchError::Client(format!("Failed to build HTTP client: {}", e)))?;
        let unpooled = Client::builder()
            .no_proxy()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| BenchError::Client(format!("Failed to build HTTP client: {}", e)))?;

        info!("🔌 reqwest transport ready");
        Ok(Self { pooled, unpooled })
    }

    async fn exchange(
        &self,
        target: &Target,
        timeout: Duration,
        timer: &mut PhaseTimer,
    ) -> Result<HttpResponse, TransportError> {
        let client = if target.keep_alive() { &self.pooled } else { &self.unpooled };

        let mut request = client.request(reqwest_method(target.method()), target.url().as_str());
        for (name, value) in target.headers() {
            request = request.header(name.as_str(), value.as_str());
        }
        if !target.keep_alive() {
            request = request.header(reqwest::header::CONNECTION, "close");
        }
        if let Some(body) = target.body() {
            request = request.body(body.to_vec());
        }

        let response = request.send().await.map_err(|e| map_error(e, timeout))?;
        timer.first_byte();

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
        let body = response.bytes().await.map_err(|e| map_error(e, timeout))?;
        timer.complete();

        Ok(HttpResponse {
            status,
            headers,
            body,
            protocol,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, target: &Target, timeout: Duration) -> Exchange {
        let mut timer = PhaseTimer::start();
        let result = match tokio::time::timeout(timeout, self.exchange(target, timeout, &mut timer)).await {
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
        "reqwest"
    }
}

fn map_error(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        timeout_error(timeout)
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_body() || e.is_decode() {
        TransportError::Body(e.to_string())
    } else if e.is_builder() {
        TransportError::Request(e.to_string())
    } else {
        TransportError::Protocol(e.to_string())
    }
}

fn reqwest_method(method: HttpMethod) -> Method {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connection_refused_maps_to_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = ReqwestTransport::new().unwrap();
        let target = Target::parse(&format!("http://{}/", addr), HttpMethod::Get).unwrap();
        let exchange = transport.execute(&target, Duration::from_secs(5)).await;

        assert!(matches!(exchange.result, Err(TransportError::Connect(_))));
        assert!(exchange.phases.is_empty());
        assert_eq!(exchange.phases.connection_reused, None);
    }

    #[tokio::test]
    async fn test_reports_no_setup_phases() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                .await;
        });

        let transport = ReqwestTransport::new().unwrap();
        let target = Target::parse(&format!("http://{}/", addr), HttpMethod::Get).unwrap();
        let exchange = transport.execute(&target, Duration::from_secs(5)).await;

        let response = exchange.result.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], b"ok");
        assert!(exchange.phases.dns.is_none());
        assert!(exchange.phases.connect.is_none());
        assert!(exchange.phases.ttfb.is_none());
        assert!(exchange.phases.transfer.is_some());
    }
}
