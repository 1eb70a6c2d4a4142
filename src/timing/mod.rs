//! Per-request phase instrumentation.
//!
//! A [`PhaseTimer`] records the instants at which the lifecycle events of one
//! outbound request were observed. Only events a transport actually observed
//! are recorded: a reused connection has no DNS, connect or TLS events and the
//! resulting [`PhaseBreakdown`] leaves those phases as `None`.

pub mod serde_ms;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Named sub-interval of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Dns,
    Connect,
    Tls,
    Ttfb,
    Transfer,
}

impl Phase {
    pub const ALL: [Phase; 5] = [Phase::Dns, Phase::Connect, Phase::Tls, Phase::Ttfb, Phase::Transfer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Dns => "dns",
            Phase::Connect => "connect",
            Phase::Tls => "tls",
            Phase::Ttfb => "ttfb",
            Phase::Transfer => "transfer",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed lifecycle instants for a single request.
#[derive(Debug, Clone)]
pub struct PhaseTimer {
    started: Instant,
    dns_start: Option<Instant>,
    dns_end: Option<Instant>,
    connect_start: Option<Instant>,
    connect_end: Option<Instant>,
    tls_start: Option<Instant>,
    tls_end: Option<Instant>,
    request_sent: Option<Instant>,
    first_byte: Option<Instant>,
    completed: Option<Instant>,
    connection_reused: Option<bool>,
}

impl PhaseTimer {
    /// Start a timer; the total duration is measured from this instant.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            dns_start: None,
            dns_end: None,
            connect_start: None,
            connect_end: None,
            tls_start: None,
            tls_end: None,
            request_sent: None,
            first_byte: None,
            completed: None,
            connection_reused: None,
        }
    }

    pub fn dns_start(&mut self) {
        self.dns_start = Some(Instant::now());
    }

    pub fn dns_end(&mut self) {
        self.dns_end = Some(Instant::now());
    }

    pub fn connect_start(&mut self) {
        self.connect_start = Some(Instant::now());
    }

    pub fn connect_end(&mut self) {
        self.connect_end = Some(Instant::now());
    }

    pub fn tls_start(&mut self) {
        self.tls_start = Some(Instant::now());
    }

    pub fn tls_end(&mut self) {
        self.tls_end = Some(Instant::now());
    }

    /// The request head has been handed to the connection.
    pub fn request_sent(&mut self) {
        self.request_sent = Some(Instant::now());
    }

    /// The response head has been received.
    pub fn first_byte(&mut self) {
        self.first_byte = Some(Instant::now());
    }

    /// The response body has been fully read.
    pub fn complete(&mut self) {
        self.completed = Some(Instant::now());
    }

    pub fn set_connection_reused(&mut self, reused: bool) {
        self.connection_reused = Some(reused);
    }

    /// Time since the timer started, or until completion if already complete.
    pub fn total(&self) -> Duration {
        self.completed
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.started)
    }

    /// Derive per-phase durations from the recorded instants.
    ///
    /// Transfer runs from first byte to completion.
    pub fn breakdown(&self) -> PhaseBreakdown {
        PhaseBreakdown {
            dns: span(self.dns_start, self.dns_end),
            connect: span(self.connect_start, self.connect_end),
            tls: span(self.tls_start, self.tls_end),
            ttfb: span(self.request_sent, self.first_byte),
            transfer: span(self.first_byte, self.completed),
            connection_reused: self.connection_reused,
        }
    }
}

fn span(start: Option<Instant>, end: Option<Instant>) -> Option<Duration> {
    match (start, end) {
        (Some(s), Some(e)) => Some(e.saturating_duration_since(s)),
        _ => None,
    }
}

/// Durations of the phases observed for a single request. Unobserved phases are `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseBreakdown {
    #[serde(default, with = "serde_ms::option", rename = "dns_ms")]
    pub dns: Option<Duration>,
    #[serde(default, with = "serde_ms::option", rename = "connect_ms")]
    pub connect: Option<Duration>,
    #[serde(default, with = "serde_ms::option", rename = "tls_ms")]
    pub tls: Option<Duration>,
    #[serde(default, with = "serde_ms::option", rename = "ttfb_ms")]
    pub ttfb: Option<Duration>,
    #[serde(default, with = "serde_ms::option", rename = "transfer_ms")]
    pub transfer: Option<Duration>,
    pub connection_reused: Option<bool>,
}

impl PhaseBreakdown {
    pub fn get(&self, phase: Phase) -> Option<Duration> {
        match phase {
            Phase::Dns => self.dns,
            Phase::Connect => self.connect,
            Phase::Tls => self.tls,
            Phase::Ttfb => self.ttfb,
            Phase::Transfer => self.transfer,
        }
    }

    /// Sum of all observed phases.
    pub fn observed_sum(&self) -> Duration {
        Phase::ALL.iter().filter_map(|p| self.get(*p)).sum()
    }

    pub fn is_empty(&self) -> bool {
        Phase::ALL.iter().all(|p| self.get(*p).is_none())
    }
}
