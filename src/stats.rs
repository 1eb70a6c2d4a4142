//! Aggregation of request samples into run statistics.
//!
//! All latency figures are milliseconds. Latency series are built from samples
//! that received a complete response (successes, application errors and cache
//! hits); transport failures only contribute their partial phases and count
//! towards the error rate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::dispatcher::RunResult;
use crate::executor::{RequestOutcome, RequestSample};
use crate::timing::{serde_ms, Phase};

/// Summary of one latency series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    /// Population standard deviation.
    pub stddev_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl LatencyStats {
    /// Statistics over millisecond values. `None` for an empty series.
    pub fn from_millis(values: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let min = sorted[0];
        let max = sorted[count - 1];
        let mean = (sorted.iter().sum::<f64>() / count as f64).clamp(min, max);
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        Some(Self {
            count,
            min_ms: min,
            max_ms: max,
            mean_ms: mean,
            stddev_ms: variance.max(0.0).sqrt(),
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
        })
    }

    pub fn from_durations(values: &[Duration]) -> Option<Self> {
        let millis: Vec<f64> = values.iter().map(|d| serde_ms::to_ms(*d)).collect();
        Self::from_millis(&millis)
    }

    /// Standard deviation relative to the mean; `None` when the mean is zero.
    pub fn coefficient_of_variation(&self) -> Option<f64> {
        if self.mean_ms > 0.0 {
            Some(self.stddev_ms / self.mean_ms)
        } else {
            None
        }
    }
}

/// Linear-interpolation percentile over an ascending slice, `p` in `[0, 1]`.
///
/// Uses rank `p * (n - 1)` and interpolates between the two neighbouring values.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => return 0.0,
        1 => return sorted[0],
        _ => {}
    }

    let rank = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let value = if lower == upper {
        sorted[lower]
    } else {
        let weight = rank - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * weight
    };

    value.clamp(sorted[lower], sorted[upper])
}

/// Per-phase statistics, each over the samples where that phase was observed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseStatistics {
    pub dns: Option<LatencyStats>,
    pub connect: Option<LatencyStats>,
    pub tls: Option<LatencyStats>,
    pub ttfb: Option<LatencyStats>,
    pub transfer: Option<LatencyStats>,
}

impl PhaseStatistics {
    pub fn get(&self, phase: Phase) -> Option<&LatencyStats> {
        match phase {
            Phase::Dns => self.dns.as_ref(),
            Phase::Connect => self.connect.as_ref(),
            Phase::Tls => self.tls.as_ref(),
            Phase::Ttfb => self.ttfb.as_ref(),
            Phase::Transfer => self.transfer.as_ref(),
        }
    }

    fn set(&mut self, phase: Phase, stats: Option<LatencyStats>) {
        match phase {
            Phase::Dns => self.dns = stats,
            Phase::Connect => self.connect = stats,
            Phase::Tls => self.tls = stats,
            Phase::Ttfb => self.ttfb = stats,
            Phase::Transfer => self.transfer = stats,
        }
    }

    /// Phase with the largest mean, if any phase was observed.
    pub fn dominant(&self) -> Option<(Phase, f64)> {
        Phase::ALL
            .iter()
            .filter_map(|p| self.get(*p).map(|s| (*p, s.mean_ms)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Read-only summary of a completed set of samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStatistics {
    /// Attempted requests that produced a sample.
    pub total_samples: usize,
    pub success_count: usize,
    pub application_error_count: usize,
    pub transport_error_count: usize,
    pub failure_count: usize,
    pub cache_hits: usize,
    /// Requests not attempted or abandoned because the run was cancelled.
    pub incomplete: usize,
    /// `failure_count / total_samples`.
    pub error_rate: f64,
    #[serde(with = "serde_ms", rename = "elapsed_ms")]
    pub elapsed: Duration,
    /// Successful requests per wall-clock second.
    pub throughput_rps: f64,
    /// Complete responses (any status) per wall-clock second.
    pub response_throughput_rps: f64,
    pub cache_hit_ratio: f64,
    /// Share of network samples on a reused connection, where known.
    pub connection_reuse_ratio: Option<f64>,
    /// Network samples that reported whether their connection was reused.
    pub connection_observations: usize,
    /// Share of network responses negotiated as HTTP/2.
    pub http2_ratio: Option<f64>,
    pub total_bytes: u64,
    pub bytes_per_second: f64,
    pub latency: Option<LatencyStats>,
    /// Coefficient of variation of total latency.
    pub latency_cv: Option<f64>,
    pub phases: PhaseStatistics,
    pub status_counts: BTreeMap<u16, usize>,
    pub error_breakdown: BTreeMap<String, usize>,
}

impl AggregateStatistics {
    pub fn has_samples(&self) -> bool {
        self.total_samples > 0
    }
}

/// Stateless aggregation; safe to call concurrently.
pub struct StatisticsAggregator;

impl StatisticsAggregator {
    pub fn aggregate(result: &RunResult) -> AggregateStatistics {
        let mut stats = Self::aggregate_samples(&result.samples, result.elapsed);
        stats.incomplete = result.incomplete;
        stats
    }

    /// Aggregate `samples` measured over a run lasting `elapsed`.
    pub fn aggregate_samples(samples: &[RequestSample], elapsed: Duration) -> AggregateStatistics {
        let mut success_count = 0;
        let mut application_error_count = 0;
        let mut transport_error_count = 0;
        let mut cache_hits = 0;
        let mut total_bytes = 0u64;
        let mut status_counts = BTreeMap::new();
        let mut error_breakdown = BTreeMap::new();
        let mut latencies = Vec::with_capacity(samples.len());

        let mut reuse_known = 0usize;
        let mut reused = 0usize;
        let mut protocol_known = 0usize;
        let mut http2 = 0usize;

        for sample in samples {
            match &sample.outcome {
                RequestOutcome::Success { .. } => success_count += 1,
                RequestOutcome::ApplicationError { .. } => application_error_count += 1,
                RequestOutcome::TransportError(e) => {
                    transport_error_count += 1;
                    *error_breakdown.entry(e.kind().to_string()).or_insert(0) += 1;
                }
            }
            if let Some(status) = sample.status() {
                *status_counts.entry(status).or_insert(0) += 1;
                latencies.push(serde_ms::to_ms(sample.total));
            }
            total_bytes += sample.bytes;

            if sample.served_from_cache {
                cache_hits += 1;
                continue;
            }
            if let Some(was_reused) = sample.phases.connection_reused {
                reuse_known += 1;
                reused += usize::from(was_reused);
            }
            if let Some(protocol) = &sample.protocol {
                protocol_known += 1;
                http2 += usize::from(protocol.starts_with("HTTP/2"));
            }
        }

        let mut phases = PhaseStatistics::default();
        for phase in Phase::ALL {
            let series: Vec<Duration> = samples.iter().filter_map(|s| s.phases.get(phase)).collect();
            phases.set(phase, LatencyStats::from_durations(&series));
        }

        let total_samples = samples.len();
        let failure_count = application_error_count + transport_error_count;
        let latency = LatencyStats::from_millis(&latencies);
        let responses = success_count + application_error_count;

        AggregateStatistics {
            total_samples,
            success_count,
            application_error_count,
            transport_error_count,
            failure_count,
            cache_hits,
            incomplete: 0,
            error_rate: ratio(failure_count, total_samples).unwrap_or(0.0),
            elapsed,
            throughput_rps: per_second(success_count as f64, elapsed),
            response_throughput_rps: per_second(responses as f64, elapsed),
            cache_hit_ratio: ratio(cache_hits, total_samples).unwrap_or(0.0),
            connection_reuse_ratio: ratio(reused, reuse_known),
            connection_observations: reuse_known,
            http2_ratio: ratio(http2, protocol_known),
            total_bytes,
            bytes_per_second: per_second(total_bytes as f64, elapsed),
            latency_cv: latency.and_then(|l| l.coefficient_of_variation()),
            latency,
            phases,
            status_counts,
            error_breakdown,
        }
    }
}

fn ratio(part: usize, whole: usize) -> Option<f64> {
    if whole == 0 {
        None
    } else {
        Some(part as f64 / whole as f64)
    }
}

fn per_second(amount: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        amount / secs
    } else {
        0.0
    }
}
