//! Serializable run records and run-to-run comparison.
//!
//! Every duration in a report is expressed in milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::CacheStats;
use crate::classifier::ClassificationResult;
use crate::dispatcher::RunResult;
use crate::errors::BenchError;
use crate::resources::ResourceUsage;
use crate::stats::{AggregateStatistics, LatencyStats};
use crate::timing::{serde_ms, Phase};
use crate::transport::HttpMethod;

/// Everything known about one measured run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub name: String,
    /// 1-based iteration number within the run's configuration.
    pub iteration: usize,
    pub target: String,
    pub method: HttpMethod,
    pub transport: String,
    pub started_at: DateTime<Utc>,
    pub total_requests: usize,
    pub concurrency: usize,
    #[serde(with = "serde_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    pub cache_enabled: bool,
    pub keep_alive: bool,
    pub cancelled: bool,
    pub peak_in_flight: usize,
    pub statistics: AggregateStatistics,
    pub classification: ClassificationResult,
    pub resources: Option<ResourceUsage>,
    pub cache: Option<CacheStats>,
}

impl RunReport {
    pub fn new(
        result: &RunResult,
        statistics: AggregateStatistics,
        classification: ClassificationResult,
        resources: Option<ResourceUsage>,
        transport: &str,
        iteration: usize,
    ) -> Self {
        let run = &result.run;
        Self {
            name: run.name.clone(),
            iteration,
            target: run.target.url().to_string(),
            method: run.target.method(),
            transport: transport.to_string(),
            started_at: run.started_at,
            total_requests: run.total_requests,
            concurrency: run.concurrency,
            timeout: run.timeout,
            cache_enabled: run.cache_enabled,
            keep_alive: run.target.keep_alive(),
            cancelled: result.cancelled,
            peak_in_flight: result.peak_in_flight,
            statistics,
            classification,
            resources,
            cache: result.cache_stats,
        }
    }

    pub fn to_json(&self) -> Result<String, BenchError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Flat key/value record for tabular reporters.
    pub fn to_record(&self) -> Map<String, Value> {
        let stats = &self.statistics;
        let mut record = Map::new();
        record.insert("name".into(), json!(self.name));
        record.insert("iteration".into(), json!(self.iteration));
        record.insert("target".into(), json!(self.target));
        record.insert("method".into(), json!(self.method.as_str()));
        record.insert("total".into(), json!(stats.total_samples));
        record.insert("success".into(), json!(stats.success_count));
        record.insert("failure".into(), json!(stats.failure_count));
        record.insert("incomplete".into(), json!(stats.incomplete));
        record.insert("throughput_rps".into(), json!(stats.throughput_rps));
        record.insert("error_rate".into(), json!(stats.error_rate));
        record.insert("cache_hit_ratio".into(), json!(stats.cache_hit_ratio));
        record.insert("connection_reuse_ratio".into(), json!(stats.connection_reuse_ratio));
        record.insert("connection_observations".into(), json!(stats.connection_observations));

        insert_latency(&mut record, "latency", stats.latency.as_ref());
        for phase in Phase::ALL {
            insert_latency(&mut record, phase.as_str(), stats.phases.get(phase));
        }

        let flags: Vec<&str> = self.classification.flagged.iter().map(|f| f.label.as_str()).collect();
        record.insert("flags".into(), json!(flags));
        record
    }

    pub fn log_summary(&self) {
        let stats = &self.statistics;
        info!(
            "📊 {} #{}: {} requests, {} ok, {} failed ({:.1}% errors), {:.1} req/s",
            self.name,
            self.iteration,
            stats.total_samples,
            stats.success_count,
            stats.failure_count,
            stats.error_rate * 100.0,
            stats.throughput_rps
        );
        if let Some(latency) = &stats.latency {
            info!(
                "⏱️ latency ms: min {:.2} | mean {:.2} | p50 {:.2} | p95 {:.2} | p99 {:.2} | max {:.2} | sd {:.2}",
                latency.min_ms,
                latency.mean_ms,
                latency.p50_ms,
                latency.p95_ms,
                latency.p99_ms,
                latency.max_ms,
                latency.stddev_ms
            );
        }
        for phase in Phase::ALL {
            if let Some(p) = stats.phases.get(phase) {
                info!(
                    "   {:<8} mean {:.2}ms p95 {:.2}ms (n={})",
                    phase.as_str(),
                    p.mean_ms,
                    p.p95_ms,
                    p.count
                );
            }
        }
        if self.cancelled {
            warn!("⚠️ {} requests incomplete due to cancellation", stats.incomplete);
        }
        for line in &self.classification.ranked_summary {
            warn!("🚩 {}", line);
        }
    }
}

fn insert_latency(record: &mut Map<String, Value>, prefix: &str, stats: Option<&LatencyStats>) {
    let Some(stats) = stats else {
        return;
    };
    let fields = [
        ("min_ms", stats.min_ms),
        ("mean_ms", stats.mean_ms),
        ("p50_ms", stats.p50_ms),
        ("p95_ms", stats.p95_ms),
        ("p99_ms", stats.p99_ms),
        ("max_ms", stats.max_ms),
        ("stddev_ms", stats.stddev_ms),
    ];
    for (field, value) in fields {
        record.insert(format!("{}_{}", prefix, field), json!(value));
    }
}

/// Which direction of change is an improvement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Better {
    Lower,
    Higher,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub metric: String,
    pub baseline: f64,
    pub candidate: f64,
    /// `None` when the baseline is zero.
    pub change_percent: Option<f64>,
    pub better: Better,
}

impl MetricDelta {
    fn new(metric: &str, baseline: f64, candidate: f64, better: Better) -> Self {
        let change_percent = if baseline != 0.0 {
            Some((candidate - baseline) / baseline * 100.0)
        } else {
            None
        };
        Self {
            metric: metric.to_string(),
            baseline,
            candidate,
            change_percent,
            better,
        }
    }

    pub fn improved(&self) -> bool {
        match self.better {
            Better::Lower => self.candidate < self.baseline,
            Better::Higher => self.candidate > self.baseline,
        }
    }
}

/// Per-metric change from a baseline report to a candidate report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunComparison {
    pub baseline: String,
    pub candidate: String,
    pub deltas: Vec<MetricDelta>,
}

impl RunComparison {
    pub fn between(baseline: &RunReport, candidate: &RunReport) -> Self {
        let (b, c) = (&baseline.statistics, &candidate.statistics);
        let mut deltas = Vec::new();

        if let (Some(bl), Some(cl)) = (&b.latency, &c.latency) {
            deltas.push(MetricDelta::new("mean_ms", bl.mean_ms, cl.mean_ms, Better::Lower));
            deltas.push(MetricDelta::new("p50_ms", bl.p50_ms, cl.p50_ms, Better::Lower));
            deltas.push(MetricDelta::new("p95_ms", bl.p95_ms, cl.p95_ms, Better::Lower));
            deltas.push(MetricDelta::new("p99_ms", bl.p99_ms, cl.p99_ms, Better::Lower));
        }
        deltas.push(MetricDelta::new("throughput_rps", b.throughput_rps, c.throughput_rps, Better::Higher));
        deltas.push(MetricDelta::new("error_rate", b.error_rate, c.error_rate, Better::Lower));
        deltas.push(MetricDelta::new("cache_hit_ratio", b.cache_hit_ratio, c.cache_hit_ratio, Better::Higher));

        Self {
            baseline: label(baseline),
            candidate: label(candidate),
            deltas,
        }
    }

    pub fn delta(&self, metric: &str) -> Option<&MetricDelta> {
        self.deltas.iter().find(|d| d.metric == metric)
    }

    pub fn log_summary(&self) {
        info!("🔍 {} vs {}", self.candidate, self.baseline);
        for delta in &self.deltas {
            let change = delta
                .change_percent
                .map(|p| format!("{:+.1}%", p))
                .unwrap_or_else(|| "n/a".to_string());
            info!(
                "   {:<16} {:>12.3} -> {:>12.3} ({}){}",
                delta.metric,
                delta.baseline,
                delta.candidate,
                change,
                if delta.improved() { " ✅" } else { "" }
            );
        }
    }
}

fn label(report: &RunReport) -> String {
    format!("{}#{}", report.name, report.iteration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use crate::dispatcher::RunConfig;
    use crate::executor::{RequestOutcome, RequestSample};
    use crate::stats::StatisticsAggregator;
    use crate::timing::PhaseBreakdown;

    fn report(name: &str, latencies_ms: &[u64], cached: bool) -> RunReport {
        let run = RunConfig {
            total_requests: latencies_ms.len(),
            concurrency: 1,
            cache_enabled: cached,
            ..RunConfig::new(name, "http://127.0.0.1:8080/health")
        }
        .validate()
        .unwrap();

        let samples: Vec<RequestSample> = latencies_ms
            .iter()
            .enumerate()
            .map(|(i, ms)| RequestSample {
                sequence: i as u64,
                outcome: RequestOutcome::Success { status: 200 },
                total: Duration::from_millis(*ms),
                phases: PhaseBreakdown {
                    ttfb: Some(Duration::from_millis(*ms)),
                    ..Default::default()
                },
                served_from_cache: cached && i > 0,
                bytes: 2,
                protocol: Some("HTTP/1.1".to_string()),
            })
            .collect();

        let result = RunResult {
            run,
            samples,
            elapsed: Duration::from_secs(1),
            incomplete: 0,
            cancelled: false,
            peak_in_flight: 1,
            cache_stats: None,
        };
        let stats = StatisticsAggregator::aggregate(&result);
        let classification = Classifier::default().classify_stats(&stats);
        RunReport::new(&result, stats, classification, None, "test", 1)
    }

    #[test]
    fn test_record_has_millisecond_fields() {
        let record = report("uncached", &[10, 20, 30], false).to_record();
        assert_eq!(record["total"], 3);
        assert_eq!(record["latency_min_ms"], 10.0);
        assert_eq!(record["latency_max_ms"], 30.0);
        assert_eq!(record["ttfb_p50_ms"], 20.0);
        assert!(!record.contains_key("dns_mean_ms"));
        assert_eq!(record["method"], "GET");
    }

    #[test]
    fn test_json_round_trip() {
        let report = report("uncached", &[10, 20], false);
        let json = report.to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["timeout_ms"], 30000.0);
        assert_eq!(value["statistics"]["latency"]["count"], 2);
        let parsed: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "uncached");
    }

    #[test]
    fn test_comparison_reports_percent_change() {
        let baseline = report("uncached", &[100, 100, 100, 100], false);
        let candidate = report("cached", &[50, 50, 50, 50], true);
        let comparison = RunComparison::between(&baseline, &candidate);

        let mean = comparison.delta("mean_ms").unwrap();
        assert!((mean.change_percent.unwrap() + 50.0).abs() < 1e-9);
        assert!(mean.improved());

        let hits = comparison.delta("cache_hit_ratio").unwrap();
        assert_eq!(hits.change_percent, None, "zero baseline has no percentage");
        assert!(hits.improved());
        assert_eq!(comparison.baseline, "uncached#1");
    }
}
