use super::{Bound, ClassificationContext, ClassificationRule, Dimension, Finding, ThresholdTable};
use crate::stats::AggregateStatistics;
use crate::timing::Phase;

/// Built-in rules in evaluation order.
pub fn default_rules() -> Vec<Box<dyn ClassificationRule>> {
    vec![
        Box::new(PhaseLatencyRule::dns()),
        Box::new(PhaseLatencyRule::connect()),
        Box::new(PhaseLatencyRule::tls()),
        Box::new(PhaseLatencyRule::ttfb()),
        Box::new(ConnectionReuseRule),
        Box::new(CacheEffectivenessRule),
        Box::new(ErrorRateRule),
        Box::new(LatencyJitterRule),
        Box::new(MemoryPressureRule),
        Box::new(ProtocolRule),
    ]
}

/// Mean duration of one phase against its threshold.
pub struct PhaseLatencyRule {
    name: &'static str,
    phase: Phase,
    dimension: Dimension,
    label: &'static str,
    threshold: fn(&ThresholdTable) -> f64,
}

impl PhaseLatencyRule {
    pub fn dns() -> Self {
        Self {
            name: "dns_latency",
            phase: Phase::Dns,
            dimension: Dimension::Network,
            label: "DNS resolution slow",
            threshold: |t| t.dns_ms,
        }
    }

    pub fn connect() -> Self {
        Self {
            name: "connect_latency",
            phase: Phase::Connect,
            dimension: Dimension::Network,
            label: "Connection setup slow",
            threshold: |t| t.connect_ms,
        }
    }

    pub fn tls() -> Self {
        Self {
            name: "tls_latency",
            phase: Phase::Tls,
            dimension: Dimension::Network,
            label: "TLS handshake slow",
            threshold: |t| t.tls_ms,
        }
    }

    pub fn ttfb() -> Self {
        Self {
            name: "ttfb_latency",
            phase: Phase::Ttfb,
            dimension: Dimension::Application,
            label: "Server response slow",
            threshold: |t| t.ttfb_ms,
        }
    }
}

impl ClassificationRule for PhaseLatencyRule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn evaluate(
        &self,
        stats: &AggregateStatistics,
        _context: &ClassificationContext,
        thresholds: &ThresholdTable,
    ) -> Option<Finding> {
        let phase = stats.phases.get(self.phase)?;
        Some(Finding::evaluate(
            self.name,
            self.dimension,
            self.label,
            phase.mean_ms,
            (self.threshold)(thresholds),
            Bound::Max,
            "ms",
        ))
    }
}

pub struct ConnectionReuseRule;

impl ClassificationRule for ConnectionReuseRule {
    fn name(&self) -> &'static str {
        "connection_reuse"
    }

    fn evaluate(
        &self,
        stats: &AggregateStatistics,
        context: &ClassificationContext,
        thresholds: &ThresholdTable,
    ) -> Option<Finding> {
        // New connections are expected without keep-alive.
        if !context.keep_alive {
            return None;
        }
        // Every worker's first request needs a fresh connection.
        if stats.connection_observations <= context.concurrency {
            return None;
        }
        let ratio = stats.connection_reuse_ratio?;
        Some(Finding::evaluate(
            self.name(),
            Dimension::Network,
            "Connection reuse poor",
            ratio,
            thresholds.min_connection_reuse,
            Bound::Min,
            "%",
        ))
    }
}

pub struct CacheEffectivenessRule;

impl ClassificationRule for CacheEffectivenessRule {
    fn name(&self) -> &'static str {
        "cache_effectiveness"
    }

    fn evaluate(
        &self,
        stats: &AggregateStatistics,
        context: &ClassificationContext,
        thresholds: &ThresholdTable,
    ) -> Option<Finding> {
        if !context.cache_enabled || !stats.has_samples() {
            return None;
        }
        Some(Finding::evaluate(
            self.name(),
            Dimension::Cache,
            "Cache ineffective",
            stats.cache_hit_ratio,
            thresholds.min_cache_hit_ratio,
            Bound::Min,
            "%",
        ))
    }
}

pub struct ErrorRateRule;

impl ClassificationRule for ErrorRateRule {
    fn name(&self) -> &'static str {
        "error_rate"
    }

    fn evaluate(
        &self,
        stats: &AggregateStatistics,
        _context: &ClassificationContext,
        thresholds: &ThresholdTable,
    ) -> Option<Finding> {
        if !stats.has_samples() {
            return None;
        }
        Some(Finding::evaluate(
            self.name(),
            Dimension::Application,
            "Error rate high",
            stats.error_rate,
            thresholds.max_error_rate,
            Bound::Max,
            "%",
        ))
    }
}

pub struct LatencyJitterRule;

impl ClassificationRule for LatencyJitterRule {
    fn name(&self) -> &'static str {
        "latency_jitter"
    }

    fn evaluate(
        &self,
        stats: &AggregateStatistics,
        _context: &ClassificationContext,
        thresholds: &ThresholdTable,
    ) -> Option<Finding> {
        let latency = stats.latency.as_ref()?;
        if latency.count < 2 {
            return None;
        }
        let cv = stats.latency_cv?;
        Some(Finding::evaluate(
            self.name(),
            Dimension::Network,
            "Latency jitter high",
            cv,
            thresholds.max_latency_cv,
            Bound::Max,
            "",
        ))
    }
}

pub struct MemoryPressureRule;

impl ClassificationRule for MemoryPressureRule {
    fn name(&self) -> &'static str {
        "memory_pressure"
    }

    fn evaluate(
        &self,
        _stats: &AggregateStatistics,
        context: &ClassificationContext,
        thresholds: &ThresholdTable,
    ) -> Option<Finding> {
        let resources = context.resources?;
        Some(Finding::evaluate(
            self.name(),
            Dimension::Resource,
            "Memory pressure",
            resources.peak_memory_mb(),
            thresholds.max_memory_mb,
            Bound::Max,
            "MB",
        ))
    }
}

/// Share of HTTP/2 responses; only checked when a minimum is configured.
pub struct ProtocolRule;

impl ClassificationRule for ProtocolRule {
    fn name(&self) -> &'static str {
        "http2_usage"
    }

    fn evaluate(
        &self,
        stats: &AggregateStatistics,
        _context: &ClassificationContext,
        thresholds: &ThresholdTable,
    ) -> Option<Finding> {
        let minimum = thresholds.min_http2_ratio?;
        let ratio = stats.http2_ratio?;
        Some(Finding::evaluate(
            self.name(),
            Dimension::Protocol,
            "HTTP/2 not negotiated",
            ratio,
            minimum,
            Bound::Min,
            "%",
        ))
    }
}
