//! Advisory bottleneck classification.
//!
//! A [`Classifier`] runs a set of [`ClassificationRule`]s against a run's
//! statistics. Each rule compares one figure with a tunable threshold from the
//! [`ThresholdTable`] and produces a [`Finding`]; rules whose input is missing
//! are skipped instead of guessed. Classification never fails and never
//! mutates anything.

pub mod rules;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::resources::ResourceUsage;
use crate::stats::AggregateStatistics;

pub use rules::{
    CacheEffectivenessRule, ConnectionReuseRule, ErrorRateRule, LatencyJitterRule, MemoryPressureRule,
    PhaseLatencyRule, ProtocolRule,
};

/// Tunable thresholds. Every field has a default so a partial TOML table works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdTable {
    pub dns_ms: f64,
    pub connect_ms: f64,
    pub tls_ms: f64,
    pub ttfb_ms: f64,
    pub min_connection_reuse: f64,
    pub min_cache_hit_ratio: f64,
    pub max_error_rate: f64,
    pub max_latency_cv: f64,
    pub max_memory_mb: f64,
    /// Only checked when set.
    pub min_http2_ratio: Option<f64>,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            dns_ms: 50.0,
            connect_ms: 100.0,
            tls_ms: 200.0,
            ttfb_ms: 500.0,
            min_connection_reuse: 0.5,
            min_cache_hit_ratio: 0.2,
            max_error_rate: 0.05,
            max_latency_cv: 0.5,
            max_memory_mb: 500.0,
            min_http2_ratio: None,
        }
    }
}

/// Facts about the run that are not part of the statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationContext {
    pub cache_enabled: bool,
    pub keep_alive: bool,
    /// Workers in the run; each opens at least one connection.
    pub concurrency: usize,
    pub resources: Option<ResourceUsage>,
}

impl Default for ClassificationContext {
    fn default() -> Self {
        Self {
            cache_enabled: false,
            keep_alive: true,
            concurrency: 1,
            resources: None,
        }
    }
}

/// Layer a finding points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Network,
    Application,
    Protocol,
    Cache,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

/// Whether a figure must stay below or above its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    Max,
    Min,
}

/// Result of one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub rule: String,
    pub dimension: Dimension,
    pub label: String,
    pub severity: Severity,
    pub observed: f64,
    pub threshold: f64,
    pub bound: Bound,
    pub unit: String,
    pub flagged: bool,
    /// Relative distance past the threshold; zero when within bounds.
    pub exceedance: f64,
}

impl Finding {
    pub fn evaluate(
        rule: &str,
        dimension: Dimension,
        label: &str,
        observed: f64,
        threshold: f64,
        bound: Bound,
        unit: &str,
    ) -> Self {
        let flagged = match bound {
            Bound::Max => observed > threshold,
            Bound::Min => observed < threshold,
        };
        let exceedance = if !flagged || threshold <= 0.0 {
            0.0
        } else {
            match bound {
                Bound::Max => (observed - threshold) / threshold,
                Bound::Min => (threshold - observed) / threshold,
            }
        };
        let severity = match (flagged, exceedance >= 1.0) {
            (false, _) => Severity::Ok,
            (true, false) => Severity::Warning,
            (true, true) => Severity::Critical,
        };

        Self {
            rule: rule.to_string(),
            dimension,
            label: label.to_string(),
            severity,
            observed,
            threshold,
            bound,
            unit: unit.to_string(),
            flagged,
            exceedance,
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.bound {
            Bound::Max => ">",
            Bound::Min => "<",
        };
        if self.unit == "%" {
            write!(
                f,
                "{}: {:.1}% {} {:.1}%",
                self.label,
                self.observed * 100.0,
                op,
                self.threshold * 100.0
            )
        } else {
            write!(
                f,
                "{}: {:.2}{} {} {:.2}{}",
                self.label, self.observed, self.unit, op, self.threshold, self.unit
            )
        }
    }
}

/// A single threshold check. Returns `None` when its input is unavailable.
pub trait ClassificationRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(
        &self,
        stats: &AggregateStatistics,
        context: &ClassificationContext,
        thresholds: &ThresholdTable,
    ) -> Option<Finding>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Every rule that could be evaluated, flagged or not.
    pub findings: Vec<Finding>,
    /// Flagged findings, most impactful first.
    pub flagged: Vec<Finding>,
    pub ranked_summary: Vec<String>,
    /// Rules skipped for lack of input.
    pub skipped: Vec<String>,
}

impl ClassificationResult {
    pub fn is_flagged(&self, rule: &str) -> bool {
        self.flagged.iter().any(|f| f.rule == rule)
    }

    pub fn has_bottleneck(&self) -> bool {
        !self.flagged.is_empty()
    }

    pub fn finding(&self, rule: &str) -> Option<&Finding> {
        self.findings.iter().find(|f| f.rule == rule)
    }
}

pub struct Classifier {
    thresholds: ThresholdTable,
    rules: Vec<Box<dyn ClassificationRule>>,
}

impl Classifier {
    /// Classifier with the built-in rule set.
    pub fn new(thresholds: ThresholdTable) -> Self {
        Self {
            thresholds,
            rules: rules::default_rules(),
        }
    }

    /// Classifier without rules; add them with [`Classifier::with_rule`].
    pub fn empty(thresholds: ThresholdTable) -> Self {
        Self {
            thresholds,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: Box<dyn ClassificationRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Classify with no extra context: cache and resource rules are skipped.
    pub fn classify_stats(&self, stats: &AggregateStatistics) -> ClassificationResult {
        self.classify(stats, &ClassificationContext::default())
    }

    pub fn classify(&self, stats: &AggregateStatistics, context: &ClassificationContext) -> ClassificationResult {
        let mut findings = Vec::with_capacity(self.rules.len());
        let mut skipped = Vec::new();

        for rule in &self.rules {
            match rule.evaluate(stats, context, &self.thresholds) {
                Some(finding) => findings.push(finding),
                None => skipped.push(rule.name().to_string()),
            }
        }

        let mut flagged: Vec<Finding> = findings.iter().filter(|f| f.flagged).cloned().collect();
        flagged.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.exceedance.partial_cmp(&a.exceedance).unwrap_or(Ordering::Equal))
        });
        let ranked_summary = flagged.iter().map(|f| f.to_string()).collect();

        ClassificationResult {
            findings,
            flagged,
            ranked_summary,
            skipped,
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(ThresholdTable::default())
    }
}
