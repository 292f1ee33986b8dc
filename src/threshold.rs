//! # Threshold Evaluation
//!
//! Declarative pass/fail rules checked once against the final metric values of
//! a run. A rule has the shape `<aggregation><operator><value>[unit]`:
//!
//! | Aggregation        | Applies to                | Example          |
//! |--------------------|---------------------------|------------------|
//! | `rate`             | rate                      | `rate>0.95`      |
//! | `count`            | counter, rate, trend      | `count<100`      |
//! | `avg`, `med`       | trend                     | `avg<50ms`       |
//! | `min`, `max`       | trend, gauge (`max` only) | `max<2s`         |
//! | `p(Q)`             | trend                     | `p(95)<200ms`    |
//! | `value`            | gauge                     | `value==0`       |
//!
//! Operators are `<`, `<=`, `>`, `>=` and `==`. Trend values are in
//! milliseconds; `s` and `us` suffixes are converted. A threshold whose metric
//! saw no observations fails and reports no observed value.

use crate::error::{ProfileError, ThresholdParseError};
use crate::metrics::{MetricKind, MetricValue, MetricsRegistry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which aggregate of a metric a rule inspects
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Rate,
    Count,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
    Value,
}

impl Aggregation {
    fn is_time_based(&self) -> bool {
        matches!(
            self,
            Aggregation::Avg
                | Aggregation::Min
                | Aggregation::Max
                | Aggregation::Med
                | Aggregation::Percentile(_)
        )
    }

    /// Whether this aggregation is defined for an instrument kind
    pub fn applies_to(&self, kind: MetricKind) -> bool {
        match self {
            Aggregation::Rate => kind == MetricKind::Rate,
            Aggregation::Count => matches!(
                kind,
                MetricKind::Counter | MetricKind::Rate | MetricKind::Trend
            ),
            Aggregation::Avg | Aggregation::Med | Aggregation::Percentile(_) => {
                kind == MetricKind::Trend
            }
            Aggregation::Min => kind == MetricKind::Trend,
            Aggregation::Max => matches!(kind, MetricKind::Trend | MetricKind::Gauge),
            Aggregation::Value => kind == MetricKind::Gauge,
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Rate => write!(f, "rate"),
            Aggregation::Count => write!(f, "count"),
            Aggregation::Avg => write!(f, "avg"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Med => write!(f, "med"),
            Aggregation::Percentile(q) => write!(f, "p({})", q),
            Aggregation::Value => write!(f, "value"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Comparison {
    // Longest tokens first so "<=" is not read as "<".
    const TOKENS: [(&'static str, Comparison); 5] = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("==", Comparison::Eq),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ];

    pub fn holds(&self, observed: f64, expected: f64) -> bool {
        match self {
            Comparison::Lt => observed < expected,
            Comparison::Le => observed <= expected,
            Comparison::Gt => observed > expected,
            Comparison::Ge => observed >= expected,
            Comparison::Eq => (observed - expected).abs() < 1e-9,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
        }
    }
}

/// A parsed rule, with time values normalized to milliseconds
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub value: f64,
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregation, self.comparison.as_str(), self.value)?;
        if self.aggregation.is_time_based() {
            write!(f, "ms")?;
        }
        Ok(())
    }
}

impl FromStr for ThresholdRule {
    type Err = ThresholdParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let rule: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        if rule.is_empty() {
            return Err(ThresholdParseError::Empty);
        }

        let (aggregation, rest) = parse_aggregation(&rule)?;

        let (comparison, value_str) = Comparison::TOKENS
            .iter()
            .find_map(|(token, cmp)| rest.strip_prefix(token).map(|v| (*cmp, v)))
            .ok_or_else(|| ThresholdParseError::MissingOperator(raw.to_string()))?;

        let value = parse_value(value_str, aggregation.is_time_based())
            .ok_or_else(|| ThresholdParseError::InvalidValue(raw.to_string()))?;

        Ok(ThresholdRule {
            aggregation,
            comparison,
            value,
        })
    }
}

fn parse_aggregation(rule: &str) -> Result<(Aggregation, &str), ThresholdParseError> {
    if let Some(inner) = rule.strip_prefix("p(") {
        let close = inner
            .find(')')
            .ok_or_else(|| ThresholdParseError::InvalidPercentile(rule.to_string()))?;
        let q: f64 = inner[..close]
            .parse()
            .map_err(|_| ThresholdParseError::InvalidPercentile(rule.to_string()))?;
        if !(0.0..=100.0).contains(&q) {
            return Err(ThresholdParseError::InvalidPercentile(rule.to_string()));
        }
        return Ok((Aggregation::Percentile(q), &inner[close + 1..]));
    }

    let word_end = rule
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rule.len());
    let aggregation = match &rule[..word_end] {
        "rate" => Aggregation::Rate,
        "count" => Aggregation::Count,
        "avg" => Aggregation::Avg,
        "min" => Aggregation::Min,
        "max" => Aggregation::Max,
        "med" => Aggregation::Med,
        "value" => Aggregation::Value,
        _ => return Err(ThresholdParseError::UnknownAggregation(rule.to_string())),
    };
    Ok((aggregation, &rule[word_end..]))
}

fn parse_value(value: &str, time_based: bool) -> Option<f64> {
    let (number, scale) = if !time_based {
        (value, 1.0)
    } else if let Some(n) = value.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = value.strip_suffix("us") {
        (n, 0.001)
    } else if let Some(n) = value.strip_suffix('s') {
        (n, 1000.0)
    } else {
        (value, 1.0)
    };
    let parsed: f64 = number.parse().ok()?;
    parsed.is_finite().then_some(parsed * scale)
}

/// A rule bound to a metric name
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub expression: String,
    pub rule: ThresholdRule,
}

impl Threshold {
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ThresholdParseError> {
        Ok(Self {
            metric: metric.to_string(),
            expression: expression.trim().to_string(),
            rule: expression.parse()?,
        })
    }

    /// Display name, e.g. `operation_success: rate>0.95`
    pub fn name(&self) -> String {
        format!("{}: {}", self.metric, self.expression)
    }

    /// Reject rules that cannot be applied to the registered instrument
    pub fn check_applicable(&self, kind: Option<MetricKind>) -> Result<(), ProfileError> {
        let kind = kind.ok_or_else(|| ProfileError::UnknownMetric(self.metric.clone()))?;
        if self.rule.aggregation.applies_to(kind) {
            Ok(())
        } else {
            Err(ProfileError::ThresholdMismatch {
                metric: self.metric.clone(),
                kind: kind.as_str(),
                rule: self.expression.clone(),
            })
        }
    }

    /// The aggregate this rule inspects, `None` when there is nothing to judge
    pub fn observe(&self, value: &MetricValue) -> Option<f64> {
        match (self.rule.aggregation, value) {
            (Aggregation::Count, MetricValue::Counter { value }) => Some(*value as f64),
            (Aggregation::Count, MetricValue::Rate { total, .. }) => Some(*total as f64),
            (Aggregation::Count, MetricValue::Trend(t)) => Some(t.count as f64),
            (Aggregation::Rate, MetricValue::Rate { total, .. }) if *total > 0 => value.rate(),
            (Aggregation::Avg, MetricValue::Trend(t)) => t.mean(),
            (Aggregation::Min, MetricValue::Trend(t)) => t.min,
            (Aggregation::Max, MetricValue::Trend(t)) => t.max,
            (Aggregation::Med, MetricValue::Trend(t)) => t.median(),
            (Aggregation::Percentile(q), MetricValue::Trend(t)) => t.percentile(q),
            (Aggregation::Max, MetricValue::Gauge { max, .. }) => Some(*max as f64),
            (Aggregation::Value, MetricValue::Gauge { value, .. }) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn evaluate(&self, value: Option<&MetricValue>) -> ThresholdResult {
        let observed = value.and_then(|v| self.observe(v));
        let passed = observed
            .map(|o| self.rule.comparison.holds(o, self.rule.value))
            .unwrap_or(false);

        ThresholdResult {
            name: self.name(),
            metric: self.metric.clone(),
            rule: self.expression.clone(),
            passed,
            observed,
        }
    }
}

/// Outcome of one threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub name: String,
    pub metric: String,
    pub rule: String,
    pub passed: bool,
    pub observed: Option<f64>,
}

/// Evaluates every declared threshold against a registry
///
/// Must only run after the scheduler has stopped so no writer can race the
/// final snapshot.
#[derive(Debug, Clone, Default)]
pub struct ThresholdEvaluator {
    thresholds: Vec<Threshold>,
}

impl ThresholdEvaluator {
    pub fn new(thresholds: Vec<Threshold>) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &[Threshold] {
        &self.thresholds
    }

    /// Validate every threshold against the registered instruments
    pub fn validate(&self, registry: &MetricsRegistry) -> Result<(), ProfileError> {
        self.thresholds
            .iter()
            .try_for_each(|t| t.check_applicable(registry.kind_of(&t.metric)))
    }

    /// Results in declaration order
    pub fn evaluate(&self, registry: &MetricsRegistry) -> Vec<ThresholdResult> {
        self.thresholds
            .iter()
            .map(|t| {
                let snapshot = registry.snapshot_of(&t.metric);
                t.evaluate(snapshot.as_ref().map(|s| &s.value))
            })
            .collect()
    }
}

/// A run passes when every threshold passes; no thresholds means pass
pub fn all_passed(results: &[ThresholdResult]) -> bool {
    results.iter().all(|r| r.passed)
}
