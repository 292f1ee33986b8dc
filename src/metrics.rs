//! # Metric Instruments
//!
//! Thread-safe instruments written concurrently by every virtual user and read
//! periodically by the exporter and once at the end of a run by the threshold
//! evaluator.
//!
//! ## Instruments
//!
//! - **Counter**: monotonically increasing `u64` accumulator
//! - **Gauge**: last written value plus the peak ever written
//! - **Rate**: ratio of successful observations to all observations
//! - **Trend**: distribution of observed values with quantile queries
//!
//! ## Write Path
//!
//! Counter, Gauge and Rate are plain atomics. A Trend takes its own mutex for
//! the duration of a single append; no lock spans two instruments and none is
//! ever held across I/O. Quantiles are only computed on a [`TrendSnapshot`],
//! which copies the samples under the lock and sorts them afterwards.
//!
//! ## Quantile Rule
//!
//! Percentiles use the nearest-rank method: for `n` sorted samples,
//! `p(q) = sorted[ceil(q * n / 100) - 1]`, with `p(0)` and `p(100)` pinned to
//! the exact observed minimum and maximum. For `{10, 20, 30, 40}`, `p(50)` is
//! `20`.

use crate::error::RegistryError;
use anyhow::Result;
use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Kind of a registered instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
    Trend,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonically increasing 64-bit accumulator
#[derive(Debug)]
pub struct Counter {
    name: String,
    value: AtomicU64,
}

impl Counter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add `delta` to the counter
    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Point-in-time value with a running peak
#[derive(Debug)]
pub struct Gauge {
    name: String,
    value: AtomicI64,
    max: AtomicI64,
}

impl Gauge {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: AtomicI64::new(0),
            max: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> i64 {
        self.max.load(Ordering::Relaxed)
    }
}

/// Ratio of successful observations to total observations
///
/// Writers bump `total` before `success` and readers load `success` before
/// `total`, so a concurrent read can never observe more successes than
/// observations.
#[derive(Debug)]
pub struct Rate {
    name: String,
    success: AtomicU64,
    total: AtomicU64,
}

impl Rate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record one observation
    pub fn add(&self, success: bool) {
        self.total.fetch_add(1, Ordering::SeqCst);
        if success {
            self.success.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Returns `(success, total)`
    pub fn counts(&self) -> (u64, u64) {
        let success = self.success.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        (success.min(total), total)
    }

    /// Success ratio in `[0, 1]`; `0.0` when nothing was observed.
    pub fn value(&self) -> f64 {
        let (success, total) = self.counts();
        rate_value(success, total)
    }
}

fn rate_value(success: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (success as f64 / total as f64).clamp(0.0, 1.0)
    }
}

/// How a Trend retains samples for quantile queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SamplingPolicy {
    /// Keep every sample; quantiles are exact
    Exact,
    /// Keep a uniform random sample of at most `size` values
    Reservoir { size: usize },
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        SamplingPolicy::Reservoir {
            size: crate::defaults::RESERVOIR_SIZE,
        }
    }
}

struct TrendState {
    samples: Vec<f64>,
    seen: u64,
    sum: f64,
    min: f64,
    max: f64,
    // Microsecond resolution, covers every observation regardless of policy.
    histogram: Histogram<u64>,
    rng: StdRng,
}

/// Distribution-tracking instrument
///
/// Values are conventionally milliseconds. Count, sum, min and max are exact
/// over all observations; the sample store used for quantiles is exact or a
/// reservoir depending on [`SamplingPolicy`].
pub struct Trend {
    name: String,
    policy: SamplingPolicy,
    state: Mutex<TrendState>,
}

impl fmt::Debug for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trend")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Trend {
    /// Create a new trend
    pub fn new(name: impl Into<String>, policy: SamplingPolicy) -> Result<Self> {
        // 3 significant figures, auto-resizing
        let histogram = Histogram::<u64>::new(3)?;
        let capacity = match policy {
            SamplingPolicy::Exact => 1024,
            SamplingPolicy::Reservoir { size } => size,
        };

        Ok(Self {
            name: name.into(),
            policy,
            state: Mutex::new(TrendState {
                samples: Vec::with_capacity(capacity),
                seen: 0,
                sum: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                histogram,
                rng: StdRng::from_entropy(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> SamplingPolicy {
        self.policy
    }

    /// Record a value. Non-finite values are ignored.
    pub fn add(&self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let micros = (value.max(0.0) * 1000.0).round() as u64;

        let mut state = self.state.lock();
        state.seen += 1;
        state.sum += value;
        state.min = state.min.min(value);
        state.max = state.max.max(value);
        state.histogram.saturating_record(micros);

        match self.policy {
            SamplingPolicy::Exact => state.samples.push(value),
            SamplingPolicy::Reservoir { size } => {
                if state.samples.len() < size {
                    state.samples.push(value);
                } else {
                    // Algorithm R: keep the new value with probability size/seen
                    let seen = state.seen;
                    let slot = state.rng.gen_range(0..seen) as usize;
                    if slot < size {
                        state.samples[slot] = value;
                    }
                }
            }
        }
    }

    /// Number of observations so far
    pub fn count(&self) -> u64 {
        self.state.lock().seen
    }

    /// Copy the current state and sort it outside the lock
    pub fn snapshot(&self) -> TrendSnapshot {
        let (mut sorted, count, sum, min, max, histogram) = {
            let state = self.state.lock();
            (
                state.samples.clone(),
                state.seen,
                state.sum,
                state.min,
                state.max,
                state.histogram.clone(),
            )
        };
        sorted.sort_by(|a, b| a.total_cmp(b));

        TrendSnapshot {
            count,
            sum,
            min: (count > 0).then_some(min),
            max: (count > 0).then_some(max),
            sorted,
            histogram,
        }
    }
}

/// Read-only copy of a Trend taken at a single instant
#[derive(Clone)]
pub struct TrendSnapshot {
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    sorted: Vec<f64>,
    histogram: Histogram<u64>,
}

impl fmt::Debug for TrendSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrendSnapshot")
            .field("count", &self.count)
            .field("sum", &self.sum)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("retained", &self.sorted.len())
            .finish()
    }
}

impl TrendSnapshot {
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    /// Nearest-rank percentile for `q` in `[0, 100]`.
    ///
    /// Returns `None` for an empty trend or an out-of-range `q`.
    pub fn percentile(&self, q: f64) -> Option<f64> {
        if self.sorted.is_empty() || !(0.0..=100.0).contains(&q) {
            return None;
        }
        if q == 0.0 {
            return self.min;
        }
        if q == 100.0 {
            return self.max;
        }
        nearest_rank(&self.sorted, q)
    }

    /// Number of retained samples backing the quantiles
    pub fn retained(&self) -> usize {
        self.sorted.len()
    }

    /// Cumulative observation counts at each upper bound (milliseconds)
    pub fn cumulative_buckets(&self, bounds_ms: &[f64]) -> Vec<(f64, u64)> {
        // (lowest equivalent value in microseconds, count) per recorded bin
        let recorded: Vec<(u64, u64)> = self
            .histogram
            .iter_recorded()
            .map(|v| {
                (
                    self.histogram.lowest_equivalent(v.value_iterated_to()),
                    v.count_at_value(),
                )
            })
            .collect();

        bounds_ms
            .iter()
            .map(|&le| {
                let high = (le.max(0.0) * 1000.0).round() as u64;
                let count = recorded
                    .iter()
                    .filter(|(value, _)| *value <= high)
                    .map(|(_, count)| count)
                    .sum();
                (le, count)
            })
            .collect()
    }
}

/// Nearest-rank lookup on an already sorted slice
pub fn nearest_rank(sorted: &[f64], q: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let rank = (q * n as f64 / 100.0).ceil() as usize;
    Some(sorted[rank.clamp(1, n) - 1])
}

/// A registered instrument handle
#[derive(Debug, Clone)]
pub enum Instrument {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Rate(Arc<Rate>),
    Trend(Arc<Trend>),
}

impl Instrument {
    pub fn kind(&self) -> MetricKind {
        match self {
            Instrument::Counter(_) => MetricKind::Counter,
            Instrument::Gauge(_) => MetricKind::Gauge,
            Instrument::Rate(_) => MetricKind::Rate,
            Instrument::Trend(_) => MetricKind::Trend,
        }
    }

    pub fn snapshot(&self) -> MetricValue {
        match self {
            Instrument::Counter(c) => MetricValue::Counter { value: c.value() },
            Instrument::Gauge(g) => MetricValue::Gauge {
                value: g.value(),
                max: g.max(),
            },
            Instrument::Rate(r) => {
                let (success, total) = r.counts();
                MetricValue::Rate { success, total }
            }
            Instrument::Trend(t) => MetricValue::Trend(t.snapshot()),
        }
    }
}

/// Snapshot value of one instrument
#[derive(Debug, Clone)]
pub enum MetricValue {
    Counter { value: u64 },
    Gauge { value: i64, max: i64 },
    Rate { success: u64, total: u64 },
    Trend(TrendSnapshot),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Counter { .. } => MetricKind::Counter,
            MetricValue::Gauge { .. } => MetricKind::Gauge,
            MetricValue::Rate { .. } => MetricKind::Rate,
            MetricValue::Trend(_) => MetricKind::Trend,
        }
    }

    /// Rate ratio, `None` for other kinds
    pub fn rate(&self) -> Option<f64> {
        match self {
            MetricValue::Rate { success, total } => Some(rate_value(*success, *total)),
            _ => None,
        }
    }
}

/// Named snapshot of one instrument
#[derive(Debug, Clone)]
pub struct MetricSnapshot {
    pub name: String,
    pub value: MetricValue,
}

/// Explicit registry of every instrument used by a run
///
/// One registry belongs to one run; it is handed to the controller, the
/// executors and the exporter as an `Arc`. Registration happens at startup;
/// afterwards the map is only read, so the write lock is never contended on
/// the hot path.
pub struct MetricsRegistry {
    trend_policy: SamplingPolicy,
    instruments: RwLock<BTreeMap<String, Instrument>>,
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("trend_policy", &self.trend_policy)
            .field("instruments", &self.instruments.read().len())
            .finish()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(SamplingPolicy::default())
    }
}

impl MetricsRegistry {
    pub fn new(trend_policy: SamplingPolicy) -> Self {
        Self {
            trend_policy,
            instruments: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn trend_policy(&self) -> SamplingPolicy {
        self.trend_policy
    }

    /// Get or register a counter
    pub fn counter(&self, name: &str) -> Result<Arc<Counter>> {
        validate_metric_name(name)?;
        let mut map = self.instruments.write();
        match map.get(name) {
            Some(Instrument::Counter(c)) => Ok(Arc::clone(c)),
            Some(other) => Err(conflict(name, other)),
            None => {
                let counter = Arc::new(Counter::new(name));
                map.insert(name.to_string(), Instrument::Counter(Arc::clone(&counter)));
                Ok(counter)
            }
        }
    }

    /// Get or register a gauge
    pub fn gauge(&self, name: &str) -> Result<Arc<Gauge>> {
        validate_metric_name(name)?;
        let mut map = self.instruments.write();
        match map.get(name) {
            Some(Instrument::Gauge(g)) => Ok(Arc::clone(g)),
            Some(other) => Err(conflict(name, other)),
            None => {
                let gauge = Arc::new(Gauge::new(name));
                map.insert(name.to_string(), Instrument::Gauge(Arc::clone(&gauge)));
                Ok(gauge)
            }
        }
    }

    /// Get or register a rate
    pub fn rate(&self, name: &str) -> Result<Arc<Rate>> {
        validate_metric_name(name)?;
        let mut map = self.instruments.write();
        match map.get(name) {
            Some(Instrument::Rate(r)) => Ok(Arc::clone(r)),
            Some(other) => Err(conflict(name, other)),
            None => {
                let rate = Arc::new(Rate::new(name));
                map.insert(name.to_string(), Instrument::Rate(Arc::clone(&rate)));
                Ok(rate)
            }
        }
    }

    /// Get or register a trend using the registry's sampling policy
    pub fn trend(&self, name: &str) -> Result<Arc<Trend>> {
        validate_metric_name(name)?;
        let mut map = self.instruments.write();
        match map.get(name) {
            Some(Instrument::Trend(t)) => Ok(Arc::clone(t)),
            Some(other) => Err(conflict(name, other)),
            None => {
                let trend = Arc::new(Trend::new(name, self.trend_policy)?);
                map.insert(name.to_string(), Instrument::Trend(Arc::clone(&trend)));
                Ok(trend)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Instrument> {
        self.instruments.read().get(name).cloned()
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.instruments.read().get(name).map(Instrument::kind)
    }

    pub fn len(&self) -> usize {
        self.instruments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.read().is_empty()
    }

    /// Snapshot one instrument
    pub fn snapshot_of(&self, name: &str) -> Option<MetricSnapshot> {
        self.get(name).map(|instrument| MetricSnapshot {
            name: name.to_string(),
            value: instrument.snapshot(),
        })
    }

    /// Snapshot every instrument, ordered by name
    ///
    /// Handles are cloned under the read lock; the per-instrument snapshots
    /// are taken after it is released.
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let handles: Vec<(String, Instrument)> = self
            .instruments
            .read()
            .iter()
            .map(|(name, instrument)| (name.clone(), instrument.clone()))
            .collect();

        handles
            .into_iter()
            .map(|(name, instrument)| MetricSnapshot {
                value: instrument.snapshot(),
                name,
            })
            .collect()
    }
}

fn conflict(name: &str, existing: &Instrument) -> anyhow::Error {
    RegistryError::TypeConflict {
        name: name.to_string(),
        existing: existing.kind().as_str(),
    }
    .into()
}

/// Metric names must be valid exposition identifiers: `[a-zA-Z_][a-zA-Z0-9_]*`
fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// Whether `prefix` keeps every registered name a valid identifier once
/// prepended. The empty prefix is allowed.
pub fn is_valid_metric_prefix(prefix: &str) -> bool {
    prefix.is_empty() || is_valid_metric_name(prefix)
}

fn validate_metric_name(name: &str) -> Result<(), RegistryError> {
    if is_valid_metric_name(name) {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn exact_trend(values: &[f64]) -> TrendSnapshot {
        let trend = Trend::new("t", SamplingPolicy::Exact).unwrap();
        for &v in values {
            trend.add(v);
        }
        trend.snapshot()
    }

    #[test]
    fn test_counter_concurrent_adds() {
        let counter = Arc::new(Counter::new("ops"));
        thread::scope(|s| {
            for _ in 0..8 {
                let counter = Arc::clone(&counter);
                s.spawn(move || {
                    for _ in 0..10_000 {
                        counter.inc();
                    }
                });
            }
        });
        assert_eq!(counter.value(), 80_000);
    }

    #[test]
    fn test_counter_is_monotonic_under_concurrent_reads() {
        let counter = Arc::new(Counter::new("ops"));
        thread::scope(|s| {
            let writer = Arc::clone(&counter);
            s.spawn(move || {
                for _ in 0..50_000 {
                    writer.add(3);
                }
            });
            let reader = Arc::clone(&counter);
            s.spawn(move || {
                let mut last = 0;
                for _ in 0..50_000 {
                    let now = reader.value();
                    assert!(now >= last, "counter went backwards: {} -> {}", last, now);
                    last = now;
                }
            });
        });
        assert_eq!(counter.value(), 150_000);
    }

    #[test]
    fn test_rate_with_no_observations_is_zero() {
        let rate = Rate::new("ok");
        assert_eq!(rate.value(), 0.0);
        assert_eq!(rate.counts(), (0, 0));
    }

    #[test]
    fn test_rate_value() {
        let rate = Rate::new("ok");
        rate.add(true);
        rate.add(true);
        rate.add(false);
        rate.add(true);
        assert_eq!(rate.counts(), (3, 4));
        assert!((rate.value() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rate_stays_in_unit_interval_under_concurrency() {
        let rate = Arc::new(Rate::new("ok"));
        thread::scope(|s| {
            for i in 0..4 {
                let rate = Arc::clone(&rate);
                s.spawn(move || {
                    for j in 0..20_000 {
                        rate.add((i + j) % 3 != 0);
                    }
                });
            }
            let reader = Arc::clone(&rate);
            s.spawn(move || {
                for _ in 0..20_000 {
                    let (success, total) = reader.counts();
                    assert!(success <= total);
                    let v = reader.value();
                    assert!((0.0..=1.0).contains(&v));
                }
            });
        });
        assert_eq!(rate.counts().1, 80_000);
    }

    #[test]
    fn test_gauge_tracks_peak() {
        let gauge = Gauge::new("vus");
        gauge.set(3);
        gauge.set(10);
        gauge.set(4);
        assert_eq!(gauge.value(), 4);
        assert_eq!(gauge.max(), 10);
    }

    #[test]
    fn test_nearest_rank_median_of_four() {
        let snap = exact_trend(&[40.0, 10.0, 30.0, 20.0]);
        assert_eq!(snap.percentile(50.0), Some(20.0));
        assert_eq!(snap.median(), Some(20.0));
    }

    #[test]
    fn test_percentile_extremes_match_min_and_max() {
        let snap = exact_trend(&[7.0, 3.5, 12.25, 9.0, 1.0]);
        assert_eq!(snap.percentile(0.0), Some(1.0));
        assert_eq!(snap.percentile(100.0), Some(12.25));
        assert_eq!(snap.min, Some(1.0));
        assert_eq!(snap.max, Some(12.25));
    }

    #[test]
    fn test_percentiles_on_hundred_values() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        let snap = exact_trend(&values);
        assert_eq!(snap.percentile(95.0), Some(95.0));
        assert_eq!(snap.percentile(99.0), Some(99.0));
        assert_eq!(snap.percentile(1.0), Some(1.0));
        assert_eq!(snap.percentile(0.5), Some(1.0));
        assert_eq!(snap.mean(), Some(50.5));
    }

    #[test]
    fn test_empty_trend_returns_none() {
        let snap = exact_trend(&[]);
        assert_eq!(snap.count, 0);
        assert_eq!(snap.percentile(50.0), None);
        assert_eq!(snap.percentile(0.0), None);
        assert_eq!(snap.mean(), None);
        assert_eq!(snap.min, None);
        assert_eq!(snap.max, None);
    }

    #[test]
    fn test_out_of_range_quantile_is_none() {
        let snap = exact_trend(&[1.0, 2.0]);
        assert_eq!(snap.percentile(-1.0), None);
        assert_eq!(snap.percentile(100.5), None);
    }

    #[test]
    fn test_non_finite_values_are_ignored() {
        let snap = exact_trend(&[f64::NAN, 5.0, f64::INFINITY]);
        assert_eq!(snap.count, 1);
        assert_eq!(snap.max, Some(5.0));
    }

    #[test]
    fn test_reservoir_is_bounded_and_keeps_exact_extremes() {
        let trend = Trend::new("t", SamplingPolicy::Reservoir { size: 50 }).unwrap();
        for i in 0..10_000 {
            trend.add(i as f64);
        }
        let snap = trend.snapshot();
        assert_eq!(snap.retained(), 50);
        assert_eq!(snap.count, 10_000);
        assert_eq!(snap.percentile(0.0), Some(0.0));
        assert_eq!(snap.percentile(100.0), Some(9_999.0));
        let median = snap.percentile(50.0).unwrap();
        assert!((0.0..10_000.0).contains(&median));
    }

    #[test]
    fn test_cumulative_buckets() {
        let snap = exact_trend(&[0.5, 1.0, 4.0, 9.0, 20.0]);
        let buckets = snap.cumulative_buckets(&[1.0, 5.0, 10.0, 100.0]);
        let counts: Vec<u64> = buckets.iter().map(|(_, c)| *c).collect();
        assert_eq!(counts, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_cumulative_buckets_on_coarse_bins() {
        // 250ms sits in a histogram bin wider than one microsecond.
        let snap = exact_trend(&[10.0, 250.0, 250.2, 2_000.0]);
        let buckets = snap.cumulative_buckets(&[10.0, 250.0, 1_000.0, 2_500.0]);
        let counts: Vec<u64> = buckets.iter().map(|(_, c)| *c).collect();
        assert_eq!(counts, vec![1, 2, 3, 4]);

        let empty = exact_trend(&[]);
        assert_eq!(empty.cumulative_buckets(&[1.0]), vec![(1.0, 0)]);
    }

    #[test]
    fn test_registry_get_or_register_returns_same_instrument() {
        let registry = MetricsRegistry::default();
        let a = registry.counter("iterations").unwrap();
        let b = registry.counter("iterations").unwrap();
        a.inc();
        assert_eq!(b.value(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_rejects_type_conflict() {
        let registry = MetricsRegistry::default();
        registry.rate("checks").unwrap();
        let err = registry.trend("checks").unwrap_err();
        assert_eq!(
            err.downcast_ref::<RegistryError>(),
            Some(&RegistryError::TypeConflict {
                name: "checks".to_string(),
                existing: "rate",
            })
        );
    }

    #[test]
    fn test_registry_rejects_invalid_names() {
        let registry = MetricsRegistry::default();
        assert!(registry.counter("").is_err());
        assert!(registry.counter("9lives").is_err());
        assert!(registry.counter("has-dash").is_err());
        assert!(registry.counter("_ok_name_2").is_ok());
    }

    #[test]
    fn test_registries_are_isolated() {
        let first = MetricsRegistry::default();
        let second = MetricsRegistry::default();
        first.counter("iterations").unwrap().add(5);
        assert_eq!(second.counter("iterations").unwrap().value(), 0);
    }

    #[test]
    fn test_snapshot_is_ordered_by_name() {
        let registry = MetricsRegistry::new(SamplingPolicy::Exact);
        registry.trend("b_duration").unwrap().add(3.0);
        registry.counter("a_count").unwrap().add(2);
        registry.rate("c_success").unwrap().add(true);

        let snapshot = registry.snapshot();
        let names: Vec<&str> = snapshot.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a_count", "b_duration", "c_success"]);
        assert_eq!(snapshot[2].value.rate(), Some(1.0));
        assert_eq!(registry.kind_of("b_duration"), Some(MetricKind::Trend));
    }
}
