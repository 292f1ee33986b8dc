//! # Workload Model
//!
//! The closed set of database operations a virtual user can run, the
//! declarative profile describing how each one behaves under simulation, and
//! the mix and think-time settings that shape an iteration.
//!
//! Operation kinds follow a small e-commerce schema (users, products,
//! orders/order_items, reviews, sessions). Each kind has a default
//! [`OperationProfile`]; a run profile can override any field per kind.

use crate::error::ProfileError;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A database operation a VU can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Point read of a user row by primary key
    UserLookup,
    /// Filtered, paginated product listing
    ProductSearch,
    /// A user's orders joined with their line items
    OrderHistory,
    /// Transactional insert of an order and its items
    PlaceOrder,
    /// Inventory decrement on a product row
    UpdateStock,
    /// Insert into the reviews table
    PostReview,
    /// Aggregate report over orders; the heavy query of the mix
    SalesReport,
    /// Session keep-alive upsert
    SessionTouch,
}

impl OperationKind {
    pub const ALL: [OperationKind; 8] = [
        OperationKind::UserLookup,
        OperationKind::ProductSearch,
        OperationKind::OrderHistory,
        OperationKind::PlaceOrder,
        OperationKind::UpdateStock,
        OperationKind::PostReview,
        OperationKind::SalesReport,
        OperationKind::SessionTouch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::UserLookup => "user_lookup",
            OperationKind::ProductSearch => "product_search",
            OperationKind::OrderHistory => "order_history",
            OperationKind::PlaceOrder => "place_order",
            OperationKind::UpdateStock => "update_stock",
            OperationKind::PostReview => "post_review",
            OperationKind::SalesReport => "sales_report",
            OperationKind::SessionTouch => "session_touch",
        }
    }

    /// Dense position of the kind, for table lookups
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Built-in behaviour used when a profile does not override the kind
    pub fn default_profile(&self) -> OperationProfile {
        let (latency, base_success_rate) = match self {
            OperationKind::UserLookup => (LatencyDistribution::uniform(2.0, 8.0), 0.995),
            OperationKind::ProductSearch => (LatencyDistribution::uniform(10.0, 40.0), 0.99),
            OperationKind::OrderHistory => (LatencyDistribution::uniform(15.0, 60.0), 0.99),
            OperationKind::PlaceOrder => (LatencyDistribution::uniform(20.0, 80.0), 0.98),
            OperationKind::UpdateStock => (LatencyDistribution::uniform(5.0, 20.0), 0.985),
            OperationKind::PostReview => (LatencyDistribution::uniform(8.0, 25.0), 0.99),
            OperationKind::SalesReport => {
                (LatencyDistribution::Exponential { mean_ms: 120.0 }, 0.97)
            }
            OperationKind::SessionTouch => (LatencyDistribution::uniform(1.0, 5.0), 0.999),
        };
        OperationProfile {
            latency,
            base_success_rate,
            ..OperationProfile::default()
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| format!("unknown operation kind '{}'", s))
    }
}

/// Failure classification of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    None,
    Connection,
    Query,
    Timeout,
}

impl ErrorClass {
    /// Name of the counter that tallies this class, `None` for successes
    pub fn counter_name(&self) -> Option<&'static str> {
        match self {
            ErrorClass::None => None,
            ErrorClass::Connection => Some("errors_connection"),
            ErrorClass::Query => Some("errors_query"),
            ErrorClass::Timeout => Some("errors_timeout"),
        }
    }
}

/// Result of one attempted operation, consumed immediately by the instruments
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub kind: OperationKind,
    pub duration_ms: f64,
    pub success: bool,
    pub error_class: ErrorClass,
}

/// Simulated latency model, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LatencyDistribution {
    Fixed { ms: f64 },
    Uniform { min_ms: f64, max_ms: f64 },
    Exponential { mean_ms: f64 },
}

impl LatencyDistribution {
    pub fn uniform(min_ms: f64, max_ms: f64) -> Self {
        LatencyDistribution::Uniform { min_ms, max_ms }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            LatencyDistribution::Fixed { ms } => ms,
            LatencyDistribution::Uniform { min_ms, max_ms } => {
                if max_ms > min_ms {
                    rng.gen_range(min_ms..=max_ms)
                } else {
                    min_ms
                }
            }
            LatencyDistribution::Exponential { mean_ms } => {
                // Inverse transform; 1 - u keeps the argument in (0, 1].
                let u: f64 = rng.gen();
                -mean_ms * (1.0 - u).ln()
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        let ok = match *self {
            LatencyDistribution::Fixed { ms } => ms.is_finite() && ms >= 0.0,
            LatencyDistribution::Uniform { min_ms, max_ms } => {
                min_ms.is_finite() && max_ms.is_finite() && min_ms >= 0.0 && min_ms <= max_ms
            }
            LatencyDistribution::Exponential { mean_ms } => mean_ms.is_finite() && mean_ms > 0.0,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("invalid latency distribution {:?}", self))
        }
    }
}

/// Relative weights used to classify a simulated failure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorWeights {
    pub connection: f64,
    pub query: f64,
    pub timeout: f64,
}

impl Default for ErrorWeights {
    fn default() -> Self {
        Self {
            connection: 0.1,
            query: 0.8,
            timeout: 0.1,
        }
    }
}

impl ErrorWeights {
    fn validate(&self) -> Result<(), String> {
        let weights = [self.connection, self.query, self.timeout];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err("error weights must be non-negative".to_string());
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err("at least one error weight must be positive".to_string());
        }
        Ok(())
    }

    /// Draw a failure class in proportion to the weights
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ErrorClass {
        let total = self.connection + self.query + self.timeout;
        let pick = rng.gen::<f64>() * total;
        if pick < self.connection {
            ErrorClass::Connection
        } else if pick < self.connection + self.query {
            ErrorClass::Query
        } else {
            ErrorClass::Timeout
        }
    }
}

/// Behaviour change as live concurrency grows
///
/// Both terms are linear in the number of live VUs handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Degradation {
    pub success_drop_per_vu: f64,
    pub latency_ms_per_vu: f64,
}

/// Declarative description of how one operation kind behaves
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationProfile {
    pub latency: LatencyDistribution,
    pub base_success_rate: f64,
    pub error_weights: ErrorWeights,
    pub degradation: Degradation,
    /// Ceiling after which the operation counts as timed out
    #[serde(with = "crate::profile::duration_serde")]
    pub timeout: Duration,
}

impl Default for OperationProfile {
    fn default() -> Self {
        Self {
            latency: LatencyDistribution::Fixed { ms: 10.0 },
            base_success_rate: 1.0,
            error_weights: ErrorWeights::default(),
            degradation: Degradation::default(),
            timeout: crate::defaults::OPERATION_TIMEOUT,
        }
    }
}

impl OperationProfile {
    pub fn validate(&self, kind: OperationKind) -> Result<(), ProfileError> {
        let invalid = |reason: String| ProfileError::InvalidOperationProfile {
            kind: kind.to_string(),
            reason,
        };
        if !(0.0..=1.0).contains(&self.base_success_rate) {
            return Err(invalid(format!(
                "base_success_rate {} outside [0, 1]",
                self.base_success_rate
            )));
        }
        self.latency.validate().map_err(invalid)?;
        self.error_weights.validate().map_err(invalid)?;
        let d = self.degradation;
        if !d.success_drop_per_vu.is_finite()
            || !d.latency_ms_per_vu.is_finite()
            || d.success_drop_per_vu < 0.0
            || d.latency_ms_per_vu < 0.0
        {
            return Err(invalid("degradation terms must be non-negative".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Success probability at the given live concurrency, floored at zero
    pub fn success_rate_at(&self, live_vus: usize) -> f64 {
        (self.base_success_rate - self.degradation.success_drop_per_vu * live_vus as f64)
            .clamp(0.0, 1.0)
    }

    /// Sample a latency and add the concurrency penalty
    pub fn latency_at<R: Rng + ?Sized>(&self, rng: &mut R, live_vus: usize) -> f64 {
        let base = self.latency.sample(rng).max(0.0);
        base + self.degradation.latency_ms_per_vu * live_vus as f64
    }
}

/// Delay applied by a VU between iterations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkTime {
    None,
    Fixed {
        #[serde(with = "crate::profile::duration_serde")]
        duration: Duration,
    },
    Uniform {
        #[serde(with = "crate::profile::duration_serde")]
        min: Duration,
        #[serde(with = "crate::profile::duration_serde")]
        max: Duration,
    },
}

impl Default for ThinkTime {
    fn default() -> Self {
        ThinkTime::Uniform {
            min: Duration::from_millis(500),
            max: Duration::from_millis(1500),
        }
    }
}

impl ThinkTime {
    pub fn validate(&self) -> Result<(), ProfileError> {
        match *self {
            ThinkTime::Uniform { min, max } if min > max => {
                Err(ProfileError::InvertedThinkTime { min, max })
            }
            _ => Ok(()),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match *self {
            ThinkTime::None => Duration::ZERO,
            ThinkTime::Fixed { duration } => duration,
            ThinkTime::Uniform { min, max } if max > min => rng.gen_range(min..=max),
            ThinkTime::Uniform { min, .. } => min,
        }
    }
}

/// How a VU chooses the next operation
#[derive(Debug, Clone)]
pub enum WorkloadMix {
    /// Cycle through the kinds in order
    RoundRobin(Vec<OperationKind>),
    /// Independent weighted random choice
    Weighted {
        kinds: Vec<OperationKind>,
        index: WeightedIndex<f64>,
    },
}

impl WorkloadMix {
    pub fn round_robin(kinds: Vec<OperationKind>) -> Result<Self, ProfileError> {
        if kinds.is_empty() {
            return Err(ProfileError::EmptyMix);
        }
        Ok(WorkloadMix::RoundRobin(kinds))
    }

    pub fn weighted(entries: Vec<(OperationKind, f64)>) -> Result<Self, ProfileError> {
        if entries.is_empty() {
            return Err(ProfileError::EmptyMix);
        }
        if let Some((kind, weight)) = entries
            .iter()
            .find(|(_, w)| !w.is_finite() || *w <= 0.0)
        {
            return Err(ProfileError::InvalidWeight {
                kind: kind.to_string(),
                weight: *weight,
            });
        }
        let (kinds, weights): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        let index = WeightedIndex::new(weights).map_err(|_| ProfileError::EmptyMix)?;
        Ok(WorkloadMix::Weighted { kinds, index })
    }

    /// A single always-selected kind
    pub fn single(kind: OperationKind) -> Self {
        WorkloadMix::RoundRobin(vec![kind])
    }

    /// Kinds that can be selected, in declaration order, without duplicates
    pub fn kinds(&self) -> Vec<OperationKind> {
        let all = match self {
            WorkloadMix::RoundRobin(kinds) => kinds,
            WorkloadMix::Weighted { kinds, .. } => kinds,
        };
        let mut unique = Vec::with_capacity(all.len());
        for kind in all {
            if !unique.contains(kind) {
                unique.push(*kind);
            }
        }
        unique
    }

    /// Pick the operation for selection number `step` of this VU
    pub fn select<R: Rng + ?Sized>(&self, step: u64, rng: &mut R) -> OperationKind {
        match self {
            WorkloadMix::RoundRobin(kinds) => kinds[(step % kinds.len() as u64) as usize],
            WorkloadMix::Weighted { kinds, index } => kinds[index.sample(rng)],
        }
    }
}

/// Weights used when a profile does not declare a mix
pub fn default_mix_entries() -> Vec<(OperationKind, f64)> {
    vec![
        (OperationKind::UserLookup, 30.0),
        (OperationKind::ProductSearch, 25.0),
        (OperationKind::OrderHistory, 15.0),
        (OperationKind::PlaceOrder, 10.0),
        (OperationKind::UpdateStock, 5.0),
        (OperationKind::PostReview, 5.0),
        (OperationKind::SalesReport, 5.0),
        (OperationKind::SessionTouch, 5.0),
    ]
}
