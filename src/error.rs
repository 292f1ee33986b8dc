//! # Error Types
//!
//! Typed errors for the parts of the engine where callers need to tell failure
//! kinds apart. Orchestration code wraps these in `anyhow::Error` with context;
//! the types here stay matchable for tests and for the exit-status mapping in
//! `main`.

use std::time::Duration;
use thiserror::Error;

/// Faults detected while building a run profile.
///
/// Any of these aborts the run before the scheduler starts.
#[derive(Debug, Error, PartialEq)]
pub enum ProfileError {
    #[error("profile defines no stages")]
    NoStages,

    #[error("invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("invalid stage '{0}', expected <duration>:<target>")]
    InvalidStage(String),

    #[error("workload mix is empty")]
    EmptyMix,

    #[error("weighted mix entry '{kind}' has non-positive weight {weight}")]
    InvalidWeight { kind: String, weight: f64 },

    #[error("operation '{kind}': {reason}")]
    InvalidOperationProfile { kind: String, reason: String },

    #[error("think time range is inverted: min {min:?} > max {max:?}")]
    InvertedThinkTime { min: Duration, max: Duration },

    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },

    #[error("reservoir size must be at least 1")]
    EmptyReservoir,

    #[error("invalid metric name prefix '{0}'")]
    InvalidMetricPrefix(String),

    #[error("threshold on unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("threshold '{rule}' cannot be applied to {kind} metric '{metric}'")]
    ThresholdMismatch {
        metric: String,
        kind: &'static str,
        rule: String,
    },

    #[error(transparent)]
    Threshold(#[from] ThresholdParseError),
}

/// Errors raised while parsing a threshold rule such as `p(95)<200ms`.
#[derive(Debug, Error, PartialEq)]
pub enum ThresholdParseError {
    #[error("empty threshold rule")]
    Empty,

    #[error("unknown aggregation in '{0}'")]
    UnknownAggregation(String),

    #[error("missing comparison operator in '{0}'")]
    MissingOperator(String),

    #[error("invalid percentile in '{0}', expected p(0..=100)")]
    InvalidPercentile(String),

    #[error("invalid threshold value in '{0}'")]
    InvalidValue(String),
}

/// Errors from the instrument registry.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("metric '{name}' is already registered as a {existing}")]
    TypeConflict {
        name: String,
        existing: &'static str,
    },

    #[error("invalid metric name '{0}'")]
    InvalidName(String),
}

/// Collaborator-level failure: no operation could be executed at all.
///
/// Ordinary query failures are reported inside `OperationReport`; this error is
/// reserved for the case where the target cannot be reached.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("target unavailable: {0}")]
    Unavailable(String),
}
