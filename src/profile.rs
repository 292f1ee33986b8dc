//! # Run Profile
//!
//! A run is described by a [`RunProfile`]: the ordered stages the scheduler
//! walks through, the thresholds evaluated at the end, the workload mix, and
//! the scheduler, backend and exporter settings. Profiles are built once,
//! validated, and shared read-only for the rest of the run.
//!
//! Profiles are usually loaded from JSON through [`ProfileConfig`]:
//!
//! ```json
//! {
//!   "name": "checkout-ramp",
//!   "stages": [
//!     { "duration": "30s", "target": 5 },
//!     { "duration": "30s", "target": 0 }
//!   ],
//!   "thresholds": {
//!     "operation_success": ["rate>0.95"],
//!     "operation_duration": ["p(95)<200ms"]
//!   },
//!   "mix": { "strategy": "weighted", "weights": { "user_lookup": 3, "place_order": 1 } },
//!   "think_time": { "type": "uniform", "min": "500ms", "max": "1500ms" },
//!   "backend": { "type": "simulated", "mode": "sleep" }
//! }
//! ```
//!
//! Durations are written as strings (`"250us"`, `"500ms"`, `"30s"`, `"2m"`,
//! `"1h"`) or as a plain number of seconds.

use crate::backend::SimulationMode;
use crate::error::ProfileError;
use crate::metrics::{is_valid_metric_prefix, SamplingPolicy};
use crate::threshold::Threshold;
use crate::utils::parse_duration;
use crate::workload::{
    default_mix_entries, Degradation, ErrorWeights, LatencyDistribution, OperationKind,
    OperationProfile, ThinkTime, WorkloadMix,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Serde helpers for durations written as `"30s"` or a number of seconds
pub mod duration_serde {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(f64),
    }

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_compact(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
            Raw::Seconds(secs) if secs.is_finite() && secs >= 0.0 => {
                Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
            }
            Raw::Seconds(secs) => Err(serde::de::Error::custom(format!(
                "Duration cannot be negative: {}",
                secs
            ))),
        }
    }

    /// Shortest exact textual form accepted by [`parse_duration`]
    pub fn format_compact(d: Duration) -> String {
        let nanos = d.as_nanos();
        if nanos % 1_000_000_000 == 0 {
            format!("{}s", d.as_secs())
        } else if nanos % 1_000_000 == 0 {
            format!("{}ms", d.as_millis())
        } else {
            format!("{}us", d.as_micros())
        }
    }
}

/// A duration field in a profile file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HumanDuration(pub Duration);

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        duration_serde::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        duration_serde::deserialize(deserializer).map(HumanDuration)
    }
}

impl From<Duration> for HumanDuration {
    fn from(d: Duration) -> Self {
        HumanDuration(d)
    }
}

/// One step of the load shape
///
/// The live VU count moves linearly from the previous stage's target (0 for
/// the first stage) to `target` over `duration`. A zero duration jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", duration_serde::format_compact(self.duration), self.target)
    }
}

/// Parses the command-line form `<duration>:<target>`, e.g. `30s:5`
impl FromStr for Stage {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (duration, target) = s
            .split_once(':')
            .ok_or_else(|| ProfileError::InvalidStage(s.to_string()))?;
        let duration =
            parse_duration(duration).map_err(|reason| ProfileError::InvalidDuration {
                value: duration.to_string(),
                reason,
            })?;
        let target = target
            .trim()
            .parse()
            .map_err(|_| ProfileError::InvalidStage(s.to_string()))?;
        Ok(Stage { duration, target })
    }
}

/// Workload mix as written in a profile file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MixConfig {
    RoundRobin { operations: Vec<String> },
    Weighted { weights: BTreeMap<String, f64> },
}

/// Partial override of an operation kind's built-in profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OperationOverride {
    pub latency: Option<LatencyDistribution>,
    pub base_success_rate: Option<f64>,
    pub error_weights: Option<ErrorWeights>,
    pub degradation: Option<Degradation>,
    pub timeout: Option<HumanDuration>,
}

impl OperationOverride {
    fn apply(&self, base: OperationProfile) -> OperationProfile {
        OperationProfile {
            latency: self.latency.unwrap_or(base.latency),
            base_success_rate: self.base_success_rate.unwrap_or(base.base_success_rate),
            error_weights: self.error_weights.unwrap_or(base.error_weights),
            degradation: self.degradation.unwrap_or(base.degradation),
            timeout: self.timeout.map(|t| t.0).unwrap_or(base.timeout),
        }
    }
}

/// Which operation collaborator the VUs talk to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process simulation driven by the per-kind operation profiles
    Simulated {
        #[serde(default)]
        mode: SimulationMode,
        #[serde(default)]
        seed: Option<u64>,
    },
    /// A TCP connect per operation against a live database endpoint
    Tcp {
        address: String,
        #[serde(default)]
        connect_timeout: Option<HumanDuration>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Simulated {
            mode: SimulationMode::default(),
            seed: None,
        }
    }
}

/// Exporter section of a profile file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    pub interval: Option<HumanDuration>,
    pub prefix: Option<String>,
    pub job: Option<String>,
    pub instance: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub push_url: Option<String>,
    pub listen: Option<SocketAddr>,
    pub file: Option<PathBuf>,
}

/// Raw, unvalidated profile as read from disk or assembled from flags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileConfig {
    pub name: Option<String>,
    pub stages: Vec<Stage>,
    pub thresholds: BTreeMap<String, Vec<String>>,
    pub mix: Option<MixConfig>,
    pub operations: BTreeMap<String, OperationOverride>,
    pub operations_per_iteration: Option<usize>,
    pub think_time: Option<ThinkTime>,
    pub tick: Option<HumanDuration>,
    pub grace: Option<HumanDuration>,
    pub max_duration: Option<HumanDuration>,
    pub sampling: Option<SamplingPolicy>,
    pub backend: Option<BackendConfig>,
    pub export: ExportConfig,
}

impl ProfileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid profile {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Resolved exporter settings
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSettings {
    pub interval: Duration,
    pub prefix: String,
    pub job: String,
    pub instance: String,
    pub labels: BTreeMap<String, String>,
    pub push_url: Option<String>,
    pub listen: Option<SocketAddr>,
    pub file: Option<PathBuf>,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            interval: crate::defaults::EXPORT_INTERVAL,
            prefix: crate::defaults::METRIC_PREFIX.to_string(),
            job: crate::defaults::JOB.to_string(),
            instance: format!("{}-{}", crate::defaults::JOB, std::process::id()),
            labels: BTreeMap::new(),
            push_url: None,
            listen: None,
            file: None,
        }
    }
}

impl ExportSettings {
    /// Whether any sink is configured
    pub fn is_enabled(&self) -> bool {
        self.push_url.is_some() || self.listen.is_some() || self.file.is_some()
    }
}

/// Validated, immutable description of one run
#[derive(Debug, Clone)]
pub struct RunProfile {
    pub name: String,
    pub stages: Vec<Stage>,
    /// Ordered by metric name, then declaration order within a metric
    pub thresholds: Vec<Threshold>,
    pub mix: WorkloadMix,
    pub operations: BTreeMap<OperationKind, OperationProfile>,
    pub operations_per_iteration: usize,
    pub think_time: ThinkTime,
    pub tick: Duration,
    pub grace: Duration,
    /// Hard wall-clock cap, independent of the stage durations
    pub max_duration: Option<Duration>,
    pub sampling: SamplingPolicy,
    pub backend: BackendConfig,
    pub export: ExportSettings,
}

impl RunProfile {
    /// Profile with default settings around the given stages
    ///
    /// Cycles round-robin over every operation kind with their built-in
    /// profiles. Callers adjust the public fields, then [`validate`](Self::validate).
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            name: "default".to_string(),
            stages,
            thresholds: Vec::new(),
            mix: WorkloadMix::RoundRobin(OperationKind::ALL.to_vec()),
            operations: OperationKind::ALL
                .iter()
                .map(|k| (*k, k.default_profile()))
                .collect(),
            operations_per_iteration: 1,
            think_time: ThinkTime::default(),
            tick: crate::defaults::TICK,
            grace: crate::defaults::GRACE,
            max_duration: None,
            sampling: SamplingPolicy::default(),
            backend: BackendConfig::default(),
            export: ExportSettings::default(),
        }
    }

    pub fn from_config(config: ProfileConfig) -> Result<Self, ProfileError> {
        let mut profile = RunProfile::new(config.stages);
        if let Some(name) = config.name {
            profile.name = name;
        }

        for (metric, rules) in &config.thresholds {
            for rule in rules {
                profile.thresholds.push(Threshold::parse(metric, rule)?);
            }
        }

        profile.mix = match config.mix {
            None => WorkloadMix::weighted(default_mix_entries())?,
            Some(MixConfig::RoundRobin { operations }) => WorkloadMix::round_robin(
                operations
                    .iter()
                    .map(|name| parse_kind(name))
                    .collect::<Result<_, _>>()?,
            )?,
            Some(MixConfig::Weighted { weights }) => WorkloadMix::weighted(
                weights
                    .iter()
                    .map(|(name, w)| parse_kind(name).map(|k| (k, *w)))
                    .collect::<Result<_, _>>()?,
            )?,
        };

        for (name, overrides) in &config.operations {
            let kind = parse_kind(name)?;
            let base = kind.default_profile();
            profile.operations.insert(kind, overrides.apply(base));
        }

        if let Some(n) = config.operations_per_iteration {
            profile.operations_per_iteration = n;
        }
        if let Some(think_time) = config.think_time {
            profile.think_time = think_time;
        }
        if let Some(tick) = config.tick {
            profile.tick = tick.0;
        }
        if let Some(grace) = config.grace {
            profile.grace = grace.0;
        }
        profile.max_duration = config.max_duration.map(|d| d.0);
        if let Some(sampling) = config.sampling {
            profile.sampling = sampling;
        }
        if let Some(backend) = config.backend {
            profile.backend = backend;
        }

        let export = config.export;
        let defaults = ExportSettings::default();
        let job = export.job.unwrap_or(defaults.job);
        profile.export = ExportSettings {
            interval: export.interval.map(|d| d.0).unwrap_or(defaults.interval),
            prefix: export.prefix.unwrap_or(defaults.prefix),
            instance: export.instance.unwrap_or(defaults.instance),
            job,
            labels: export.labels,
            push_url: export.push_url,
            listen: export.listen,
            file: export.file,
        };

        profile.validate()?;
        Ok(profile)
    }

    /// Check every invariant a run relies on
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.stages.is_empty() {
            return Err(ProfileError::NoStages);
        }
        if self.tick.is_zero() {
            return Err(ProfileError::ZeroInterval { field: "tick" });
        }
        if self.export.interval.is_zero() {
            return Err(ProfileError::ZeroInterval {
                field: "export interval",
            });
        }
        if self.max_duration == Some(Duration::ZERO) {
            return Err(ProfileError::ZeroInterval {
                field: "max_duration",
            });
        }
        if self.operations_per_iteration == 0 {
            return Err(ProfileError::ZeroInterval {
                field: "operations_per_iteration",
            });
        }
        if let SamplingPolicy::Reservoir { size: 0 } = self.sampling {
            return Err(ProfileError::EmptyReservoir);
        }
        if !is_valid_metric_prefix(&self.export.prefix) {
            return Err(ProfileError::InvalidMetricPrefix(
                self.export.prefix.clone(),
            ));
        }
        self.think_time.validate()?;
        for kind in self.mix.kinds() {
            self.operation_profile(kind).validate(kind)?;
        }
        Ok(())
    }

    /// Sum of all stage durations
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Highest target across all stages
    pub fn peak_target(&self) -> u32 {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Profile for a kind, falling back to its built-in default
    pub fn operation_profile(&self, kind: OperationKind) -> OperationProfile {
        self.operations
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_profile())
    }
}

fn parse_kind(name: &str) -> Result<OperationKind, ProfileError> {
    name.parse()
        .map_err(|reason| ProfileError::InvalidOperationProfile {
            kind: name.to_string(),
            reason,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "name": "checkout-ramp",
        "stages": [
            { "duration": "30s", "target": 5 },
            { "duration": 30, "target": 0 }
        ],
        "thresholds": {
            "operation_success": ["rate>0.95"],
            "operation_duration": ["p(95)<200ms", "max<2s"]
        },
        "mix": { "strategy": "weighted", "weights": { "user_lookup": 3, "place_order": 1 } },
        "operations": {
            "place_order": { "base_success_rate": 0.5, "timeout": "250ms" }
        },
        "think_time": { "type": "fixed", "duration": "100ms" },
        "tick": "50ms",
        "max_duration": "45s",
        "sampling": { "mode": "exact" },
        "backend": { "type": "simulated", "mode": "virtual", "seed": 7 },
        "export": { "interval": "5s", "job": "ci", "labels": { "env": "test" } }
    }"#;

    #[test]
    fn test_load_full_profile() {
        let config = ProfileConfig::from_json(SAMPLE).unwrap();
        let profile = RunProfile::from_config(config).unwrap();

        assert_eq!(profile.name, "checkout-ramp");
        assert_eq!(
            profile.stages,
            vec![
                Stage::new(Duration::from_secs(30), 5),
                Stage::new(Duration::from_secs(30), 0)
            ]
        );
        assert_eq!(profile.total_duration(), Duration::from_secs(60));
        assert_eq!(profile.peak_target(), 5);
        assert_eq!(profile.tick, Duration::from_millis(50));
        assert_eq!(profile.max_duration, Some(Duration::from_secs(45)));
        assert_eq!(profile.sampling, SamplingPolicy::Exact);
        assert_eq!(
            profile.think_time,
            ThinkTime::Fixed {
                duration: Duration::from_millis(100)
            }
        );
        assert_eq!(
            profile.backend,
            BackendConfig::Simulated {
                mode: SimulationMode::Virtual,
                seed: Some(7)
            }
        );
        assert_eq!(profile.export.job, "ci");
        assert_eq!(profile.export.interval, Duration::from_secs(5));
        assert_eq!(profile.export.prefix, crate::defaults::METRIC_PREFIX);
        assert!(!profile.export.is_enabled());

        let place_order = profile.operation_profile(OperationKind::PlaceOrder);
        assert_eq!(place_order.base_success_rate, 0.5);
        assert_eq!(place_order.timeout, Duration::from_millis(250));
        assert_eq!(
            place_order.latency,
            OperationKind::PlaceOrder.default_profile().latency
        );

        assert_eq!(
            profile.mix.kinds(),
            vec![OperationKind::PlaceOrder, OperationKind::UserLookup]
        );
    }

    #[test]
    fn test_thresholds_ordered_by_metric_then_declaration() {
        let config = ProfileConfig::from_json(SAMPLE).unwrap();
        let profile = RunProfile::from_config(config).unwrap();
        let names: Vec<String> = profile.thresholds.iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec![
                "operation_duration: p(95)<200ms",
                "operation_duration: max<2s",
                "operation_success: rate>0.95",
            ]
        );
    }

    #[test]
    fn test_stage_from_str() {
        assert_eq!(
            "30s:5".parse::<Stage>().unwrap(),
            Stage::new(Duration::from_secs(30), 5)
        );
        assert_eq!(
            "0:50".parse::<Stage>().unwrap(),
            Stage::new(Duration::ZERO, 50)
        );
        assert!(matches!(
            "30s".parse::<Stage>(),
            Err(ProfileError::InvalidStage(_))
        ));
        assert!(matches!(
            "-1s:5".parse::<Stage>(),
            Err(ProfileError::InvalidDuration { .. })
        ));
        assert!(matches!(
            "10s:-5".parse::<Stage>(),
            Err(ProfileError::InvalidStage(_))
        ));
        assert_eq!(Stage::new(Duration::from_millis(1500), 3).to_string(), "1500ms:3");
    }

    #[test]
    fn test_negative_duration_in_file_is_rejected() {
        let json = r#"{ "stages": [ { "duration": "-5s", "target": 1 } ] }"#;
        assert!(ProfileConfig::from_json(json).is_err());
        let json = r#"{ "stages": [ { "duration": -5, "target": 1 } ] }"#;
        assert!(ProfileConfig::from_json(json).is_err());
    }

    #[test]
    fn test_validation_faults() {
        assert_eq!(
            RunProfile::from_config(ProfileConfig::default()).unwrap_err(),
            ProfileError::NoStages
        );

        let mut profile = RunProfile::new(vec![Stage::new(Duration::from_secs(1), 1)]);
        profile.tick = Duration::ZERO;
        assert_eq!(
            profile.validate(),
            Err(ProfileError::ZeroInterval { field: "tick" })
        );

        let mut profile = RunProfile::new(vec![Stage::new(Duration::from_secs(1), 1)]);
        profile.sampling = SamplingPolicy::Reservoir { size: 0 };
        assert_eq!(profile.validate(), Err(ProfileError::EmptyReservoir));

        let mut profile = RunProfile::new(vec![Stage::new(Duration::from_secs(1), 1)]);
        profile.export.prefix = "db-stress".to_string();
        assert_eq!(
            profile.validate(),
            Err(ProfileError::InvalidMetricPrefix("db-stress".to_string()))
        );
        profile.export.prefix = "9lives_".to_string();
        assert!(profile.validate().is_err());
        profile.export.prefix = String::new();
        assert_eq!(profile.validate(), Ok(()));
        profile.export.prefix = "load_test_".to_string();
        assert_eq!(profile.validate(), Ok(()));

        let config = ProfileConfig::from_json(
            r#"{ "stages": [ { "duration": "1s", "target": 1 } ],
                 "thresholds": { "operation_success": ["rate=>1"] } }"#,
        )
        .unwrap();
        assert!(matches!(
            RunProfile::from_config(config),
            Err(ProfileError::Threshold(_))
        ));

        let config = ProfileConfig::from_json(
            r#"{ "stages": [ { "duration": "1s", "target": 1 } ],
                 "mix": { "strategy": "round_robin", "operations": ["truncate_all"] } }"#,
        )
        .unwrap();
        assert!(matches!(
            RunProfile::from_config(config),
            Err(ProfileError::InvalidOperationProfile { .. })
        ));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let json = r#"{ "stages": [], "stagse": [] }"#;
        assert!(ProfileConfig::from_json(json).is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = ProfileConfig::from_file(&path).unwrap();
        assert_eq!(config.stages.len(), 2);

        let missing = ProfileConfig::from_file(&dir.path().join("missing.json"));
        assert!(missing.is_err());
    }
}
