//! # db-stress
//!
//! A staged load generator and metrics engine for relational database
//! workloads. A scheduler ramps a pool of concurrent virtual users (VUs)
//! through a profile of stages; every VU repeatedly runs a mix of database
//! operations against a backend, records latency and outcome metrics, and the
//! run ends with a pass/fail verdict computed from declarative thresholds.
//!
//! ## Architecture Overview
//!
//! - `metrics`: thread-safe instruments (counter, gauge, rate, trend) and the
//!   per-run registry
//! - `threshold`: parsing and evaluation of pass/fail rules such as `p(95)<200ms`
//! - `workload`: operation kinds, their declarative latency/error profiles, the
//!   workload mix and think time
//! - `backend`: the operation collaborator seam with a simulated and a TCP
//!   implementation
//! - `executor`: the per-VU iteration loop and outcome recording
//! - `scheduler`: the stage scheduler that grows and shrinks the VU pool
//! - `exporter`: periodic text-exposition export (push, pull, file)
//! - `controller`: top-level orchestration of a single run
//! - `profile`: run configuration loading and validation
//! - `results`: the run report and its JSON output
//! - `cli`, `logging`: command-line flags and tracing setup for the binary
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use db_stress::{profile::ProfileConfig, RunController, RunProfile};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ProfileConfig::from_file("profile.json".as_ref())?;
//!     let profile = RunProfile::from_config(config)?;
//!     let controller = RunController::new(profile)?;
//!     let report = controller.run().await?;
//!
//!     println!("passed: {}", report.passed);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cli;
pub mod controller;
pub mod error;
pub mod executor;
pub mod exporter;
pub mod logging;
pub mod metrics;
pub mod profile;
pub mod results;
pub mod scheduler;
pub mod threshold;
pub mod utils;
pub mod workload;

pub use controller::{RunController, StopHandle};
pub use metrics::{Counter, Gauge, MetricsRegistry, Rate, Trend};
pub use profile::{RunProfile, Stage};
pub use results::{RunReport, ResultsManager};
pub use threshold::{Threshold, ThresholdResult};
pub use workload::{ErrorClass, OperationKind, Outcome};

/// The current version of db-stress, recorded in every run report
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Used whenever neither the profile file nor the command line sets a value.
pub mod defaults {
    use std::time::Duration;

    /// Scheduler control tick
    ///
    /// The VU pool is resized at most once per tick, so this bounds how far
    /// the live count can lag behind the interpolated stage target.
    pub const TICK: Duration = Duration::from_millis(100);

    /// Time VUs are given to finish their in-flight iteration during drain
    pub const GRACE: Duration = Duration::from_secs(30);

    /// Interval between metric exports
    pub const EXPORT_INTERVAL: Duration = Duration::from_secs(10);

    /// Per-operation ceiling after which an operation counts as timed out
    pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

    /// Reservoir slots per trend
    ///
    /// 2,000 samples keep memory flat under sustained high-throughput runs
    /// while leaving p99 well resolved.
    pub const RESERVOIR_SIZE: usize = 2_000;

    /// Prefix applied to every exported metric name
    pub const METRIC_PREFIX: &str = "dbstress_";

    /// Job label used for push-based export
    pub const JOB: &str = "db-stress";

    /// Default output file for the run report
    pub const OUTPUT_FILE: &str = "load_results.json";

    /// Upper bounds (milliseconds) of the exported latency histogram buckets
    pub const HISTOGRAM_BUCKETS_MS: &[f64] = &[
        1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0,
    ];

    /// Number of scheduler ticks retained in the VU trace
    pub const TRACE_CAPACITY: usize = 10_000;
}
