//! # Workload Executor
//!
//! Runs the iteration loop of every virtual user. Each iteration selects one or
//! more operations from the workload mix, executes them through the backend,
//! classifies every outcome and records the whole iteration into the metric
//! instruments in one synchronous step.
//!
//! Recording happens only after an iteration has fully completed. A VU task
//! that is aborted mid-iteration therefore leaves no trace in the metrics: no
//! partial iteration is ever recorded and no outcome is fabricated.
//!
//! ## Instruments
//!
//! | Name                     | Kind    | Written                      |
//! |--------------------------|---------|------------------------------|
//! | `<kind>_duration`        | trend   | every operation              |
//! | `<kind>_success`         | rate    | every operation              |
//! | `<kind>_count`           | counter | every operation              |
//! | `operation_duration`     | trend   | every operation              |
//! | `operation_success`      | rate    | every operation              |
//! | `operations`             | counter | every operation              |
//! | `errors_<class>`         | counter | failed operations            |
//! | `iterations`             | counter | every completed iteration    |
//! | `iteration_duration`     | trend   | every completed iteration    |

use crate::backend::{LoadContext, OperationBackend, OperationReport};
use crate::error::BackendError;
use crate::metrics::{Counter, MetricsRegistry, Rate, Trend};
use crate::profile::{BackendConfig, RunProfile};
use crate::workload::{ErrorClass, OperationKind, Outcome, ThinkTime, WorkloadMix};
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

/// Cooperative stop signal for one VU
///
/// The flag is polled at every iteration boundary; the notify wakes a VU
/// sleeping through its think time so it exits without waiting it out.
#[derive(Debug, Default)]
pub struct VuControl {
    cancelled: AtomicBool,
    wake: Notify,
    completed: AtomicU64,
}

impl VuControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        // Stores a permit if the VU is not currently waiting.
        self.wake.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Iterations this VU has finished and recorded
    ///
    /// Still readable after the VU task has been aborted.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

/// Pre-resolved handles for one operation kind
#[derive(Debug, Clone)]
pub struct ResolvedOperation {
    pub kind: OperationKind,
    pub timeout: Duration,
    duration: Arc<Trend>,
    success: Arc<Rate>,
    count: Arc<Counter>,
}

/// Run-wide instruments written by every VU
#[derive(Debug, Clone)]
pub struct GlobalInstruments {
    pub operation_duration: Arc<Trend>,
    pub operation_success: Arc<Rate>,
    pub operations: Arc<Counter>,
    pub errors_connection: Arc<Counter>,
    pub errors_query: Arc<Counter>,
    pub errors_timeout: Arc<Counter>,
    pub iterations: Arc<Counter>,
    pub iteration_duration: Arc<Trend>,
}

impl GlobalInstruments {
    pub fn register(registry: &MetricsRegistry) -> Result<Self> {
        let errors = |class: ErrorClass| -> Result<Arc<Counter>> {
            let name = class
                .counter_name()
                .with_context(|| format!("{:?} has no error counter", class))?;
            registry.counter(name)
        };
        Ok(Self {
            operation_duration: registry.trend("operation_duration")?,
            operation_success: registry.rate("operation_success")?,
            operations: registry.counter("operations")?,
            errors_connection: errors(ErrorClass::Connection)?,
            errors_query: errors(ErrorClass::Query)?,
            errors_timeout: errors(ErrorClass::Timeout)?,
            iterations: registry.counter("iterations")?,
            iteration_duration: registry.trend("iteration_duration")?,
        })
    }

    fn error_counter(&self, class: ErrorClass) -> Option<&Counter> {
        match class {
            ErrorClass::None => None,
            ErrorClass::Connection => Some(&self.errors_connection),
            ErrorClass::Query => Some(&self.errors_query),
            ErrorClass::Timeout => Some(&self.errors_timeout),
        }
    }
}

/// Outcomes of one completed iteration
#[derive(Debug, Clone, PartialEq)]
pub struct Iteration {
    pub outcomes: Vec<Outcome>,
    pub duration_ms: f64,
    /// Whether a connection-level failure cut the iteration short
    pub ended_early: bool,
}

/// What a VU did before it exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VuSummary {
    pub vu_id: u64,
    pub iterations: u64,
    pub operations: u64,
}

/// Shared by every VU of a run
pub struct Executor {
    backend: Arc<dyn OperationBackend>,
    mix: WorkloadMix,
    table: Vec<Option<ResolvedOperation>>,
    globals: GlobalInstruments,
    think_time: ThinkTime,
    operations_per_iteration: usize,
    live_vus: Arc<AtomicUsize>,
    seed: Option<u64>,
}

impl Executor {
    /// Resolve the handler table and register every instrument the VUs write
    pub fn new(
        profile: &RunProfile,
        registry: &MetricsRegistry,
        backend: Arc<dyn OperationBackend>,
        live_vus: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let globals = GlobalInstruments::register(registry)?;

        let mut table: Vec<Option<ResolvedOperation>> = vec![None; OperationKind::ALL.len()];
        for kind in profile.mix.kinds() {
            let name = kind.as_str();
            let resolved = ResolvedOperation {
                kind,
                timeout: profile.operation_profile(kind).timeout,
                duration: registry.trend(&format!("{}_duration", name))?,
                success: registry.rate(&format!("{}_success", name))?,
                count: registry.counter(&format!("{}_count", name))?,
            };
            table[kind.index()] = Some(resolved);
        }

        let seed = match profile.backend {
            BackendConfig::Simulated { seed, .. } => seed,
            BackendConfig::Tcp { .. } => None,
        };

        debug!(
            "Executor resolved {} operation kinds using the {} backend",
            profile.mix.kinds().len(),
            backend.name()
        );

        Ok(Self {
            backend,
            mix: profile.mix.clone(),
            table,
            globals,
            think_time: profile.think_time,
            operations_per_iteration: profile.operations_per_iteration,
            live_vus,
            seed,
        })
    }

    fn resolved(&self, kind: OperationKind) -> Result<&ResolvedOperation> {
        self.table
            .get(kind.index())
            .and_then(|r| r.as_ref())
            .with_context(|| format!("operation {} is not part of the workload mix", kind))
    }

    fn rng_for(&self, vu_id: u64) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ vu_id.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => StdRng::from_entropy(),
        }
    }

    /// The VU loop: iterate, record, think, until cancelled
    pub async fn run_vu(self: Arc<Self>, vu_id: u64, control: Arc<VuControl>) -> VuSummary {
        let mut rng = self.rng_for(vu_id);
        let mut summary = VuSummary {
            vu_id,
            ..VuSummary::default()
        };
        let mut step = 0u64;

        debug!("VU {} started", vu_id);

        while !control.is_cancelled() {
            let ctx = LoadContext {
                vu_id,
                iteration: summary.iterations,
                live_vus: self.live_vus.load(Ordering::Relaxed),
            };
            let iteration = self.run_iteration(ctx, &mut step, &mut rng).await;
            self.record(&iteration);
            control.completed.fetch_add(1, Ordering::Release);
            summary.iterations += 1;
            summary.operations += iteration.outcomes.len() as u64;

            if control.is_cancelled() {
                break;
            }

            let pause = self.think_time.sample(&mut rng);
            if pause.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = control.wake.notified() => {}
                }
            }
        }

        debug!(
            "VU {} exiting after {} iterations",
            vu_id, summary.iterations
        );
        summary
    }

    /// Execute one iteration without recording it
    pub async fn run_iteration(
        &self,
        ctx: LoadContext,
        step: &mut u64,
        rng: &mut StdRng,
    ) -> Iteration {
        let start = Instant::now();
        let mut outcomes = Vec::with_capacity(self.operations_per_iteration);
        let mut ended_early = false;

        for _ in 0..self.operations_per_iteration {
            let kind = self.mix.select(*step, rng);
            *step = step.wrapping_add(1);

            let op = match self.resolved(kind) {
                Ok(op) => op,
                Err(e) => {
                    debug!("VU {} skipped selection: {:#}", ctx.vu_id, e);
                    continue;
                }
            };

            let outcome = self.run_operation(op, &ctx).await;
            outcomes.push(outcome);
            if outcome.error_class == ErrorClass::Connection {
                ended_early = true;
                break;
            }
        }

        Iteration {
            outcomes,
            duration_ms: millis(start.elapsed()),
            ended_early,
        }
    }

    async fn run_operation(&self, op: &ResolvedOperation, ctx: &LoadContext) -> Outcome {
        let start = Instant::now();
        let result = timeout(op.timeout, self.backend.execute(op.kind, ctx)).await;
        let measured_ms = millis(start.elapsed());
        classify(op.kind, result.ok(), measured_ms, op.timeout)
    }

    /// Write a completed iteration into the instruments
    pub fn record(&self, iteration: &Iteration) {
        for outcome in &iteration.outcomes {
            if let Ok(op) = self.resolved(outcome.kind) {
                op.duration.add(outcome.duration_ms);
                op.success.add(outcome.success);
                op.count.inc();
            }
            self.globals.operation_duration.add(outcome.duration_ms);
            self.globals.operation_success.add(outcome.success);
            self.globals.operations.inc();
            if let Some(counter) = self.globals.error_counter(outcome.error_class) {
                counter.inc();
                trace!("{} failed: {:?}", outcome.kind, outcome.error_class);
            }
        }
        self.globals.iterations.inc();
        self.globals.iteration_duration.add(iteration.duration_ms);
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

/// Turn a backend result into an outcome
///
/// `result` is `None` when the operation hit the hard timeout. A reported
/// duration above the ceiling is also a timeout, even when the backend called
/// it a success.
pub fn classify(
    kind: OperationKind,
    result: Option<Result<OperationReport, BackendError>>,
    measured_ms: f64,
    ceiling: Duration,
) -> Outcome {
    let ceiling_ms = millis(ceiling);
    let failed = |duration_ms: f64, error_class: ErrorClass| Outcome {
        kind,
        duration_ms,
        success: false,
        error_class,
    };

    match result {
        None => failed(ceiling_ms.max(measured_ms), ErrorClass::Timeout),
        Some(Err(BackendError::Unavailable(_))) => failed(measured_ms, ErrorClass::Connection),
        Some(Ok(report)) => {
            let duration_ms = report.virtual_duration_ms.unwrap_or(measured_ms);
            if duration_ms > ceiling_ms {
                failed(duration_ms, ErrorClass::Timeout)
            } else if report.success {
                Outcome {
                    kind,
                    duration_ms,
                    success: true,
                    error_class: ErrorClass::None,
                }
            } else {
                let class = match report.error_class {
                    ErrorClass::None => ErrorClass::Query,
                    other => other,
                };
                failed(duration_ms, class)
            }
        }
    }
}
