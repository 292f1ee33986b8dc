//! # Run Controller
//!
//! Orchestrates a single run from a validated [`RunProfile`]: instrument
//! registration, backend and executor construction, exporter lifecycle, the
//! stage scheduler, the overall run timeout and the final threshold verdict.
//!
//! Every configuration or wiring fault is returned as an error before the
//! first VU is spawned. Once scheduling starts, `run` always produces a
//! [`RunReport`].

use crate::backend::{create_backend, OperationBackend};
use crate::executor::Executor;
use crate::exporter::{ExportStats, Exporter};
use crate::metrics::MetricsRegistry;
use crate::profile::RunProfile;
use crate::results::{MetricSummary, RunMetadata, RunReport, SystemInfo};
use crate::scheduler::Scheduler;
use crate::threshold::{all_passed, ThresholdEvaluator};
use crate::utils::generate_run_id;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Requests an early, graceful end of a run
///
/// Stopping takes the same drain path as the end of the last stage. Calling
/// `stop` more than once, or after the run finished, has no further effect.
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Runs one load test
pub struct RunController {
    profile: RunProfile,
    registry: Arc<MetricsRegistry>,
    backend: Option<Arc<dyn OperationBackend>>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    run_id: String,
}

impl RunController {
    pub fn new(profile: RunProfile) -> Result<Self> {
        profile.validate().context("Invalid run profile")?;
        let registry = Arc::new(MetricsRegistry::new(profile.sampling));
        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Self {
            profile,
            registry,
            backend: None,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            run_id: generate_run_id(),
        })
    }

    /// Use this backend instead of the one the profile describes
    pub fn with_backend(mut self, backend: Arc<dyn OperationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    pub fn registry(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn profile(&self) -> &RunProfile {
        &self.profile
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Execute the run to completion
    pub async fn run(self) -> Result<RunReport> {
        let RunController {
            profile,
            registry,
            backend,
            stop_tx,
            stop_rx,
            run_id,
        } = self;
        let started_at = Utc::now();

        info!(
            "Run {} ({}): {} stages, peak {} VUs, {:?} planned",
            run_id,
            profile.name,
            profile.stages.len(),
            profile.peak_target(),
            profile.total_duration()
        );

        let backend = match backend {
            Some(backend) => backend,
            None => create_backend(&profile)?,
        };
        let live_vus = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(
            Executor::new(&profile, &registry, backend, Arc::clone(&live_vus))
                .context("Failed to build the workload executor")?,
        );
        let scheduler = Scheduler::new(&profile, &registry, executor, live_vus)
            .context("Failed to build the stage scheduler")?;

        let evaluator = ThresholdEvaluator::new(profile.thresholds.clone());
        evaluator
            .validate(&registry)
            .context("Threshold does not match a registered metric")?;
        debug!(
            "{} instruments registered, {} thresholds",
            registry.len(),
            evaluator.thresholds().len()
        );

        let exporter = if profile.export.is_enabled() {
            let exporter = Exporter::new(Arc::clone(&registry), profile.export.clone())?;
            Some(exporter.start().await?)
        } else {
            None
        };

        let timer = profile.max_duration.map(|limit| {
            let stop = StopHandle {
                tx: Arc::clone(&stop_tx),
            };
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                if !stop.is_stopped() {
                    warn!("Run timeout of {:?} reached, draining", limit);
                    stop.stop();
                }
            })
        });

        let scheduler_report = scheduler.run(stop_rx).await;
        if let Some(timer) = timer {
            timer.abort();
        }

        let export = match exporter {
            Some(handle) => handle.shutdown().await,
            None => ExportStats::default(),
        };

        let thresholds = evaluator.evaluate(&registry);
        let passed = all_passed(&thresholds);
        let metrics = registry
            .snapshot()
            .iter()
            .map(MetricSummary::from_snapshot)
            .collect();

        info!(
            "Run {} finished in {:?}: {}",
            run_id,
            scheduler_report.elapsed,
            if passed { "passed" } else { "failed" }
        );

        Ok(RunReport {
            passed,
            metadata: RunMetadata {
                run_id,
                profile: profile.name.clone(),
                started_at,
                finished_at: Utc::now(),
                stages: profile.stages.clone(),
                system_info: SystemInfo::default(),
            },
            thresholds,
            metrics,
            scheduler: scheduler_report,
            export,
        })
    }
}
