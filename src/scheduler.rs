//! # Stage Scheduler
//!
//! Grows and shrinks the pool of virtual users so the live count tracks the
//! stage profile over time.
//!
//! ## State Machine
//!
//! ```text
//! Idle ──▶ Ramping(0) ──▶ Ramping(1) ──▶ … ──▶ Draining ──▶ Stopped
//!                 └──────────── stop request ────────▲
//! ```
//!
//! On every control tick the scheduler computes the desired concurrency with
//! [`StageTimeline::desired_at`], spawns VUs when it is above the live count
//! and marks the oldest VUs for cooperative cancellation when it is below.
//! Marked VUs finish their in-flight iteration before exiting.
//!
//! After the last stage, or when a stop is requested, every VU is marked and
//! the scheduler waits up to the grace period for them to exit. VUs still
//! running after that are aborted; their unfinished iterations are never
//! recorded.

use crate::executor::{Executor, VuControl, VuSummary};
use crate::metrics::{Gauge, MetricsRegistry};
use crate::profile::{RunProfile, Stage};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Lifecycle of the scheduler, published on a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Ramping(usize),
    Draining,
    Stopped,
}

/// Stage boundaries precomputed from the cumulative durations
#[derive(Debug, Clone)]
pub struct StageTimeline {
    stages: Vec<Stage>,
    /// Offset from run start at which each stage ends
    ends: Vec<Duration>,
}

impl StageTimeline {
    pub fn new(stages: &[Stage]) -> Self {
        let ends = stages
            .iter()
            .scan(Duration::ZERO, |acc, stage| {
                *acc += stage.duration;
                Some(*acc)
            })
            .collect();
        Self {
            stages: stages.to_vec(),
            ends,
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn total(&self) -> Duration {
        self.ends.last().copied().unwrap_or(Duration::ZERO)
    }

    /// Offset from run start at which stage `index` begins
    pub fn start_of(&self, index: usize) -> Duration {
        match index {
            0 => Duration::ZERO,
            i => self.ends.get(i - 1).copied().unwrap_or_else(|| self.total()),
        }
    }

    /// Stage in progress at `elapsed`, `None` once the profile is complete
    ///
    /// Zero-duration stages are never "in progress"; they are passed over
    /// and only contribute their target to the stage that follows.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        self.ends.iter().position(|end| elapsed < *end)
    }

    /// Target concurrency at `elapsed`
    ///
    /// Linear interpolation from the previous stage's target (0 before the
    /// first stage) to the current one, rounded to the nearest integer. Past
    /// the end of the profile this is the final target.
    pub fn desired_at(&self, elapsed: Duration) -> u32 {
        let Some(index) = self.stage_index_at(elapsed) else {
            return self.stages.last().map(|s| s.target).unwrap_or(0);
        };
        let stage = self.stages[index];
        let from = if index == 0 {
            0.0
        } else {
            self.stages[index - 1].target as f64
        };
        let to = stage.target as f64;

        // stage_index_at never returns a zero-duration stage.
        let into_stage = elapsed.saturating_sub(self.start_of(index));
        let progress = (into_stage.as_secs_f64() / stage.duration.as_secs_f64()).clamp(0.0, 1.0);
        let desired = from + (to - from) * progress;
        desired.round().max(0.0) as u32
    }
}

/// One control-tick sample of the pool size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracePoint {
    pub elapsed_ms: u64,
    pub desired: u32,
    pub live: usize,
}

/// What the scheduler did over a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerReport {
    pub stages_total: usize,
    pub stages_started: usize,
    pub peak_vus: usize,
    pub vus_spawned: u64,
    /// VUs aborted because they outlived the grace period
    pub forced_stops: usize,
    /// Whether a stop request ended the run before the last stage finished
    pub stopped_early: bool,
    /// Iterations completed by VUs that exited cleanly
    pub completed_iterations: u64,
    #[serde(with = "crate::profile::duration_serde")]
    pub elapsed: Duration,
    /// Most recent control ticks, oldest first
    pub trace: Vec<TracePoint>,
}

struct LiveVu {
    id: u64,
    control: Arc<VuControl>,
    handle: JoinHandle<VuSummary>,
}

/// Drives the VU pool through a profile's stages
pub struct Scheduler {
    timeline: StageTimeline,
    tick: Duration,
    grace: Duration,
    executor: Arc<Executor>,
    live_vus: Arc<AtomicUsize>,
    vus: Arc<Gauge>,
    vus_max: Arc<Gauge>,
    state: watch::Sender<SchedulerState>,
    trace_capacity: usize,
}

impl Scheduler {
    pub fn new(
        profile: &RunProfile,
        registry: &MetricsRegistry,
        executor: Arc<Executor>,
        live_vus: Arc<AtomicUsize>,
    ) -> Result<Self> {
        let vus = registry.gauge("vus")?;
        let vus_max = registry.gauge("vus_max")?;
        vus_max.set(i64::from(profile.peak_target()));
        let (state, _) = watch::channel(SchedulerState::Idle);

        Ok(Self {
            timeline: StageTimeline::new(&profile.stages),
            tick: profile.tick,
            grace: profile.grace,
            executor,
            live_vus,
            vus,
            vus_max,
            state,
            trace_capacity: crate::defaults::TRACE_CAPACITY,
        })
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }

    /// Run every stage, then drain
    ///
    /// `stop` flipping to `true` ends the stages early and goes straight to
    /// draining.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> SchedulerReport {
        let start = Instant::now();
        let mut pool: VecDeque<LiveVu> = VecDeque::new();
        let mut retiring: Vec<LiveVu> = Vec::new();
        let mut trace: VecDeque<TracePoint> = VecDeque::new();
        let mut next_id: u64 = 1;
        let mut peak = 0usize;
        let mut completed_iterations = 0u64;
        let mut current_stage: Option<usize> = None;
        let mut stopped_early = false;
        let mut stop_open = true;

        info!(
            "Scheduler starting: {} stages over {:?}, tick {:?}",
            self.timeline.len(),
            self.timeline.total(),
            self.tick
        );

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed(), if stop_open => {
                    if changed.is_err() {
                        stop_open = false;
                    }
                }
            }

            let elapsed = start.elapsed();
            if *stop.borrow() {
                stopped_early = elapsed < self.timeline.total();
                info!("Stop requested at {:?}", elapsed);
                break;
            }

            let Some(index) = self.timeline.stage_index_at(elapsed) else {
                break;
            };
            if current_stage != Some(index) {
                info!(
                    "Stage {}/{} started at {:?}: target {}",
                    index + 1,
                    self.timeline.len(),
                    elapsed,
                    self.timeline.stages[index].target
                );
                current_stage = Some(index);
                self.set_state(SchedulerState::Ramping(index));
            }

            // VUs only exit when told to; one that finished on its own died.
            let (alive, exited): (VecDeque<LiveVu>, VecDeque<LiveVu>) =
                pool.drain(..).partition(|vu| !vu.handle.is_finished());
            pool = alive;
            for vu in exited {
                warn!("VU {} exited unexpectedly", vu.id);
                retiring.push(vu);
            }

            let desired = self.timeline.desired_at(elapsed) as usize;
            while pool.len() < desired {
                let control = Arc::new(VuControl::new());
                let handle = tokio::spawn(self.executor.clone().run_vu(next_id, control.clone()));
                debug!("Spawned VU {}", next_id);
                pool.push_back(LiveVu {
                    id: next_id,
                    control,
                    handle,
                });
                next_id += 1;
            }
            while pool.len() > desired {
                if let Some(vu) = pool.pop_front() {
                    debug!("Retiring VU {}", vu.id);
                    vu.control.cancel();
                    retiring.push(vu);
                }
            }

            let live = pool.len();
            peak = peak.max(live);
            self.publish_live(live);

            if trace.len() == self.trace_capacity {
                trace.pop_front();
            }
            trace.push_back(TracePoint {
                elapsed_ms: elapsed.as_millis() as u64,
                desired: desired as u32,
                live,
            });

            completed_iterations += reap_finished(&mut retiring).await;
        }

        self.set_state(SchedulerState::Draining);
        info!("Draining {} VUs (grace {:?})", pool.len(), self.grace);
        for vu in pool.drain(..) {
            vu.control.cancel();
            retiring.push(vu);
        }
        self.publish_live(0);

        let deadline = Instant::now() + self.grace;
        let mut forced_stops = 0usize;
        for mut vu in retiring {
            match timeout_at(deadline, &mut vu.handle).await {
                Ok(Ok(summary)) => completed_iterations += summary.iterations,
                Ok(Err(e)) => {
                    warn!("VU {} task failed: {}", vu.id, e);
                    completed_iterations += vu.control.completed();
                }
                Err(_) => {
                    vu.handle.abort();
                    // Wait for the abort so no record is in flight once stopped.
                    let _ = (&mut vu.handle).await;
                    completed_iterations += vu.control.completed();
                    forced_stops += 1;
                }
            }
        }
        if forced_stops > 0 {
            warn!(
                "{} VUs did not finish within the {:?} grace period and were aborted",
                forced_stops, self.grace
            );
        }

        self.set_state(SchedulerState::Stopped);
        let elapsed = start.elapsed();
        info!(
            "Scheduler stopped after {:?}: peak {} VUs, {} spawned",
            elapsed,
            peak,
            next_id - 1
        );

        SchedulerReport {
            stages_total: self.timeline.len(),
            stages_started: current_stage.map(|i| i + 1).unwrap_or(0),
            peak_vus: peak,
            vus_spawned: next_id - 1,
            forced_stops,
            stopped_early,
            completed_iterations,
            elapsed,
            trace: trace.into_iter().collect(),
        }
    }

    fn publish_live(&self, live: usize) {
        self.live_vus.store(live, Ordering::Relaxed);
        self.vus.set(live as i64);
        if live as i64 > self.vus_max.value() {
            self.vus_max.set(live as i64);
        }
    }
}

/// Collect summaries from retired VUs that have already exited
async fn reap_finished(retiring: &mut Vec<LiveVu>) -> u64 {
    let mut iterations = 0;
    let mut pending = Vec::with_capacity(retiring.len());
    for vu in retiring.drain(..) {
        if vu.handle.is_finished() {
            match vu.handle.await {
                Ok(summary) => iterations += summary.iterations,
                Err(e) => {
                    warn!("VU {} task failed: {}", vu.id, e);
                    iterations += vu.control.completed();
                }
            }
        } else {
            pending.push(vu);
        }
    }
    *retiring = pending;
    iterations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SimulatedBackend, SimulationMode};
    use crate::workload::{LatencyDistribution, OperationKind, OperationProfile, ThinkTime, WorkloadMix};

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn ms(m: u64) -> Duration {
        Duration::from_millis(m)
    }

    #[test]
    fn test_timeline_interpolates_linearly() {
        let timeline = StageTimeline::new(&[Stage::new(secs(30), 5), Stage::new(secs(30), 0)]);
        assert_eq!(timeline.total(), secs(60));
        assert_eq!(timeline.desired_at(Duration::ZERO), 0);
        assert_eq!(timeline.desired_at(secs(15)), 3); // 2.5 rounds up
        assert_eq!(timeline.desired_at(ms(29_900)), 5);
        assert_eq!(timeline.desired_at(secs(30)), 5);
        assert_eq!(timeline.desired_at(secs(45)), 3);
        assert_eq!(timeline.desired_at(ms(59_900)), 0);
        assert_eq!(timeline.desired_at(secs(90)), 0);
        assert_eq!(timeline.stage_index_at(secs(30)), Some(1));
        assert_eq!(timeline.stage_index_at(secs(60)), None);
    }

    #[test]
    fn test_timeline_reaches_each_target_before_its_boundary() {
        let stages = [
            Stage::new(secs(10), 20),
            Stage::new(secs(5), 20),
            Stage::new(secs(20), 3),
            Stage::new(secs(7), 9),
        ];
        let timeline = StageTimeline::new(&stages);
        for (i, stage) in stages.iter().enumerate() {
            let end = timeline.start_of(i) + stage.duration;
            let before = timeline.desired_at(end - ms(100)) as i64;
            assert!((before - stage.target as i64).abs() <= 1, "stage {}", i);
        }
    }

    #[test]
    fn test_zero_duration_stage_jumps() {
        let timeline = StageTimeline::new(&[
            Stage::new(secs(10), 5),
            Stage::new(Duration::ZERO, 50),
            Stage::new(secs(10), 50),
        ]);
        assert_eq!(timeline.desired_at(ms(9_900)), 5);
        assert_eq!(timeline.desired_at(secs(10)), 50);
        assert_eq!(timeline.stage_index_at(secs(10)), Some(2));
    }

    #[test]
    fn test_zero_duration_first_stage() {
        let timeline = StageTimeline::new(&[Stage::new(Duration::ZERO, 8), Stage::new(secs(4), 0)]);
        assert_eq!(timeline.desired_at(Duration::ZERO), 8);
        assert_eq!(timeline.desired_at(secs(2)), 4);
    }

    fn scheduler_for(
        stages: Vec<Stage>,
        latency_ms: f64,
        grace: Duration,
    ) -> (Scheduler, Arc<MetricsRegistry>) {
        let registry = Arc::new(MetricsRegistry::default());
        let kind = OperationKind::UserLookup;
        let mut profile = RunProfile::new(stages);
        profile.mix = WorkloadMix::single(kind);
        profile.operations.insert(
            kind,
            OperationProfile {
                latency: LatencyDistribution::Fixed { ms: latency_ms },
                timeout: secs(3_600),
                ..OperationProfile::default()
            },
        );
        profile.think_time = ThinkTime::None;
        profile.grace = grace;

        let live = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(SimulatedBackend::new(
            profile.operations.clone(),
            SimulationMode::Sleep,
            None,
        ));
        let executor = Arc::new(Executor::new(&profile, &registry, backend, live.clone()).unwrap());
        let scheduler = Scheduler::new(&profile, &registry, executor, live).unwrap();
        (scheduler, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_follows_the_ramp_and_drains() {
        let (scheduler, registry) =
            scheduler_for(vec![Stage::new(secs(1), 4), Stage::new(secs(1), 0)], 10.0, secs(5));
        let mut states = scheduler.subscribe();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let report = scheduler.run(stop_rx).await;

        assert_eq!(*states.borrow_and_update(), SchedulerState::Stopped);
        assert_eq!(report.stages_started, 2);
        assert_eq!(report.peak_vus, 4);
        assert_eq!(report.forced_stops, 0);
        assert!(!report.stopped_early);

        let at = |t: u64| report.trace.iter().find(|p| p.elapsed_ms == t).copied();
        assert_eq!(at(900).map(|p| p.live), Some(4));
        assert_eq!(at(1_000).map(|p| p.live), Some(4));
        assert_eq!(at(1_900).map(|p| p.live), Some(0));

        assert_eq!(registry.gauge("vus").unwrap().value(), 0);
        assert_eq!(registry.gauge("vus").unwrap().max(), 4);
        assert_eq!(
            registry.counter("iterations").unwrap().value(),
            report.completed_iterations
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_request_drains_early() {
        let (scheduler, _registry) =
            scheduler_for(vec![Stage::new(secs(10), 3), Stage::new(secs(10), 3)], 10.0, secs(5));
        let (stop_tx, stop_rx) = watch::channel(false);

        let run = tokio::spawn(scheduler.run(stop_rx));
        tokio::time::sleep(secs(4)).await;
        stop_tx.send_replace(true);
        let report = run.await.unwrap();

        assert!(report.stopped_early);
        assert_eq!(report.stages_started, 1);
        assert!(report.elapsed < secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_aborts_without_recording() {
        // Every operation takes far longer than the grace period.
        let (scheduler, registry) =
            scheduler_for(vec![Stage::new(Duration::ZERO, 3), Stage::new(ms(500), 3)], 60_000.0, secs(1));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let report = scheduler.run(stop_rx).await;

        assert_eq!(report.forced_stops, 3);
        assert_eq!(report.completed_iterations, 0);
        assert_eq!(registry.counter("operations").unwrap().value(), 0);
        assert_eq!(registry.counter("iterations").unwrap().value(), 0);
    }
}
