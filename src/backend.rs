//! # Operation Backends
//!
//! The executor never talks to a database directly. It hands each operation to
//! an [`OperationBackend`], which either simulates the operation from its
//! declarative [`OperationProfile`] or performs real network work against a
//! live endpoint.
//!
//! A backend reports ordinary failures (a query error, a timeout) inside
//! [`OperationReport`]. It returns [`BackendError::Unavailable`] only when no
//! operation could be attempted at all, e.g. the connection was refused.

use crate::error::BackendError;
use crate::profile::{BackendConfig, RunProfile};
use crate::workload::{ErrorClass, OperationKind, OperationProfile};
use anyhow::Result;
use async_trait::async_trait;
use clap::ValueEnum;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Per-call context handed to a backend
///
/// `live_vus` is the scheduler's current pool size; backends that model
/// degradation under load read it from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadContext {
    pub vu_id: u64,
    pub iteration: u64,
    pub live_vus: usize,
}

/// What a backend observed for one operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperationReport {
    pub success: bool,
    pub error_class: ErrorClass,
    /// Duration to record instead of the measured wall time
    pub virtual_duration_ms: Option<f64>,
}

impl OperationReport {
    pub fn success() -> Self {
        Self {
            success: true,
            error_class: ErrorClass::None,
            virtual_duration_ms: None,
        }
    }

    pub fn failure(error_class: ErrorClass) -> Self {
        Self {
            success: false,
            error_class,
            virtual_duration_ms: None,
        }
    }

    pub fn with_virtual_duration(mut self, ms: f64) -> Self {
        self.virtual_duration_ms = Some(ms);
        self
    }
}

/// The operation-execution collaborator
///
/// Implementations must be safe to call from every VU at once.
#[async_trait]
pub trait OperationBackend: Send + Sync {
    async fn execute(
        &self,
        kind: OperationKind,
        ctx: &LoadContext,
    ) -> Result<OperationReport, BackendError>;

    fn name(&self) -> &'static str;
}

/// How the simulated backend spends an operation's latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationMode {
    /// Wait on a timer for the sampled latency
    #[default]
    Sleep,
    /// Return at once and report the sampled latency
    Virtual,
}

/// One simulated call before any waiting happens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedCall {
    pub latency_ms: f64,
    pub error_class: ErrorClass,
}

/// Draw latency and outcome for one call at the given concurrency
pub fn simulate_call<R: Rng + ?Sized>(
    profile: &OperationProfile,
    live_vus: usize,
    rng: &mut R,
) -> SimulatedCall {
    let latency_ms = profile.latency_at(rng, live_vus);
    let succeeded = rng.gen_bool(profile.success_rate_at(live_vus));
    let error_class = if succeeded {
        ErrorClass::None
    } else {
        profile.error_weights.sample(rng)
    };

    // A timed-out call has, by definition, run for the whole ceiling.
    let latency_ms = match error_class {
        ErrorClass::Timeout => profile.timeout.as_secs_f64() * 1_000.0,
        _ => latency_ms,
    };

    SimulatedCall {
        latency_ms,
        error_class,
    }
}

/// In-process backend driven by per-kind operation profiles
pub struct SimulatedBackend {
    profiles: BTreeMap<OperationKind, OperationProfile>,
    mode: SimulationMode,
    seeded: Option<Mutex<StdRng>>,
}

impl SimulatedBackend {
    pub fn new(
        profiles: BTreeMap<OperationKind, OperationProfile>,
        mode: SimulationMode,
        seed: Option<u64>,
    ) -> Self {
        Self {
            profiles,
            mode,
            seeded: seed.map(|s| Mutex::new(StdRng::seed_from_u64(s))),
        }
    }

    fn profile(&self, kind: OperationKind) -> OperationProfile {
        self.profiles
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_profile())
    }

    fn draw(&self, profile: &OperationProfile, live_vus: usize) -> SimulatedCall {
        match &self.seeded {
            Some(rng) => simulate_call(profile, live_vus, &mut *rng.lock()),
            None => simulate_call(profile, live_vus, &mut rand::thread_rng()),
        }
    }
}

#[async_trait]
impl OperationBackend for SimulatedBackend {
    async fn execute(
        &self,
        kind: OperationKind,
        ctx: &LoadContext,
    ) -> Result<OperationReport, BackendError> {
        let profile = self.profile(kind);
        let call = self.draw(&profile, ctx.live_vus);

        if call.error_class == ErrorClass::Connection {
            return Err(BackendError::Unavailable(format!(
                "simulated connection failure for {}",
                kind
            )));
        }

        let report = if call.error_class == ErrorClass::None {
            OperationReport::success()
        } else {
            OperationReport::failure(call.error_class)
        };

        match self.mode {
            SimulationMode::Sleep => {
                let wait = Duration::try_from_secs_f64(call.latency_ms / 1_000.0)
                    .unwrap_or(profile.timeout);
                tokio::time::sleep(wait).await;
                Ok(report)
            }
            SimulationMode::Virtual => Ok(report.with_virtual_duration(call.latency_ms)),
        }
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

/// Backend that opens a TCP connection to the database endpoint per operation
///
/// No database protocol is spoken; the connect handshake is the measured
/// operation.
pub struct TcpConnectBackend {
    address: String,
    connect_timeout: Duration,
}

impl TcpConnectBackend {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl OperationBackend for TcpConnectBackend {
    async fn execute(
        &self,
        kind: OperationKind,
        ctx: &LoadContext,
    ) -> Result<OperationReport, BackendError> {
        match timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("VU {} could not set TCP_NODELAY: {}", ctx.vu_id, e);
                }
                Ok(OperationReport::success())
            }
            Ok(Err(e)) => {
                debug!("VU {} {} connect to {} failed: {}", ctx.vu_id, kind, self.address, e);
                Err(BackendError::Unavailable(format!("{}: {}", self.address, e)))
            }
            Err(_) => Ok(OperationReport::failure(ErrorClass::Timeout)),
        }
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Build the backend a profile asks for
pub fn create_backend(profile: &RunProfile) -> Result<Arc<dyn OperationBackend>> {
    let backend: Arc<dyn OperationBackend> = match &profile.backend {
        BackendConfig::Simulated { mode, seed } => Arc::new(SimulatedBackend::new(
            profile.operations.clone(),
            *mode,
            *seed,
        )),
        BackendConfig::Tcp {
            address,
            connect_timeout,
        } => {
            if address.trim().is_empty() {
                anyhow::bail!("TCP backend requires a non-empty address");
            }
            Arc::new(TcpConnectBackend::new(
                address.clone(),
                connect_timeout
                    .map(|t| t.0)
                    .unwrap_or(crate::defaults::OPERATION_TIMEOUT),
            ))
        }
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{Degradation, ErrorWeights, LatencyDistribution};

    fn ctx(live_vus: usize) -> LoadContext {
        LoadContext {
            vu_id: 1,
            iteration: 0,
            live_vus,
        }
    }

    fn profiles(profile: OperationProfile) -> BTreeMap<OperationKind, OperationProfile> {
        OperationKind::ALL.iter().map(|k| (*k, profile)).collect()
    }

    #[test]
    fn test_simulate_call_always_succeeds_at_rate_one() {
        let profile = OperationProfile {
            latency: LatencyDistribution::Fixed { ms: 10.0 },
            base_success_rate: 1.0,
            ..OperationProfile::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1_000 {
            let call = simulate_call(&profile, 5, &mut rng);
            assert_eq!(call.error_class, ErrorClass::None);
            assert_eq!(call.latency_ms, 10.0);
        }
    }

    #[test]
    fn test_simulate_call_degrades_with_concurrency() {
        let profile = OperationProfile {
            latency: LatencyDistribution::Fixed { ms: 10.0 },
            base_success_rate: 1.0,
            error_weights: ErrorWeights {
                connection: 0.0,
                query: 1.0,
                timeout: 0.0,
            },
            degradation: Degradation {
                success_drop_per_vu: 0.01,
                latency_ms_per_vu: 1.0,
            },
            ..OperationProfile::default()
        };
        let mut rng = StdRng::seed_from_u64(2);
        let failures = (0..10_000)
            .filter(|_| simulate_call(&profile, 50, &mut rng).error_class == ErrorClass::Query)
            .count();
        let share = failures as f64 / 10_000.0;
        assert!((0.45..0.55).contains(&share), "failure share {}", share);
        assert_eq!(simulate_call(&profile, 50, &mut rng).latency_ms, 60.0);
    }

    #[test]
    fn test_simulated_timeout_reports_the_ceiling() {
        let profile = OperationProfile {
            base_success_rate: 0.0,
            error_weights: ErrorWeights {
                connection: 0.0,
                query: 0.0,
                timeout: 1.0,
            },
            timeout: Duration::from_millis(250),
            ..OperationProfile::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let call = simulate_call(&profile, 0, &mut rng);
        assert_eq!(call.error_class, ErrorClass::Timeout);
        assert_eq!(call.latency_ms, 250.0);
    }

    #[tokio::test]
    async fn test_virtual_mode_returns_immediately() {
        let backend = SimulatedBackend::new(
            profiles(OperationProfile {
                latency: LatencyDistribution::Fixed { ms: 40.0 },
                ..OperationProfile::default()
            }),
            SimulationMode::Virtual,
            Some(11),
        );
        let start = std::time::Instant::now();
        let report = backend
            .execute(OperationKind::UserLookup, &ctx(1))
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.virtual_duration_ms, Some(40.0));
        assert!(start.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_mode_waits_for_latency() {
        let backend = SimulatedBackend::new(
            profiles(OperationProfile {
                latency: LatencyDistribution::Fixed { ms: 25.0 },
                ..OperationProfile::default()
            }),
            SimulationMode::Sleep,
            None,
        );
        let start = tokio::time::Instant::now();
        let report = backend
            .execute(OperationKind::PlaceOrder, &ctx(1))
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.virtual_duration_ms, None);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_simulated_connection_failure_is_unavailable() {
        let backend = SimulatedBackend::new(
            profiles(OperationProfile {
                base_success_rate: 0.0,
                error_weights: ErrorWeights {
                    connection: 1.0,
                    query: 0.0,
                    timeout: 0.0,
                },
                ..OperationProfile::default()
            }),
            SimulationMode::Virtual,
            Some(5),
        );
        let result = backend.execute(OperationKind::UserLookup, &ctx(1)).await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_tcp_backend_success_and_refusal() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let backend = TcpConnectBackend::new(address, Duration::from_secs(2));
        let report = backend
            .execute(OperationKind::SessionTouch, &ctx(1))
            .await
            .unwrap();
        assert!(report.success);

        // Bind then drop to get a port nothing listens on.
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed_addr = closed.local_addr().unwrap().to_string();
        drop(closed);
        let refused = TcpConnectBackend::new(closed_addr, Duration::from_secs(2));
        let result = refused.execute(OperationKind::SessionTouch, &ctx(1)).await;
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
    }

    #[test]
    fn test_create_backend_from_profile() {
        use crate::profile::Stage;
        let mut profile = RunProfile::new(vec![Stage::new(Duration::from_secs(1), 1)]);
        assert_eq!(create_backend(&profile).unwrap().name(), "simulated");

        profile.backend = BackendConfig::Tcp {
            address: "127.0.0.1:5432".to_string(),
            connect_timeout: None,
        };
        assert_eq!(create_backend(&profile).unwrap().name(), "tcp");

        profile.backend = BackendConfig::Tcp {
            address: " ".to_string(),
            connect_timeout: None,
        };
        assert!(create_backend(&profile).is_err());
    }
}
