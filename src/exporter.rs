//! # Metrics Exporter
//!
//! Periodically snapshots the registry and ships the result out of band from
//! the VU hot path. Three sinks can be combined:
//!
//! - **push**: `POST` of the text exposition to
//!   `{push_url}/metrics/job/{job}/instance/{instance}`. At most one attempt
//!   per period and never retried; if the previous push is still in flight
//!   the period is skipped.
//! - **pull**: an HTTP endpoint serving `GET /metrics` from a fresh snapshot.
//! - **file**: one JSON line per period with the metric summaries.
//!
//! Export failures are logged and counted; they never slow down or stop a
//! run.
//!
//! ## Exposition Format
//!
//! | Instrument | Exposed as                                       |
//! |------------|--------------------------------------------------|
//! | counter    | `counter`                                        |
//! | gauge      | `gauge`                                          |
//! | rate       | `gauge` holding the success ratio                |
//! | trend      | `histogram` with `_bucket{le=…}`, `_sum`, `_count` |

use crate::metrics::{MetricSnapshot, MetricValue, MetricsRegistry};
use crate::profile::ExportSettings;
use crate::results::MetricSummary;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Content type of the text exposition format
pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shortest request timeout used for pushes, however short the interval
const PUSH_TIMEOUT_FLOOR: std::time::Duration = std::time::Duration::from_secs(2);

/// Counters describing how exporting went
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportStats {
    pub attempts: u64,
    pub failures: u64,
    /// Periods skipped because the previous push had not finished
    pub skipped: u64,
    pub file_writes: u64,
    pub file_failures: u64,
}

/// Render snapshots as text exposition
pub fn render_exposition(
    snapshots: &[MetricSnapshot],
    prefix: &str,
    labels: &BTreeMap<String, String>,
) -> String {
    let base_labels = format_labels(labels, None);
    let mut out = String::new();

    for snapshot in snapshots {
        let name = format!("{}{}", prefix, snapshot.name);
        let kind = snapshot.value.kind();
        // Writing into a String cannot fail.
        let _ = match &snapshot.value {
            MetricValue::Counter { value } => {
                write_header(&mut out, &name, kind.as_str(), "counter");
                writeln!(out, "{}{} {}", name, base_labels, value)
            }
            MetricValue::Gauge { value, .. } => {
                write_header(&mut out, &name, kind.as_str(), "gauge");
                writeln!(out, "{}{} {}", name, base_labels, value)
            }
            MetricValue::Rate { .. } => {
                write_header(&mut out, &name, kind.as_str(), "gauge");
                writeln!(
                    out,
                    "{}{} {}",
                    name,
                    base_labels,
                    snapshot.value.rate().unwrap_or(0.0)
                )
            }
            MetricValue::Trend(trend) => {
                write_header(&mut out, &name, kind.as_str(), "histogram");
                for (le, count) in trend.cumulative_buckets(crate::defaults::HISTOGRAM_BUCKETS_MS) {
                    let bucket_labels = format_labels(labels, Some(&le.to_string()));
                    let _ = writeln!(out, "{}_bucket{} {}", name, bucket_labels, count);
                }
                let inf_labels = format_labels(labels, Some("+Inf"));
                let _ = writeln!(out, "{}_bucket{} {}", name, inf_labels, trend.count);
                let _ = writeln!(out, "{}_sum{} {}", name, base_labels, trend.sum);
                writeln!(out, "{}_count{} {}", name, base_labels, trend.count)
            }
        };
    }
    out
}

fn write_header(out: &mut String, name: &str, instrument: &str, exposed: &str) {
    let _ = writeln!(out, "# HELP {} db-stress {} metric", name, instrument);
    let _ = writeln!(out, "# TYPE {} {}", name, exposed);
}

fn format_labels(labels: &BTreeMap<String, String>, le: Option<&str>) -> String {
    let mut pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", sanitize_label_name(k), escape_label_value(v)))
        .collect();
    if let Some(le) = le {
        pairs.push(format!("le=\"{}\"", le));
    }
    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}

/// Replace characters not allowed in a label name with `_`
pub fn sanitize_label_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Push-gateway URL for a job/instance pair; both are percent-encoded as
/// single path segments
pub fn push_endpoint(base: &str, job: &str, instance: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(base)
        .with_context(|| format!("Invalid metrics push URL '{}'", base))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Metrics push URL '{}' cannot take a path", base))?
        .pop_if_empty()
        .extend(["metrics", "job", job, "instance", instance]);
    Ok(url.to_string())
}

/// One line of the file sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRecord {
    pub timestamp: DateTime<Utc>,
    pub metrics: Vec<MetricSummary>,
}

struct Shared {
    registry: Arc<MetricsRegistry>,
    settings: ExportSettings,
    client: reqwest::Client,
    push_endpoint: Option<String>,
    push_in_flight: AtomicBool,
    attempts: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
    file_writes: AtomicU64,
    file_failures: AtomicU64,
}

impl Shared {
    fn render(&self) -> String {
        render_exposition(
            &self.registry.snapshot(),
            &self.settings.prefix,
            &self.settings.labels,
        )
    }

    fn stats(&self) -> ExportStats {
        ExportStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            file_writes: self.file_writes.load(Ordering::Relaxed),
            file_failures: self.file_failures.load(Ordering::Relaxed),
        }
    }

    async fn push(&self, endpoint: &str, body: String) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let result = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)
            .body(body)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!("Pushed metrics to {}", endpoint);
            }
            Ok(response) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Metrics push to {} returned {}", endpoint, response.status());
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Metrics push to {} failed: {}", endpoint, e);
            }
        }
    }

    /// Fire-and-forget push for one period
    fn push_in_background(self: &Arc<Self>) {
        let Some(endpoint) = self.push_endpoint.clone() else {
            return;
        };
        if self.push_in_flight.swap(true, Ordering::AcqRel) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Previous metrics push still in flight, skipping this period");
            return;
        }
        let body = self.render();
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.push(&endpoint, body).await;
            shared.push_in_flight.store(false, Ordering::Release);
        });
    }

    async fn write_file(&self) {
        let Some(path) = &self.settings.file else {
            return;
        };
        let record = ExportRecord {
            timestamp: Utc::now(),
            metrics: self
                .registry
                .snapshot()
                .iter()
                .map(MetricSummary::from_snapshot)
                .collect(),
        };
        let result = async {
            let mut line = serde_json::to_string(&record)?;
            line.push('\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            anyhow::Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                self.file_writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.file_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Metrics file export failed: {:#}", e);
            }
        }
    }
}

async fn serve_metrics(State(shared): State<Arc<Shared>>) -> impl IntoResponse {
    ([(CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], shared.render())
}

/// Exporter configured for one run
pub struct Exporter {
    shared: Arc<Shared>,
}

impl Exporter {
    pub fn new(registry: Arc<MetricsRegistry>, settings: ExportSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.interval.max(PUSH_TIMEOUT_FLOOR))
            .build()
            .context("Failed to build HTTP client for metrics push")?;
        let push_endpoint = settings
            .push_url
            .as_deref()
            .map(|url| push_endpoint(url, &settings.job, &settings.instance))
            .transpose()?;

        Ok(Self {
            shared: Arc::new(Shared {
                registry,
                settings,
                client,
                push_endpoint,
                push_in_flight: AtomicBool::new(false),
                attempts: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                file_writes: AtomicU64::new(0),
                file_failures: AtomicU64::new(0),
            }),
        })
    }

    /// Current exposition text
    pub fn render(&self) -> String {
        self.shared.render()
    }

    /// Bind the pull endpoint (if any) and start the periodic task
    pub async fn start(self) -> Result<ExporterHandle> {
        let (server, server_stop, local_addr) = match self.shared.settings.listen {
            Some(addr) => {
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind metrics endpoint on {}", addr))?;
                let local_addr = listener.local_addr()?;
                let app = Router::new()
                    .route("/metrics", get(serve_metrics))
                    .with_state(Arc::clone(&self.shared));
                let (tx, rx) = oneshot::channel::<()>();
                let server = tokio::spawn(async move {
                    let result = axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            let _ = rx.await;
                        })
                        .await;
                    if let Err(e) = result {
                        warn!("Metrics endpoint stopped with error: {}", e);
                    }
                });
                info!("Serving metrics on http://{}/metrics", local_addr);
                (Some(server), Some(tx), Some(local_addr))
            }
            None => (None, None, None),
        };

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let periodic = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; nothing to export yet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        shared.push_in_background();
                        shared.write_file().await;
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });

        Ok(ExporterHandle {
            shared: self.shared,
            periodic,
            stop: stop_tx,
            server,
            server_stop,
            local_addr,
        })
    }
}

/// A running exporter
pub struct ExporterHandle {
    shared: Arc<Shared>,
    periodic: JoinHandle<()>,
    stop: oneshot::Sender<()>,
    server: Option<JoinHandle<()>>,
    server_stop: Option<oneshot::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl ExporterHandle {
    /// Address of the pull endpoint, if one is bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> ExportStats {
        self.shared.stats()
    }

    /// Stop the periodic task, run a final export and close the endpoint
    ///
    /// The final push is awaited so the backend sees end-of-run values.
    pub async fn shutdown(self) -> ExportStats {
        let _ = self.stop.send(());
        if let Err(e) = self.periodic.await {
            warn!("Metrics export task failed: {}", e);
        }

        if let Some(endpoint) = self.shared.push_endpoint.clone() {
            let body = self.shared.render();
            self.shared.push(&endpoint, body).await;
        }
        self.shared.write_file().await;

        if let Some(tx) = self.server_stop {
            let _ = tx.send(());
        }
        if let Some(server) = self.server {
            if let Err(e) = server.await {
                warn!("Metrics endpoint task failed: {}", e);
            }
        }

        let stats = self.shared.stats();
        info!(
            "Metrics export finished: {} pushes, {} failures, {} skipped, {} file writes, {} file failures",
            stats.attempts, stats.failures, stats.skipped, stats.file_writes, stats.file_failures
        );
        stats
    }
}
