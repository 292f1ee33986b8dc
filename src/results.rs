//! # Run Results
//!
//! The externally observable outcome of a run: overall pass/fail, the
//! per-threshold breakdown, final summaries of every instrument, what the
//! scheduler and exporter did, and metadata for reproducibility.
//!
//! [`ResultsManager`] writes the report as pretty JSON; [`RunReport::print_summary`]
//! renders it for a terminal.

use crate::exporter::ExportStats;
use crate::metrics::{MetricKind, MetricSnapshot, MetricValue};
use crate::profile::Stage;
use crate::scheduler::SchedulerReport;
use crate::threshold::ThresholdResult;
use crate::utils::{format_latency_ms, format_percent, format_throughput, table_row, table_separator};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Final aggregate of one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub name: String,
    pub kind: MetricKind,
    /// Counter value, rate observations or trend observations
    pub count: u64,
    /// Counter value, gauge value or rate ratio
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub min: Option<f64>,
    /// Trend maximum or gauge peak
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub avg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub p50: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub p90: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub p95: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub p99: Option<f64>,
}

impl MetricSummary {
    pub fn from_snapshot(snapshot: &MetricSnapshot) -> Self {
        let mut summary = MetricSummary {
            name: snapshot.name.clone(),
            kind: snapshot.value.kind(),
            count: 0,
            value: None,
            min: None,
            max: None,
            avg: None,
            p50: None,
            p90: None,
            p95: None,
            p99: None,
        };

        match &snapshot.value {
            MetricValue::Counter { value } => {
                summary.count = *value;
                summary.value = Some(*value as f64);
            }
            MetricValue::Gauge { value, max } => {
                summary.value = Some(*value as f64);
                summary.max = Some(*max as f64);
            }
            MetricValue::Rate { total, .. } => {
                summary.count = *total;
                summary.value = snapshot.value.rate();
            }
            MetricValue::Trend(trend) => {
                summary.count = trend.count;
                summary.min = trend.min;
                summary.max = trend.max;
                summary.avg = trend.mean();
                summary.p50 = trend.median();
                summary.p90 = trend.percentile(90.0);
                summary.p95 = trend.percentile(95.0);
                summary.p99 = trend.percentile(99.0);
            }
        }
        summary
    }
}

/// Host details recorded with every report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub rust_version: String,
    pub tool_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: crate::utils::get_cpu_cores(),
            rust_version: option_env!("CARGO_PKG_RUST_VERSION")
                .unwrap_or("unknown")
                .to_string(),
            tool_version: crate::VERSION.to_string(),
        }
    }
}

/// Identification of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub profile: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<Stage>,
    pub system_info: SystemInfo,
}

/// Everything a caller needs to know about a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// True when every threshold passed
    pub passed: bool,
    pub metadata: RunMetadata,
    /// In evaluation order
    pub thresholds: Vec<ThresholdResult>,
    /// Ordered by metric name
    pub metrics: Vec<MetricSummary>,
    pub scheduler: SchedulerReport,
    pub export: ExportStats,
}

impl RunReport {
    pub fn metric(&self, name: &str) -> Option<&MetricSummary> {
        self.metrics.iter().find(|m| m.name == name)
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.thresholds.iter().filter(|t| !t.passed)
    }

    /// Operations per second over the whole run
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.scheduler.elapsed.as_secs_f64();
        let ops = self.metric("operations")?.count;
        (secs > 0.0).then(|| ops as f64 / secs)
    }

    /// Print a human-readable summary to stdout
    pub fn print_summary(&self) {
        println!();
        println!(
            "{} {} ({})",
            "Run".bold(),
            self.metadata.profile.bold(),
            self.metadata.run_id
        );
        println!(
            "  duration {:.1}s, peak {} VUs, {} VUs spawned, {} iterations",
            self.scheduler.elapsed.as_secs_f64(),
            self.scheduler.peak_vus,
            self.scheduler.vus_spawned,
            self.scheduler.completed_iterations
        );
        if let Some(ops) = self.throughput() {
            println!("  throughput {}", format_throughput(ops));
        }
        if self.scheduler.stopped_early {
            println!("  {}", "stopped before the last stage completed".yellow());
        }
        if self.scheduler.forced_stops > 0 {
            println!(
                "  {}",
                format!("{} VUs aborted after the grace period", self.scheduler.forced_stops)
                    .yellow()
            );
        }

        let widths = [28, 10, 10, 10, 10, 10, 10];
        println!();
        println!(
            "{}",
            table_row(&["metric", "count", "value", "p50", "p95", "p99", "max"], &widths)
        );
        println!("{}", table_separator(&widths));
        for m in &self.metrics {
            let value = match m.kind {
                MetricKind::Rate => m.value.map(format_percent).unwrap_or_else(|| "-".into()),
                MetricKind::Trend => format_latency_ms(m.avg),
                _ => m
                    .value
                    .map(|v| format!("{}", v))
                    .unwrap_or_else(|| "-".into()),
            };
            let (p50, p95, p99, max) = match m.kind {
                MetricKind::Trend => (
                    format_latency_ms(m.p50),
                    format_latency_ms(m.p95),
                    format_latency_ms(m.p99),
                    format_latency_ms(m.max),
                ),
                MetricKind::Gauge => (
                    "-".into(),
                    "-".into(),
                    "-".into(),
                    m.max.map(|v| format!("{}", v)).unwrap_or_else(|| "-".into()),
                ),
                _ => ("-".into(), "-".into(), "-".into(), "-".into()),
            };
            println!(
                "{}",
                table_row(
                    &[&m.name, &m.count.to_string(), &value, &p50, &p95, &p99, &max],
                    &widths
                )
            );
        }

        if !self.thresholds.is_empty() {
            println!();
            println!("{}", "Thresholds".bold());
            for t in &self.thresholds {
                let observed = t
                    .observed
                    .map(|o| format!("{:.4}", o))
                    .unwrap_or_else(|| "no data".to_string());
                let mark = if t.passed { "PASS".green() } else { "FAIL".red() };
                println!("  {} {} (observed {})", mark, t.name, observed);
            }
        }

        println!();
        if self.passed {
            println!("{}", "Run PASSED".green().bold());
        } else {
            println!("{}", "Run FAILED".red().bold());
        }
    }
}

/// Writes run reports to disk
pub struct ResultsManager {
    output_file: PathBuf,
}

impl ResultsManager {
    pub fn new(output_file: &Path) -> Result<Self> {
        if output_file.as_os_str().is_empty() {
            anyhow::bail!("Output file path cannot be empty");
        }
        Ok(Self {
            output_file: output_file.to_path_buf(),
        })
    }

    /// Write the report as pretty JSON, creating parent directories
    pub fn write(&self, report: &RunReport) -> Result<()> {
        if let Some(parent) = self.output_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&self.output_file, json)
            .with_context(|| format!("Failed to write {}", self.output_file.display()))?;
        info!("Results written to: {:?}", self.output_file);
        Ok(())
    }

    /// Read a previously written report
    pub fn load(path: &Path) -> Result<RunReport> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid report {}", path.display()))
    }
}
