//! # Utility Functions
//!
//! Small helpers shared by the command line, the profile loader and the
//! console summary.
//!
//! - **Parsing**: human durations such as `30s`, `500ms`, `2m`, `1.5h`
//! - **Formatting**: durations, latencies and throughput for display
//! - **Display Helpers**: fixed-width table rows for the summary
//!
//! ```rust
//! use db_stress::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_latency_ms(Some(0.25)), "250.00us");
//! ```

use std::time::Duration;
use uuid::Uuid;

/// Generate a unique identifier for a run
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Parse a human-readable duration
///
/// Accepts `us`, `ms`, `s`, `m` and `h` suffixes with integer or fractional
/// values. A bare number is read as seconds. Negative values are rejected.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, nanos_per_unit) = if let Some(stripped) = s.strip_suffix("us") {
        (stripped, 1e3)
    } else if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 1e6)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1e9)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60e9)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3600e9)
    } else {
        (s, 1e9) // Default to seconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    if !num.is_finite() {
        return Err(format!("Duration must be finite: {}", s));
    }
    if num < 0.0 {
        return Err(format!("Duration cannot be negative: {}", s));
    }

    let nanos = (num * nanos_per_unit).round();
    if nanos >= u64::MAX as f64 {
        return Err(format!("Duration is too large: {}", s));
    }
    Ok(Duration::from_nanos(nanos as u64))
}

/// Format a duration with an adaptive unit
pub fn format_duration(duration: Duration) -> String {
    let ns = duration.as_nanos();

    if ns < 1_000 {
        format!("{}ns", ns)
    } else if ns < 1_000_000 {
        format!("{:.2}us", ns as f64 / 1_000.0)
    } else if ns < 1_000_000_000 {
        format!("{:.2}ms", ns as f64 / 1_000_000.0)
    } else {
        format!("{:.2}s", ns as f64 / 1_000_000_000.0)
    }
}

/// Format a latency given in milliseconds; `-` when absent
pub fn format_latency_ms(ms: Option<f64>) -> String {
    match ms {
        Some(ms) => match Duration::try_from_secs_f64(ms / 1_000.0) {
            Ok(d) => format_duration(d),
            Err(_) => format!("{:.2}ms", ms),
        },
        None => "-".to_string(),
    }
}

/// Format an operations-per-second figure
pub fn format_throughput(ops_per_second: f64) -> String {
    if ops_per_second >= 1_000_000.0 {
        format!("{:.2}M ops/s", ops_per_second / 1_000_000.0)
    } else if ops_per_second >= 1_000.0 {
        format!("{:.2}K ops/s", ops_per_second / 1_000.0)
    } else {
        format!("{:.2} ops/s", ops_per_second)
    }
}

/// Format a ratio in `[0, 1]` as a percentage
pub fn format_percent(ratio: f64) -> String {
    format!("{:.2}%", ratio * 100.0)
}

/// Number of logical CPU cores
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

/// Render one fixed-width table row
pub fn table_row(columns: &[&str], widths: &[usize]) -> String {
    let cells: Vec<String> = columns
        .iter()
        .zip(widths.iter())
        .map(|(col, width)| format!("{:<width$}", col, width = *width))
        .collect();
    format!("| {} |", cells.join(" | "))
}

/// Render a separator line matching [`table_row`]
pub fn table_separator(widths: &[usize]) -> String {
    let dashes: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    format!("|-{}-|", dashes.join("-|-"))
}
