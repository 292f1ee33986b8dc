use crate::backend::SimulationMode;
use crate::metrics::SamplingPolicy;
use crate::profile::{BackendConfig, HumanDuration, ProfileConfig, RunProfile, Stage};
use crate::threshold::Threshold;
use crate::utils::parse_duration;
use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// db-stress - staged load generator and pass/fail gate for database workloads
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Run profile (JSON); flags below override its values
    #[clap(short = 'p', long, help_heading = "Profile")]
    pub profile: Option<PathBuf>,

    /// Name recorded in the report
    #[clap(long, help_heading = "Profile")]
    pub name: Option<String>,

    /// Stage as <duration>:<target>, e.g. 30s:5; repeat for more stages.
    /// Replaces the profile's stages.
    #[clap(short = 's', long = "stage", help_heading = "Profile")]
    pub stages: Vec<Stage>,

    /// Threshold as <metric>:<expression>, e.g. 'operation_success:rate>0.95';
    /// appended to the profile's thresholds
    #[clap(short = 't', long = "threshold", help_heading = "Profile")]
    pub thresholds: Vec<String>,

    /// Hard cap on the run, independent of the stage durations
    #[clap(long, value_parser = parse_duration, help_heading = "Timing")]
    pub max_duration: Option<Duration>,

    /// Scheduler control tick
    #[clap(long, value_parser = parse_duration, help_heading = "Timing")]
    pub tick: Option<Duration>,

    /// Time VUs get to finish their iteration once draining starts
    #[clap(long, value_parser = parse_duration, help_heading = "Timing")]
    pub grace: Option<Duration>,

    /// Run against the in-process simulation instead of the profile's backend
    #[clap(long, value_enum, help_heading = "Backend")]
    pub simulate: Option<SimulationMode>,

    /// Seed for the simulation and the workload mix
    #[clap(long, help_heading = "Backend")]
    pub seed: Option<u64>,

    /// Keep at most this many samples per trend
    #[clap(long, help_heading = "Backend")]
    pub reservoir_size: Option<usize>,

    /// Push metrics to this gateway base URL
    #[clap(long, help_heading = "Export")]
    pub push_url: Option<String>,

    /// Serve GET /metrics on this address
    #[clap(long, help_heading = "Export")]
    pub listen: Option<SocketAddr>,

    /// Interval between metric exports
    #[clap(long, value_parser = parse_duration, help_heading = "Export")]
    pub export_interval: Option<Duration>,

    /// Append a JSON line of metric summaries every export interval
    #[clap(long, help_heading = "Export")]
    pub export_file: Option<PathBuf>,

    /// Output file for the run report (JSON format)
    #[clap(short = 'o', long, default_value = crate::defaults::OUTPUT_FILE, help_heading = "Output")]
    pub output_file: PathBuf,

    /// Also write logs to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,

    /// Skip printing the summary table
    #[clap(long, default_value_t = false, help_heading = "Output")]
    pub no_summary: bool,

    /// More log output; repeat for trace level
    #[clap(short = 'v', long, action = clap::ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, default_value_t = false, help_heading = "Output")]
    pub quiet: bool,
}

impl Args {
    /// Merge the profile file and the flags into a validated profile
    pub fn load_profile(&self) -> Result<RunProfile> {
        let mut config = match &self.profile {
            Some(path) => ProfileConfig::from_file(path)?,
            None => ProfileConfig::default(),
        };
        self.apply_overrides(&mut config);

        let extra = self
            .thresholds
            .iter()
            .map(|flag| parse_threshold_flag(flag))
            .collect::<Result<Vec<_>>>()?;

        let mut profile = RunProfile::from_config(config).context("Invalid run profile")?;
        profile.thresholds.extend(extra);
        Ok(profile)
    }

    fn apply_overrides(&self, config: &mut ProfileConfig) {
        if let Some(name) = &self.name {
            config.name = Some(name.clone());
        }
        if !self.stages.is_empty() {
            config.stages = self.stages.clone();
        }
        if let Some(d) = self.max_duration {
            config.max_duration = Some(HumanDuration(d));
        }
        if let Some(d) = self.tick {
            config.tick = Some(HumanDuration(d));
        }
        if let Some(d) = self.grace {
            config.grace = Some(HumanDuration(d));
        }
        if let Some(size) = self.reservoir_size {
            config.sampling = Some(SamplingPolicy::Reservoir { size });
        }

        let current = config.backend.clone().unwrap_or_default();
        config.backend = Some(match (current, self.simulate) {
            (BackendConfig::Simulated { mode, seed }, simulate) => BackendConfig::Simulated {
                mode: simulate.unwrap_or(mode),
                seed: self.seed.or(seed),
            },
            (BackendConfig::Tcp { .. }, Some(mode)) => BackendConfig::Simulated {
                mode,
                seed: self.seed,
            },
            (tcp, None) => tcp,
        });

        let export = &mut config.export;
        if let Some(url) = &self.push_url {
            export.push_url = Some(url.clone());
        }
        if let Some(addr) = self.listen {
            export.listen = Some(addr);
        }
        if let Some(d) = self.export_interval {
            export.interval = Some(HumanDuration(d));
        }
        if let Some(path) = &self.export_file {
            export.file = Some(path.clone());
        }
    }
}

/// Parse `<metric>:<expression>`
pub fn parse_threshold_flag(flag: &str) -> Result<Threshold> {
    let (metric, expression) = flag
        .split_once(':')
        .with_context(|| format!("Threshold '{}' must look like <metric>:<expression>", flag))?;
    let metric = metric.trim();
    if metric.is_empty() {
        anyhow::bail!("Threshold '{}' names no metric", flag);
    }
    Threshold::parse(metric, expression).with_context(|| format!("Invalid threshold '{}'", flag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Args {
        let mut full = vec!["db-stress"];
        full.extend_from_slice(args);
        Args::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_flags_only_profile() {
        let args = parse(&[
            "--stage",
            "30s:5",
            "--stage",
            "0s:50",
            "--threshold",
            "operation_success:rate>0.95",
            "--tick",
            "50ms",
            "--simulate",
            "virtual",
            "--seed",
            "42",
            "-vv",
        ]);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.output_file, PathBuf::from(crate::defaults::OUTPUT_FILE));

        let profile = args.load_profile().unwrap();
        assert_eq!(
            profile.stages,
            vec![
                Stage::new(Duration::from_secs(30), 5),
                Stage::new(Duration::ZERO, 50)
            ]
        );
        assert_eq!(profile.tick, Duration::from_millis(50));
        assert_eq!(profile.thresholds.len(), 1);
        assert_eq!(profile.thresholds[0].metric, "operation_success");
        assert_eq!(
            profile.backend,
            BackendConfig::Simulated {
                mode: SimulationMode::Virtual,
                seed: Some(42)
            }
        );
        assert!(!profile.export.is_enabled());
    }

    #[test]
    fn test_flags_override_profile_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "name": "from-file",
                "stages": [ {{ "duration": "1m", "target": 10 }} ],
                "thresholds": {{ "operation_duration": ["p(95)<200ms"] }},
                "backend": {{ "type": "tcp", "address": "127.0.0.1:5432" }},
                "grace": "10s"
            }}"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let args = parse(&[
            "--profile",
            &path,
            "--threshold",
            "operation_success:rate>0.9",
            "--max-duration",
            "20s",
            "--export-file",
            "metrics.jsonl",
        ]);
        let profile = args.load_profile().unwrap();

        assert_eq!(profile.name, "from-file");
        assert_eq!(profile.stages, vec![Stage::new(Duration::from_secs(60), 10)]);
        assert_eq!(profile.grace, Duration::from_secs(10));
        assert_eq!(profile.max_duration, Some(Duration::from_secs(20)));
        let names: Vec<String> = profile.thresholds.iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec![
                "operation_duration: p(95)<200ms",
                "operation_success: rate>0.9"
            ]
        );
        assert!(matches!(profile.backend, BackendConfig::Tcp { .. }));
        assert_eq!(profile.export.file, Some(PathBuf::from("metrics.jsonl")));
    }

    #[test]
    fn test_simulate_replaces_tcp_backend() {
        let mut config = ProfileConfig {
            backend: Some(BackendConfig::Tcp {
                address: "db:5432".to_string(),
                connect_timeout: None,
            }),
            ..ProfileConfig::default()
        };
        parse(&["--simulate", "sleep"]).apply_overrides(&mut config);
        assert_eq!(
            config.backend,
            Some(BackendConfig::Simulated {
                mode: SimulationMode::Sleep,
                seed: None
            })
        );
    }

    #[test]
    fn test_invalid_flags() {
        assert!(Args::try_parse_from(["db-stress", "--stage", "30s"]).is_err());
        assert!(Args::try_parse_from(["db-stress", "--tick", "fast"]).is_err());

        assert!(parse_threshold_flag("rate>0.95").is_err());
        assert!(parse_threshold_flag(":rate>0.95").is_err());
        assert!(parse_threshold_flag("operation_success:rate>>1").is_err());

        // No stages anywhere.
        assert!(parse(&[]).load_profile().is_err());
    }
}
