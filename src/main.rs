//! # db-stress - Main Entry Point
//!
//! 1. Parse arguments and initialize logging
//! 2. Merge the profile file with the command-line overrides
//! 3. Run the load test, stopping gracefully on Ctrl-C
//! 4. Print the summary, write the JSON report and exit with the verdict
//!
//! Exit status: 0 when every threshold passed, 1 when any failed, 2 for
//! configuration or internal faults.

use anyhow::Result;
use clap::Parser;
use db_stress::{cli::Args, logging, RunController, RunReport, ResultsManager};
use std::process::ExitCode;
use tracing::{error, info, warn};

const EXIT_FAILED: u8 = 1;
const EXIT_FAULT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _guard = match logging::init_logging(args.verbose, args.quiet, args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(EXIT_FAULT);
        }
    };

    match run(&args).await {
        Ok(report) if report.passed => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(EXIT_FAILED),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FAULT)
        }
    }
}

async fn run(args: &Args) -> Result<RunReport> {
    info!("Starting db-stress {}", db_stress::VERSION);

    let profile = args.load_profile()?;
    let results_manager = ResultsManager::new(&args.output_file)?;
    let controller = RunController::new(profile)?;

    let stop = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, draining VUs");
            stop.stop();
        }
    });

    let report = controller.run().await?;

    if !args.no_summary {
        report.print_summary();
    }
    results_manager.write(&report)?;

    Ok(report)
}
