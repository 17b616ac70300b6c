//! etm CLI - build a tree of CMake modules with per-module target rules

use std::io::IsTerminal;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use indicatif::{MultiProgress, ProgressDrawTarget};
use miette::{IntoDiagnostic, Result, WrapErr};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use etm_core::build::{Orchestrator, RunOptions, RunProgress};
use etm_core::catalog::ModuleCatalog;
use etm_core::config::{Config, DEFAULT_CONFIG_FILE};
use etm_core::report::RunReport;
use etm_core::targets::TargetRules;

mod progress_writer;
mod summary;

use progress_writer::ProgressWriter;

/// Exit code for configuration and other errors raised before any step runs
const EXIT_CONFIG_ERROR: u8 = 2;

/// etm - configure and build every module under the configured module paths
#[derive(Debug, Parser)]
#[command(name = "etm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Remove each module's build directory and run CMake again
    #[arg(short, long)]
    reconfigure: bool,

    /// Keep building after a failure
    #[arg(short, long)]
    keep_going: bool,

    /// Stream build output as it is produced
    #[arg(short, long)]
    verbose: bool,

    /// Build only these modules
    #[arg(short, long, num_args = 1..)]
    modules: Vec<String>,

    /// Build only these targets
    #[arg(short, long, num_args = 1..)]
    targets: Vec<String>,

    /// Number of parallel jobs (overrides build.jobs)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Write the run report as JSON
    #[arg(long, value_name = "FILE")]
    report: Option<String>,

    /// Show what would be built without running anything
    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let multi = MultiProgress::new();
    if cli.verbose || cli.dry_run || !std::io::stderr().is_terminal() {
        multi.set_draw_target(ProgressDrawTarget::hidden());
    }

    // Initialize tracing with a writer that keeps log lines above the progress bars
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("info,etm=debug,etm_core=debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(ProgressWriter::new(multi.clone())))
        .with(filter)
        .init();

    match run(cli, multi) {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{:?}", report);
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
    }
}

fn run(cli: Cli, multi: MultiProgress) -> Result<u8> {
    let mut config = Config::load(&Utf8PathBuf::from(&cli.config))?;
    if let Some(jobs) = cli.jobs {
        if jobs == 0 {
            return Err(miette::miette!(
                help = "Omit --jobs to use build.jobs or the number of logical CPUs",
                "--jobs must be at least 1"
            ));
        }
        config.build.jobs = Some(jobs);
    }

    let catalog = ModuleCatalog::discover(&config.module_paths)?;
    let rules = TargetRules::from_config(&config);
    let options = RunOptions {
        reconfigure: cli.reconfigure,
        keep_going: cli.keep_going,
        verbose: cli.verbose,
        modules: cli.modules.into_iter().collect(),
        targets: cli.targets.into_iter().collect(),
    };

    let orchestrator = Orchestrator::new(&config.build).with_progress(RunProgress::new(multi));
    let plan = orchestrator.plan(&catalog, &rules, &options);

    let mut stdout = std::io::stdout().lock();
    if cli.dry_run {
        summary::write_plan(&mut stdout, &plan, orchestrator.backend()).into_diagnostic()?;
        return Ok(0);
    }

    let report = orchestrator.execute(&plan, &options)?;

    // The run has happened; from here on the outcome decides the exit code
    if let Err(e) = summary::write_report(&mut stdout, &report)
        .and_then(|()| summary::write_unknown(&mut stdout, &plan))
    {
        tracing::error!("Failed to print the run summary: {}", e);
    }

    if let Some(path) = cli.report {
        if let Err(error) = write_json_report(&report, &path) {
            eprintln!("{:?}", error);
        }
    }

    Ok(report.outcome.exit_code())
}

fn write_json_report(report: &RunReport, path: &str) -> Result<()> {
    let json = serde_json::to_string_pretty(report).into_diagnostic()?;
    std::fs::write(path, json)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write report to {}", path))?;
    tracing::info!("Wrote report to {}", path);
    Ok(())
}
