use faultline_core::config::{ConfigOverrides, FaultlineConfig};
use faultline_core::report::{self, ReportFormat};
use faultline_core::{CampaignController, CampaignReport, GdbSessionFactory};

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{LevelFilter, error, info, warn};
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Log level: error, warn, info, debug or trace.
    #[clap(long, global = true, default_value = "info")]
    log_level: LevelFilter,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a fault injection campaign.
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[clap(short, long, value_parser, default_value = "config.toml")]
    config_file: PathBuf,
    /// Remote debug server as host:port.
    #[clap(long)]
    remote: Option<String>,
    #[clap(short, long)]
    runs: Option<u64>,
    /// Campaign seed; drawn from OS entropy when absent.
    #[clap(long)]
    seed: Option<u64>,
    #[clap(short, long)]
    threads: Option<usize>,
    /// Report path. Defaults to `<experiment name>.<format>`.
    #[clap(short, long)]
    output: Option<PathBuf>,
    #[clap(short, long, default_value = "csv")]
    format: ReportFormat,
}

fn init_logging(level: LevelFilter) -> Result<(), anyhow::Error> {
    fern::Dispatch::new()
        .format(|out, message, record| out.finish(format_args!("[{}] {}", record.level(), message)))
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .context("Failed to install logger")
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_logging(cli.log_level) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Run(args) => run(args),
    };
    match result {
        Ok(report) => exit_code(&report),
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Logs the outcome summary of a finished campaign and maps it to the process exit code.
///
/// # Returns
/// Failure only when no run could attach a debugger session. Crashes, timeouts and
/// injection failures are results of the experiment, not errors of the tool.
fn exit_code(report: &CampaignReport) -> ExitCode {
    for (outcome, count) in report.summary() {
        info!("{outcome}: {count}");
    }
    if report.interrupted {
        warn!("Campaign was interrupted; unstarted runs are marked attach-failed");
    }
    if !report.any_run_started() {
        error!("No run could attach a debugger session");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Loads and validates the configuration, runs the campaign and writes its report.
fn run(args: RunArgs) -> Result<CampaignReport, anyhow::Error> {
    info!("Loading configuration from {:?}", args.config_file);
    let mut config = FaultlineConfig::load_from_file(&args.config_file)?;
    config.apply_overrides(&ConfigOverrides {
        remote: args.remote,
        runs: args.runs,
        seed: args.seed,
        threads: args.threads,
    });
    let campaign = config
        .validate()
        .with_context(|| format!("Invalid configuration in {:?}", args.config_file))?;

    let seed = match campaign.seed {
        Some(seed) => seed,
        None => {
            let seed = ChaCha8Rng::from_os_rng().next_u64();
            info!("No seed configured, using {seed}");
            seed
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let stop_handler = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        warn!("Received Ctrl-C, finishing runs in flight..");
        stop_handler.store(true, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;

    let factory = GdbSessionFactory;
    let report = CampaignController::new(&factory, &campaign, seed)
        .with_stop_flag(stop)
        .run();

    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(format!("{}.{}", campaign.name, args.format.extension())));
    report::export(&report, args.format, &output)
        .with_context(|| format!("Failed to write report to {output:?}"))?;
    info!("Report written to {output:?}");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use faultline_core::{RunOutcome, RunRecord};
    use std::time::Duration;

    fn record(run_index: usize, outcome: RunOutcome) -> RunRecord {
        RunRecord {
            run_index,
            target: None,
            operation: None,
            injection: None,
            injection_delay: Duration::ZERO,
            timeout: Duration::from_secs(1),
            outcome,
            wall_clock: Duration::from_millis(10),
            exit_code: None,
            signal: None,
            breakpoint_hits: 0,
            result_condition: None,
            snapshot: Vec::new(),
            diagnostic: None,
        }
    }

    fn report(outcomes: &[RunOutcome], interrupted: bool) -> CampaignReport {
        CampaignReport {
            experiment: "foo".to_string(),
            seed: 42,
            golden: None,
            runs: outcomes
                .iter()
                .enumerate()
                .map(|(index, outcome)| record(index, *outcome))
                .collect(),
            interrupted,
        }
    }

    #[test]
    fn exit_code_fails_only_when_no_run_attached() {
        let all_failed = report(&[RunOutcome::AttachFailed, RunOutcome::AttachFailed], false);
        assert_eq!(exit_code(&all_failed), ExitCode::FAILURE);

        let one_started = report(&[RunOutcome::AttachFailed, RunOutcome::InjectionFailed], false);
        assert_eq!(exit_code(&one_started), ExitCode::SUCCESS);

        let crashed = report(&[RunOutcome::Crashed, RunOutcome::TimedOut], false);
        assert_eq!(exit_code(&crashed), ExitCode::SUCCESS);
    }

    #[test]
    fn interrupted_campaign_with_a_started_run_succeeds() {
        let interrupted = report(&[RunOutcome::Completed, RunOutcome::AttachFailed], true);
        assert_eq!(exit_code(&interrupted), ExitCode::SUCCESS);
        assert_eq!(exit_code(&report(&[], true)), ExitCode::FAILURE);
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "faultline",
            "--log-level",
            "debug",
            "run",
            "--config-file",
            "foo.toml",
            "--remote",
            "localhost:1234",
            "--runs",
            "10",
            "--seed",
            "42",
            "--format",
            "json",
        ])
        .expect("Arguments should parse");
        assert_eq!(cli.log_level, LevelFilter::Debug);
        let Commands::Run(args) = cli.command;
        assert_eq!(args.config_file, PathBuf::from("foo.toml"));
        assert_eq!(args.remote.as_deref(), Some("localhost:1234"));
        assert_eq!(args.runs, Some(10));
        assert_eq!(args.seed, Some(42));
        assert_eq!(args.format, ReportFormat::Json);
        assert!(args.threads.is_none());
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(Cli::try_parse_from(["faultline", "run", "--format", "xml"]).is_err());
    }
}
