//! slurm-pilot — entry point.
//!
//! Operator commands on stdout; tracing logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "slurm-pilot")]
#[command(about = "Control plane for batches of parameterised Slurm jobs", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the pipeline: submit the control plane to the cluster.
    Start {
        /// Path to the pipeline config file.
        config: PathBuf,

        /// Slurm account to schedule tasks with.
        #[arg(long, short)]
        account: Option<String>,

        /// Directory for the control plane's own logs.
        #[arg(long, short, default_value = "control-plane-logs")]
        log_dir: PathBuf,

        /// Conda environment for the control plane (default: the config's
        /// global conda_env).
        #[arg(long, short)]
        env: Option<String>,
    },

    /// Run the control plane in the foreground (what `start` submits).
    Run {
        /// Path to the pipeline config file.
        config: PathBuf,
    },

    /// Retry failed work packages of the last pipeline run.
    Retry {
        /// Only create the new param files and config; do not start.
        #[arg(long)]
        dry_run: bool,

        #[arg(long, short)]
        account: Option<String>,

        #[arg(long, short, default_value = "control-plane-logs")]
        log_dir: PathBuf,

        #[arg(long, short)]
        env: Option<String>,
    },

    /// Stop scheduled cluster jobs.
    Abort {
        /// Name of the job to abort.
        #[arg(long, short)]
        job: Option<String>,

        /// Stop the control plane and all scheduled jobs.
        #[arg(long)]
        all: bool,
    },

    /// Show counts of pending, succeeded, and failed work packages.
    Status,

    /// Show the work-package state of one job.
    Work {
        /// Job name.
        job: String,
    },

    /// Show a work package's stdout log.
    Stdout {
        #[command(flatten)]
        select: LogSelect,
    },

    /// Show a work package's stderr log.
    Stderr {
        #[command(flatten)]
        select: LogSelect,
    },

    /// Show the most frequent error types.
    Errors {
        /// Show the n most frequent errors.
        #[arg(short, default_value = "5")]
        n: usize,
    },

    /// Show the cluster queue for the recorded account.
    Squeue,
}

#[derive(Debug, clap::Args)]
struct LogSelect {
    /// Job name, optionally with an index (name.3).
    #[arg(long, short)]
    job: Option<String>,

    /// Slurm job id of one task.
    #[arg(long, short = 'i')]
    job_id: Option<String>,

    /// Regex matched against job params; shows the first match.
    #[arg(long, short)]
    params: Option<String>,

    /// Only consider failed work packages.
    #[arg(long, short)]
    failed: bool,

    /// Show the control plane's own log.
    #[arg(long, short)]
    control: bool,
}

impl LogSelect {
    fn as_opts(&self) -> slurm_pilot::logs::LogOpts<'_> {
        slurm_pilot::logs::LogOpts {
            job: self.job.as_deref(),
            job_id: self.job_id.as_deref(),
            params: self.params.as_deref(),
            failed: self.failed,
            control: self.control,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout stays reserved for command output.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Start {
            config,
            account,
            log_dir,
            env,
        } => slurm_pilot::start::execute(slurm_pilot::start::StartOpts {
            config: &config,
            account: account.as_deref(),
            log_dir: &log_dir,
            env: env.as_deref(),
        }),

        Command::Run { config } => {
            slurm_pilot::run::execute(slurm_pilot::run::RunOpts { config: &config })
        }

        Command::Retry {
            dry_run,
            account,
            log_dir,
            env,
        } => slurm_pilot::retry::execute(slurm_pilot::retry::RetryOpts {
            dry_run,
            account: account.as_deref(),
            log_dir: &log_dir,
            env: env.as_deref(),
        }),

        Command::Abort { job, all } => slurm_pilot::abort::execute(slurm_pilot::abort::AbortOpts {
            job: job.as_deref(),
            all,
        }),

        Command::Status => slurm_pilot::report::status(),

        Command::Work { job } => slurm_pilot::logs::work(&job),

        Command::Stdout { select } => slurm_pilot::logs::execute(select.as_opts(), false),

        Command::Stderr { select } => slurm_pilot::logs::execute(select.as_opts(), true),

        Command::Errors { n } => slurm_pilot::report::errors(n),

        Command::Squeue => slurm_pilot::report::squeue(),
    }
}
