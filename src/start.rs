//! Implementation of the `start` sub-command.
//!
//! Submits the control plane itself as a single job on the io partition;
//! the daemon then runs `run <config>` next to the cluster and survives
//! operator logouts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::config;
use crate::slurm::{Cluster, IO_PARTITION, SlurmCli, SlurmRequest};
use crate::store::{self, CliState};

const CONTROL_PLANE_JOB: &str = "control-plane";

/// Options for the `start` sub-command.
#[derive(Debug)]
pub struct StartOpts<'a> {
    pub config: &'a Path,
    /// Slurm account the control plane is billed to.
    pub account: Option<&'a str>,
    /// Directory for the control plane's own logs.
    pub log_dir: &'a Path,
    /// Conda environment for the control plane; falls back to the config's
    /// global `conda_env`.
    pub env: Option<&'a str>,
}

/// Execute `start`: validate the config, submit the daemon, persist CLI
/// state.
pub fn execute(opts: StartOpts) -> Result<()> {
    // Fail fast on a broken config before anything reaches the cluster.
    let config = config::load(opts.config)?;

    let conda_env = opts
        .env
        .map(str::to_string)
        .or_else(|| config.properties.conda_env.clone())
        .context("no conda environment: pass --env or set properties.conda_env")?;

    std::fs::create_dir_all(opts.log_dir)
        .with_context(|| format!("create log directory {}", opts.log_dir.display()))?;

    let exe = std::env::current_exe().context("resolve current exe")?;
    let config_path = opts
        .config
        .canonicalize()
        .with_context(|| format!("resolve config path {}", opts.config.display()))?;

    // The daemon inherits its log filter through the job environment.
    let log_level = config
        .properties
        .log_level
        .unwrap_or(config::LogLevel::Info)
        .as_filter();

    let req = SlurmRequest {
        job_name: CONTROL_PLANE_JOB.to_string(),
        script: exe,
        conda_env,
        cpus: 1,
        mem: 0,
        time: None,
        partition: Some(IO_PARTITION.to_string()),
        gres: None,
        account: opts.account.map(str::to_string),
        chdir: opts.log_dir.to_path_buf(),
        output: "control_plane.stdout".to_string(),
        error: "control_plane.stderr".to_string(),
        env_vars: vec![format!("RUST_LOG={log_level}")],
        args: vec!["run".to_string(), config_path.display().to_string()],
    };

    let cluster = SlurmCli;
    let job_id = cluster.submit(&req)?;
    info!(job_id = %job_id, "control plane submitted");
    println!("Pipeline control plane started. Slurm job id: {job_id}");

    store::save_state(&CliState {
        config: config_path.display().to_string(),
        job_id,
        account: opts.account.map(str::to_string),
        stdout: log_path(opts.log_dir, "control_plane.stdout"),
        stderr: log_path(opts.log_dir, "control_plane.stderr"),
    })
}

fn log_path(log_dir: &Path, name: &str) -> String {
    PathBuf::from(log_dir).join(name).display().to_string()
}
