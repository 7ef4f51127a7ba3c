//! Slurm cluster adapter.
//!
//! The only module that talks to the cluster CLI (`sbatch`, `sacct`,
//! `scancel`, `squeue`) and the only place that converts raw status strings
//! into typed [`Status`] values. All invocations use argument arrays; no
//! shell interpolation.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Largest `--array` span one submission may request.
pub const MAX_ARRAY_SIZE: usize = 3000;

/// Hard per-task CPU ceiling on the CPU partitions.
pub const MAX_CPUS: u64 = 32;
/// Hard per-task memory ceiling on the CPU partitions, in MB.
pub const MAX_MEM: u64 = 128_000;
/// Memory granted per CPU when no explicit `--mem` is requested, in MB.
pub const MEM_PER_CPU: u64 = 4_000;

/// GPU-partition counterparts.
pub const GPU_MAX_CPUS: u64 = 64;
pub const GPU_MAX_MEM: u64 = 512_000;
pub const GPU_MEM_PER_CPU: u64 = 8_000;

/// Partition that handles I/O-bound single tasks. Does not accept arrays.
pub const IO_PARTITION: &str = "io";
/// Partition with GPU nodes and the larger memory ceilings.
pub const GPU_PARTITION: &str = "gpu";

#[derive(Debug, Error)]
pub enum SlurmError {
    /// The cluster CLI exited non-zero. `stderr` is preserved verbatim so
    /// it can travel into a work package's `error_msg`.
    #[error("`{command}` exited with status {status}:\n{stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("invalid time limit {0:?}")]
    InvalidTime(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Raw Slurm job state as reported by `sacct`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    BootFail,
    Cancelled,
    Completed,
    Configuring,
    Completing,
    Deadline,
    Failed,
    NodeFail,
    OutOfMemory,
    Pending,
    Preempted,
    Running,
    ResvDelHold,
    RequeueFed,
    RequeueHold,
    Requeued,
    Resizing,
    Revoked,
    Signaling,
    SpecialExit,
    StageOut,
    Stopped,
    Suspended,
    Timeout,
    Unknown,
}

impl Status {
    /// Map an `sacct` token to a typed status. Unrecognised tokens become
    /// [`Status::Unknown`]; this never fails.
    pub fn from_token(token: &str) -> Status {
        let token = token.trim();
        // sacct reports "CANCELLED by <uid>" when an operator cancelled.
        if token.starts_with("CANCELLED") {
            return Status::Cancelled;
        }
        match token {
            "BOOT_FAIL" => Status::BootFail,
            "COMPLETED" => Status::Completed,
            "CONFIGURING" => Status::Configuring,
            "COMPLETING" => Status::Completing,
            "DEADLINE" => Status::Deadline,
            "FAILED" => Status::Failed,
            "NODE_FAIL" => Status::NodeFail,
            "OUT_OF_MEMORY" => Status::OutOfMemory,
            "PENDING" => Status::Pending,
            "PREEMPTED" => Status::Preempted,
            "RUNNING" => Status::Running,
            "RESV_DEL_HOLD" => Status::ResvDelHold,
            "REQUEUE_FED" => Status::RequeueFed,
            "REQUEUE_HOLD" => Status::RequeueHold,
            "REQUEUED" => Status::Requeued,
            "RESIZING" => Status::Resizing,
            "REVOKED" => Status::Revoked,
            "SIGNALING" => Status::Signaling,
            "SPECIAL_EXIT" => Status::SpecialExit,
            "STAGE_OUT" => Status::StageOut,
            "STOPPED" => Status::Stopped,
            "SUSPENDED" => Status::Suspended,
            "TIMEOUT" => Status::Timeout,
            _ => Status::Unknown,
        }
    }

    /// Job is queued or making progress; nothing to do but wait.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Status::Pending
                | Status::Running
                | Status::Configuring
                | Status::Completing
                | Status::Resizing
        )
    }

    /// Scheduler-side hiccup; the job can be resubmitted unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Status::BootFail
                | Status::NodeFail
                | Status::Requeued
                | Status::RequeueFed
                | Status::Stopped
                | Status::Suspended
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::BootFail => "BOOT_FAIL",
            Status::Cancelled => "CANCELLED",
            Status::Completed => "COMPLETED",
            Status::Configuring => "CONFIGURING",
            Status::Completing => "COMPLETING",
            Status::Deadline => "DEADLINE",
            Status::Failed => "FAILED",
            Status::NodeFail => "NODE_FAIL",
            Status::OutOfMemory => "OUT_OF_MEMORY",
            Status::Pending => "PENDING",
            Status::Preempted => "PREEMPTED",
            Status::Running => "RUNNING",
            Status::ResvDelHold => "RESV_DEL_HOLD",
            Status::RequeueFed => "REQUEUE_FED",
            Status::RequeueHold => "REQUEUE_HOLD",
            Status::Requeued => "REQUEUED",
            Status::Resizing => "RESIZING",
            Status::Revoked => "REVOKED",
            Status::Signaling => "SIGNALING",
            Status::SpecialExit => "SPECIAL_EXIT",
            Status::StageOut => "STAGE_OUT",
            Status::Stopped => "STOPPED",
            Status::Suspended => "SUSPENDED",
            Status::Timeout => "TIMEOUT",
            Status::Unknown => "UNKNOWN",
        }
    }
}

/// One concrete submission: a user script plus the resources it runs with.
///
/// `output`/`error` are `sbatch` filename patterns (`%A`, `%a`, `%j`)
/// resolved relative to `chdir`.
#[derive(Debug, Clone)]
pub struct SlurmRequest {
    pub job_name: String,
    pub script: PathBuf,
    pub conda_env: String,
    pub cpus: u64,
    /// Requested memory in MB; 0 means "scheduler default".
    pub mem: u64,
    pub time: Option<String>,
    pub partition: Option<String>,
    pub gres: Option<String>,
    pub account: Option<String>,
    pub chdir: PathBuf,
    pub output: String,
    pub error: String,
    /// Extra KEY=VALUE pairs exported into the job environment.
    pub env_vars: Vec<String>,
    /// Trailing arguments passed to the user script.
    pub args: Vec<String>,
}

impl SlurmRequest {
    /// The partition this request lands on: explicit, or auto-chosen from
    /// the CPU and memory footprint.
    pub fn partition(&self) -> &str {
        if let Some(p) = self.partition.as_deref() {
            return p;
        }
        if self.cpus <= 16 && self.effective_mem() <= 64_000 {
            "standard"
        } else {
            "broadwell"
        }
    }

    /// Memory this request will actually occupy, in MB.
    pub fn effective_mem(&self) -> u64 {
        if self.mem > 0 {
            self.mem
        } else {
            self.cpus * self.mem_per_cpu()
        }
    }

    // The GPU partition is only ever explicit, never auto-chosen, so the
    // limit lookups key off the raw field; `partition()` can then derive
    // the CPU partition from the memory footprint without recursing.

    pub fn mem_per_cpu(&self) -> u64 {
        if self.partition.as_deref() == Some(GPU_PARTITION) {
            GPU_MEM_PER_CPU
        } else {
            MEM_PER_CPU
        }
    }

    /// Hard memory ceiling for this request's partition, in MB.
    pub fn max_mem(&self) -> u64 {
        if self.partition.as_deref() == Some(GPU_PARTITION) {
            GPU_MAX_MEM
        } else {
            MAX_MEM
        }
    }

    pub fn max_cpus(&self) -> u64 {
        if self.partition.as_deref() == Some(GPU_PARTITION) {
            GPU_MAX_CPUS
        } else {
            MAX_CPUS
        }
    }

    /// Requested wall-time in whole minutes (0 when no limit is set).
    pub fn minutes(&self) -> Result<u64, SlurmError> {
        Ok(parse_time(self.time.as_deref())?.as_secs() / 60)
    }

    /// QoS class derived from the wall-time, or `io` on the io partition.
    pub fn qos(&self) -> Result<&'static str, SlurmError> {
        if self.partition() == IO_PARTITION {
            return Ok("io");
        }
        let minutes = self.minutes()?;
        Ok(if minutes <= 24 * 60 {
            "short"
        } else if minutes <= 7 * 24 * 60 {
            "medium"
        } else {
            "long"
        })
    }
}

/// Seam between the scheduler and the cluster. The production
/// implementation shells out to the Slurm CLI; tests substitute a scripted
/// mock.
pub trait Cluster {
    /// Submit a single job. Returns the opaque job id.
    fn submit(&self, req: &SlurmRequest) -> Result<String, SlurmError>;

    /// Submit `n_tasks` entries of `workfile` as one array job. Returns the
    /// base job id and the per-task ids `"<id>_0"` … `"<id>_{N-1}"`.
    ///
    /// On the io partition arrays are not accepted: the adapter degrades to
    /// a single job over the whole workfile and returns an empty task list;
    /// the caller assigns per-index identifiers itself.
    fn submit_array(
        &self,
        workfile: &Path,
        n_tasks: usize,
        req: &SlurmRequest,
    ) -> Result<(String, Vec<String>), SlurmError>;

    /// Query the accounting database for the current job state.
    fn status(&self, job_id: &str) -> Result<Status, SlurmError>;

    /// Best-effort termination.
    fn cancel(&self, job_id: &str) -> Result<(), SlurmError>;
}

/// Production [`Cluster`] backed by the Slurm command-line tools.
#[derive(Debug, Default, Clone)]
pub struct SlurmCli;

impl SlurmCli {
    /// Raw `squeue` listing, optionally filtered by job name or account.
    pub fn squeue(&self, name: Option<&str>, account: Option<&str>) -> Result<String, SlurmError> {
        let mut args = vec!["--states=all".to_string()];
        if let Some(name) = name {
            args.push(format!("--name={name}"));
        }
        if let Some(account) = account {
            args.push(format!("--account={account}"));
        }
        run_cli("squeue", &args)
    }

    fn sbatch(&self, req: &SlurmRequest, array: Option<&str>, batch_script: &Path) -> Result<String, SlurmError> {
        let (cpus, mem) = clamp_resources(req);

        let mut args = vec![
            "--parsable".to_string(),
            "--nodes=1".to_string(),
            "--ntasks=1".to_string(),
            format!("--cpus-per-task={cpus}"),
            format!("--qos={}", req.qos()?),
            format!("--partition={}", req.partition()),
            format!("--job-name={}", req.job_name),
            format!("--chdir={}", req.chdir.display()),
            format!("--output={}", req.output),
            format!("--error={}", req.error),
        ];
        if let Some(time) = req.time.as_deref() {
            args.push(format!("--time={time}"));
        }
        if mem > 0 {
            args.push(format!("--mem={mem}"));
        }
        if let Some(gres) = req.gres.as_deref() {
            args.push(format!("--gres={gres}"));
        }
        if let Some(account) = req.account.as_deref() {
            args.push(format!("--account={account}"));
        }
        if !req.env_vars.is_empty() {
            args.push(format!("--export=ALL,{}", req.env_vars.join(",")));
        }
        if let Some(array) = array {
            args.push(format!("--array={array}"));
        }

        args.push(batch_script.display().to_string());
        args.extend(req.args.iter().cloned());

        let stdout = run_cli("sbatch", &args)?;
        let job_id = stdout.trim().to_string();
        debug!(job_id = %job_id, job_name = %req.job_name, "sbatch accepted submission");
        Ok(job_id)
    }
}

impl Cluster for SlurmCli {
    fn submit(&self, req: &SlurmRequest) -> Result<String, SlurmError> {
        let batch_script = write_batch_script(req, &req.chdir, None)?;
        self.sbatch(req, None, &batch_script)
    }

    fn submit_array(
        &self,
        workfile: &Path,
        n_tasks: usize,
        req: &SlurmRequest,
    ) -> Result<(String, Vec<String>), SlurmError> {
        let workdir = workfile.parent().unwrap_or(Path::new("."));

        if req.partition() == IO_PARTITION {
            // The io partition rejects --array. Run the whole workfile in
            // one job; the caller derives per-index identifiers.
            let batch_script = write_batch_script(req, workdir, Some(workfile))?;
            let job_id = self.sbatch(req, None, &batch_script)?;
            return Ok((job_id, Vec::new()));
        }

        let batch_script = write_batch_script(req, workdir, Some(workfile))?;
        let array = format!("0-{}", n_tasks - 1); // --array=0-0 is valid
        let job_id = self.sbatch(req, Some(&array), &batch_script)?;
        let task_ids = (0..n_tasks).map(|i| format!("{job_id}_{i}")).collect();
        Ok((job_id, task_ids))
    }

    fn status(&self, job_id: &str) -> Result<Status, SlurmError> {
        let args = vec![
            format!("--job={job_id}"),
            "--format=state".to_string(),
            "--parsable2".to_string(),
            "--noheader".to_string(),
        ];
        let stdout = run_cli("sacct", &args)?;

        let Some(token) = stdout.lines().next().map(str::trim).filter(|l| !l.is_empty()) else {
            // No accounting record yet: the job was submitted moments ago.
            warn!(job_id, "no sacct record yet, treating as PENDING");
            return Ok(Status::Pending);
        };
        Ok(Status::from_token(token))
    }

    fn cancel(&self, job_id: &str) -> Result<(), SlurmError> {
        run_cli("scancel", &[job_id.to_string()])?;
        Ok(())
    }
}

/// Clamp a request to the hard partition limits, warning when it exceeds
/// them.
fn clamp_resources(req: &SlurmRequest) -> (u64, u64) {
    let mut cpus = req.cpus;
    let mut mem = req.mem;
    if cpus > req.max_cpus() {
        warn!(
            requested = cpus,
            max = req.max_cpus(),
            partition = req.partition(),
            "CPU request exceeds the partition limit, clamping"
        );
        cpus = req.max_cpus();
    }
    if mem > req.max_mem() {
        warn!(
            requested = mem,
            max = req.max_mem(),
            partition = req.partition(),
            "memory request exceeds the partition limit, clamping"
        );
        mem = req.max_mem();
    }
    (cpus, mem)
}

/// Materialise the wrapper script that `sbatch` executes: activate the
/// conda environment, then hand over to the user script. Array tasks get
/// their index as the last argument so they can pick their parameter
/// bundle out of the workfile.
fn write_batch_script(
    req: &SlurmRequest,
    dir: &Path,
    workfile: Option<&Path>,
) -> Result<PathBuf, SlurmError> {
    let path = dir.join(format!("{}.sbatch.sh", req.job_name));

    let mut script = String::from("#!/bin/bash\nset -euo pipefail\n");
    script.push_str(&format!("source activate \"{}\"\n", req.conda_env));
    match workfile {
        Some(workfile) => script.push_str(&format!(
            "exec \"{}\" \"{}\" \"${{SLURM_ARRAY_TASK_ID:-0}}\" \"$@\"\n",
            req.script.display(),
            workfile.display()
        )),
        None => script.push_str(&format!("exec \"{}\" \"$@\"\n", req.script.display())),
    }

    std::fs::write(&path, script)?;
    Ok(path)
}

fn run_cli(program: &str, args: &[String]) -> Result<String, SlurmError> {
    debug!(%program, ?args, "invoking cluster CLI");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|source| SlurmError::Spawn {
            command: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(SlurmError::CommandFailed {
            command: format!("{program} {}", args.join(" ")),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse a Slurm time limit.
///
/// Accepted forms: `M`, `M:S`, `H:M:S`, `D-H`, `D-H:M`, `D-H:M:S`. A bare
/// integer is minutes. `None` parses to a zero duration.
pub fn parse_time(s: Option<&str>) -> Result<Duration, SlurmError> {
    let Some(raw) = s else {
        return Ok(Duration::ZERO);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Duration::ZERO);
    }

    let invalid = || SlurmError::InvalidTime(raw.to_string());
    let field = |part: &str| part.parse::<u64>().map_err(|_| invalid());

    let secs = if let Some((days, rest)) = raw.split_once('-') {
        let days = field(days)?;
        let parts: Vec<&str> = rest.split(':').collect();
        let (h, m, s) = match parts.as_slice() {
            [h] => (field(h)?, 0, 0),
            [h, m] => (field(h)?, field(m)?, 0),
            [h, m, s] => (field(h)?, field(m)?, field(s)?),
            _ => return Err(invalid()),
        };
        days * 86_400 + h * 3_600 + m * 60 + s
    } else {
        let parts: Vec<&str> = raw.split(':').collect();
        match parts.as_slice() {
            [m] => field(m)? * 60,
            [m, s] => field(m)? * 60 + field(s)?,
            [h, m, s] => field(h)? * 3_600 + field(m)? * 60 + field(s)?,
            _ => return Err(invalid()),
        }
    };

    Ok(Duration::from_secs(secs))
}
