//! Implementation of the `abort` sub-command.
//!
//! Cancellation is best-effort and external: the daemon observes the
//! CANCELLED states on its next poll and classifies them normally.

use anyhow::{Result, bail};
use tracing::warn;

use crate::config;
use crate::slurm::{Cluster, SlurmCli};
use crate::store;
use crate::work::WorkRecord;

/// Options for the `abort` sub-command.
#[derive(Debug)]
pub struct AbortOpts<'a> {
    /// Abort a single job's scheduled work.
    pub job: Option<&'a str>,
    /// Abort everything, including the control plane itself.
    pub all: bool,
}

/// Execute `abort`: cancel scheduled cluster jobs.
pub fn execute(opts: AbortOpts) -> Result<()> {
    let state = store::load_state()?;
    let config = config::load(std::path::Path::new(&state.config))?;
    let work = store::work_state(&config)?;
    let cluster = SlurmCli;

    if opts.all {
        for records in work.values() {
            cancel_scheduled(&cluster, records);
        }
        if let Err(e) = cluster.cancel(&state.job_id) {
            warn!(job_id = %state.job_id, error = %e, "failed to cancel the control plane");
        }
        println!("Control plane and all scheduled jobs have been aborted.");
        return Ok(());
    }

    if let Some(job) = opts.job {
        let Some(records) = work.get(job) else {
            bail!("unknown job {job}");
        };
        cancel_scheduled(&cluster, records);
        println!("{job} jobs have been aborted.");
        return Ok(());
    }

    bail!("please provide either --job <name> or --all");
}

fn cancel_scheduled(cluster: &SlurmCli, records: &[WorkRecord]) {
    for record in records {
        let Some(job_id) = record.job_id.as_deref() else {
            println!("Not all work packages have been initialized. Please retry in a few moments.");
            continue;
        };
        if let Err(e) = cluster.cancel(job_id) {
            warn!(job_id, error = %e, "failed to cancel job");
        }
    }
}
