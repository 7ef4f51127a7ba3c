//! Implementation of the `run` sub-command: the control-plane daemon.
//!
//! This is what actually executes on the cluster's io partition after
//! `start`. Jobs are processed sequentially, each by its own scheduler.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::config;
use crate::scheduler::Scheduler;
use crate::slack::SlackNotifier;
use crate::slurm::SlurmCli;

/// Options for the `run` sub-command.
#[derive(Debug)]
pub struct RunOpts<'a> {
    /// Path to the pipeline configuration file.
    pub config: &'a Path,
}

/// Execute `run`: drive every configured job to completion, in order.
pub fn execute(opts: RunOpts) -> Result<()> {
    let config = config::load(opts.config)?;
    let cluster = SlurmCli;

    for job in &config.jobs {
        let props = config.job_properties(job);
        info!(job = %job.name, "processing job");

        let notifier = match (props.slack_channel.clone(), props.slack_token.clone()) {
            (Some(channel), Some(token)) => Some(SlackNotifier::new(channel, token)),
            _ => None,
        };

        let mut scheduler = Scheduler::new(job, props, &cluster, notifier.as_ref())?;
        scheduler
            .run()
            .with_context(|| format!("job {} did not run to completion", job.name))?;
    }
    Ok(())
}
