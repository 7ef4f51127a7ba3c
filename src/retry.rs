//! Implementation of the `retry` sub-command.
//!
//! Builds a follow-up configuration whose param files contain only the
//! parameter bundles that failed in the last run, then (unless `--dry-run`)
//! starts it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config;
use crate::start::{self, StartOpts};
use crate::store;
use crate::work::WorkStatus;

/// Options for the `retry` sub-command.
#[derive(Debug)]
pub struct RetryOpts<'a> {
    /// Only write the new param files and config, do not start anything.
    pub dry_run: bool,
    pub account: Option<&'a str>,
    pub log_dir: &'a Path,
    pub env: Option<&'a str>,
}

/// Execute `retry`: derive a `-retry` config from the failed packages of
/// the last run.
pub fn execute(opts: RetryOpts) -> Result<()> {
    let state = store::load_state()?;
    let config_path = PathBuf::from(&state.config);
    let mut config = config::load(&config_path)?;

    for job in &mut config.jobs {
        let records = store::load_work(&job.log_dir, &job.name)?;
        let failed_params: Vec<_> = records
            .into_iter()
            .filter(|r| r.status == WorkStatus::Failed)
            .map(|r| r.params)
            .collect();

        let run_dir = store::newest_run_dir(&job.log_dir, &job.name)?;
        let params_path = run_dir.join("params-retry.json");
        let contents = serde_json::to_string_pretty(&failed_params)?;
        std::fs::write(&params_path, contents)
            .with_context(|| format!("write {}", params_path.display()))?;

        job.param_files = vec![params_path];
        job.param_generator_file = None;
    }

    let retry_path = postfix_filename(&config_path, "-retry");
    let yaml = serde_yaml::to_string(&config)?;
    std::fs::write(&retry_path, yaml)
        .with_context(|| format!("write {}", retry_path.display()))?;
    println!(
        "New config with updated param files has been created: {}",
        retry_path.display()
    );

    if !opts.dry_run {
        start::execute(StartOpts {
            config: &retry_path,
            account: opts.account,
            log_dir: opts.log_dir,
            env: opts.env,
        })?;
    }
    Ok(())
}

fn postfix_filename(path: &Path, postfix: &str) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{postfix}.{}", ext.to_string_lossy()),
        None => format!("{stem}{postfix}"),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postfix_preserves_extension() {
        assert_eq!(
            postfix_filename(Path::new("/etc/pipeline.yml"), "-retry"),
            PathBuf::from("/etc/pipeline-retry.yml")
        );
        assert_eq!(
            postfix_filename(Path::new("config"), "-retry"),
            PathBuf::from("config-retry")
        );
    }
}
