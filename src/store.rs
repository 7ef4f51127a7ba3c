//! On-disk state shared between the daemon and the inspection commands:
//! the CLI state file and the per-run log directories.
//!
//! Resolution for the CLI state file:
//!   1. `SLURM_PILOT_STATE` environment variable
//!   2. `~/.slurm-pilot`

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::BaseDirs;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::work::WorkRecord;

/// Persisted by `start` so the inspection commands can find the active
/// run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliState {
    /// Path of the config the control plane was started with.
    pub config: String,
    /// Cluster id of the control-plane job itself.
    pub job_id: String,
    pub account: Option<String>,
    /// Control-plane log paths.
    pub stdout: String,
    pub stderr: String,
}

/// Resolve the CLI state file location.
pub fn state_file() -> PathBuf {
    if let Ok(path) = std::env::var("SLURM_PILOT_STATE") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Some(base_dirs) = BaseDirs::new() {
        return base_dirs.home_dir().join(".slurm-pilot");
    }
    PathBuf::from(".slurm-pilot")
}

pub fn save_state(state: &CliState) -> Result<()> {
    let path = state_file();
    let contents = serde_json::to_string_pretty(state)?;
    std::fs::write(&path, contents)
        .with_context(|| format!("write CLI state {}", path.display()))?;
    Ok(())
}

pub fn load_state() -> Result<CliState> {
    let path = state_file();
    let raw = std::fs::read(&path).with_context(|| {
        format!(
            "read CLI state {} (has a pipeline been started?)",
            path.display()
        )
    })?;
    serde_json::from_slice(&raw).with_context(|| format!("parse CLI state {}", path.display()))
}

/// The most recent run directory for one job, by modification time.
pub fn newest_run_dir(log_dir: &Path, job_name: &str) -> Result<PathBuf> {
    let prefix = format!("{job_name}-");
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;

    for entry in std::fs::read_dir(log_dir)
        .with_context(|| format!("read log directory {}", log_dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !name.starts_with(&prefix) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, entry.path()));
        }
    }

    newest.map(|(_, path)| path).with_context(|| {
        format!(
            "no run directory for job {job_name} under {}",
            log_dir.display()
        )
    })
}

/// Load the `work.json` snapshot of a job's newest run.
pub fn load_work(log_dir: &Path, job_name: &str) -> Result<Vec<WorkRecord>> {
    let path = newest_run_dir(log_dir, job_name)?.join("work.json");
    let raw = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Work state of every configured job, keyed by job name in config order.
pub fn work_state(config: &Config) -> Result<IndexMap<String, Vec<WorkRecord>>> {
    let mut state = IndexMap::new();
    for job in &config.jobs {
        state.insert(job.name.clone(), load_work(&job.log_dir, &job.name)?);
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_file_env_override() {
        // SAFETY: test-only; not running in parallel with other env-mutating tests.
        unsafe {
            std::env::set_var("SLURM_PILOT_STATE", "/tmp/pilot-state.json");
        }
        let path = state_file();
        unsafe {
            std::env::remove_var("SLURM_PILOT_STATE");
        }
        assert_eq!(path, PathBuf::from("/tmp/pilot-state.json"));
    }

    #[test]
    fn state_file_defaults_to_home() {
        // SAFETY: test-only; not running in parallel with other env-mutating tests.
        unsafe {
            std::env::remove_var("SLURM_PILOT_STATE");
        }
        let path = state_file();
        assert!(
            path.to_string_lossy().ends_with(".slurm-pilot"),
            "unexpected state path {}",
            path.display()
        );
    }

    #[test]
    fn newest_run_dir_picks_latest() {
        let log_dir = tempfile::tempdir().unwrap();
        let old = log_dir.path().join("job-2024-01-01--00-00-00");
        let new = log_dir.path().join("job-2024-06-01--00-00-00");
        std::fs::create_dir(&old).unwrap();
        std::fs::create_dir(&new).unwrap();
        // Directory mtimes follow creation order here.
        let found = newest_run_dir(log_dir.path(), "job").unwrap();
        assert_eq!(found, new);
    }

    #[test]
    fn newest_run_dir_ignores_other_jobs() {
        let log_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(log_dir.path().join("other-2024-01-01--00-00-00")).unwrap();
        assert!(newest_run_dir(log_dir.path(), "job").is_err());
    }
}
