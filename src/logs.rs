//! Implementation of the `work`, `stdout`, and `stderr` inspection
//! commands: dump work-package state and task logs from the active run.

use anyhow::{Context, Result, bail};
use regex::Regex;

use crate::config;
use crate::store;
use crate::work::{WorkRecord, WorkStatus};

/// Execute `work`: print the work-package state of one job as JSON.
pub fn work(job: &str) -> Result<()> {
    let state = store::load_state()?;
    let config = config::load(std::path::Path::new(&state.config))?;
    let job_config = config.job(job).with_context(|| format!("unknown job {job}"))?;
    let records = store::load_work(&job_config.log_dir, &job_config.name)?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

/// Options shared by the `stdout` and `stderr` sub-commands.
#[derive(Debug, Default)]
pub struct LogOpts<'a> {
    /// Job name, optionally with an index (`name.3`).
    pub job: Option<&'a str>,
    /// Cluster id of one task.
    pub job_id: Option<&'a str>,
    /// Regex matched against parameter values; first match wins.
    pub params: Option<&'a str>,
    /// Restrict selection to failed work packages.
    pub failed: bool,
    /// Show the control plane's own log instead.
    pub control: bool,
}

/// Execute `stdout`/`stderr`: locate one work package and print its log.
pub fn execute(opts: LogOpts, stderr: bool) -> Result<()> {
    let state = store::load_state()?;

    if opts.control {
        let path = if stderr { &state.stderr } else { &state.stdout };
        print_log(path);
        return Ok(());
    }

    let config = config::load(std::path::Path::new(&state.config))?;
    let work = store::work_state(&config)?;

    let record = select_record(&work, &opts)?;
    let path = if stderr { &record.stderr } else { &record.stdout };
    match path {
        Some(path) => print_log(path),
        None => println!("Work package {} has not been submitted yet.", record.name),
    }
    Ok(())
}

fn select_record<'a>(
    work: &'a indexmap::IndexMap<String, Vec<WorkRecord>>,
    opts: &LogOpts,
) -> Result<&'a WorkRecord> {
    if let Some(job_id) = opts.job_id {
        return work
            .values()
            .flatten()
            .find(|r| r.job_id.as_deref() == Some(job_id))
            .with_context(|| format!("no work package with job id {job_id}"));
    }

    if let Some(job) = opts.job {
        if let Some((name, idx)) = job.split_once('.') {
            let records = work.get(name).with_context(|| format!("unknown job {name}"))?;
            let idx: usize = idx.parse().with_context(|| format!("invalid job index {idx}"))?;
            return records
                .get(idx)
                .with_context(|| format!("job index {idx} is out of bounds"));
        }
        let records = work.get(job).with_context(|| format!("unknown job {job}"))?;
        return pick_single(records.iter().collect(), opts.failed);
    }

    if let Some(pattern) = opts.params {
        let re = Regex::new(pattern).with_context(|| format!("invalid regex {pattern}"))?;
        return work
            .values()
            .flatten()
            .find(|r| {
                r.params
                    .values()
                    .any(|v| re.is_match(&scalar_string(v)))
            })
            .context("could not find a work package with matching params");
    }

    let candidates: Vec<&WorkRecord> = work.values().flatten().collect();
    pick_single(candidates, opts.failed)
}

/// Deterministic stand-in for an interactive picker: a single candidate is
/// shown directly, several are listed for the operator to narrow down.
fn pick_single<'a>(records: Vec<&'a WorkRecord>, failed_only: bool) -> Result<&'a WorkRecord> {
    let candidates: Vec<&WorkRecord> = records
        .into_iter()
        .filter(|r| !failed_only || r.status == WorkStatus::Failed)
        .collect();

    match candidates.as_slice() {
        [] => bail!("could not find a work package for the given options"),
        [single] => Ok(single),
        many => {
            eprintln!("Several work packages match; narrow down with --job name.<index> or --job-id:");
            for record in many {
                eprintln!(
                    "  {} (Slurm id: {})",
                    record.name,
                    record.job_id.as_deref().unwrap_or("-")
                );
            }
            bail!("{} candidates", many.len())
        }
    }
}

fn scalar_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_log(path: &str) {
    match std::fs::read_to_string(path) {
        Ok(log) if !log.is_empty() => print!("{log}"),
        _ => println!("Log file {path} is empty or does not yet exist."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{Params, WorkPackage};
    use indexmap::IndexMap;

    fn record(name: &str, job_id: Option<&str>, city: &str, failed: bool) -> WorkRecord {
        let mut params = Params::new();
        params.insert("city".to_string(), serde_json::json!(city));
        let mut wp = WorkPackage::new(name.to_string(), params, 1, 0, None, None);
        wp.job_id = job_id.map(str::to_string);
        if failed {
            wp.status = WorkStatus::Failed;
        }
        wp.encode()
    }

    fn work_map() -> IndexMap<String, Vec<WorkRecord>> {
        let mut map = IndexMap::new();
        map.insert(
            "merge".to_string(),
            vec![
                record("merge.0", Some("11_0"), "berlin", false),
                record("merge.1", Some("11_1"), "potsdam", true),
            ],
        );
        map
    }

    #[test]
    fn selects_by_job_id() {
        let work = work_map();
        let opts = LogOpts {
            job_id: Some("11_1"),
            ..Default::default()
        };
        assert_eq!(select_record(&work, &opts).unwrap().name, "merge.1");
    }

    #[test]
    fn selects_by_job_and_index() {
        let work = work_map();
        let opts = LogOpts {
            job: Some("merge.0"),
            ..Default::default()
        };
        assert_eq!(select_record(&work, &opts).unwrap().name, "merge.0");
    }

    #[test]
    fn selects_by_param_regex() {
        let work = work_map();
        let opts = LogOpts {
            params: Some("pots.*"),
            ..Default::default()
        };
        assert_eq!(select_record(&work, &opts).unwrap().name, "merge.1");
    }

    #[test]
    fn failed_filter_narrows_to_one() {
        let work = work_map();
        let opts = LogOpts {
            job: Some("merge"),
            failed: true,
            ..Default::default()
        };
        assert_eq!(select_record(&work, &opts).unwrap().name, "merge.1");
    }

    #[test]
    fn ambiguous_selection_is_an_error() {
        let work = work_map();
        let opts = LogOpts {
            job: Some("merge"),
            ..Default::default()
        };
        assert!(select_record(&work, &opts).is_err());
    }
}
