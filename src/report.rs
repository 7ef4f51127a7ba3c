//! Implementation of the `status`, `errors`, and `squeue` inspection
//! commands: summaries over the persisted work state of the active run.

use anyhow::Result;
use indexmap::IndexMap;

use crate::config;
use crate::slurm::SlurmCli;
use crate::store;
use crate::work::{WorkRecord, WorkStatus};

/// Execute `status`: per-job counts of pending, succeeded, and failed work
/// packages.
pub fn status() -> Result<()> {
    for (job, records) in active_work_state()? {
        println!("----- JOB {} -----", job.to_uppercase());
        for status in [WorkStatus::Pending, WorkStatus::Succeeded, WorkStatus::Failed] {
            let count = records.iter().filter(|r| r.status == status).count();
            println!("{}: {count}", status.as_str());
        }
    }
    Ok(())
}

/// Execute `errors`: the `n` most frequent error types per job.
pub fn errors(n: usize) -> Result<()> {
    for (job, records) in active_work_state()? {
        println!("----- JOB {} -----", job.to_uppercase());
        for (error_type, count) in most_common_errors(&records, n) {
            println!("Error {error_type}: {count}");
        }
    }
    Ok(())
}

/// Execute `squeue`: raw queue listing for the recorded account.
pub fn squeue() -> Result<()> {
    let state = store::load_state()?;
    let listing = SlurmCli.squeue(None, state.account.as_deref())?;
    print!("{listing}");
    Ok(())
}

fn active_work_state() -> Result<IndexMap<String, Vec<WorkRecord>>> {
    let state = store::load_state()?;
    let config = config::load(std::path::Path::new(&state.config))?;
    store::work_state(&config)
}

/// The first colon-separated segment of an error message doubles as its
/// type (thiserror prefixes read naturally here).
pub fn error_type(record: &WorkRecord) -> Option<String> {
    let msg = record.error_msg.as_deref()?;
    let head = msg.split(':').next()?.trim();
    if head.is_empty() {
        None
    } else {
        Some(head.to_string())
    }
}

fn most_common_errors(records: &[WorkRecord], n: usize) -> Vec<(String, usize)> {
    let mut counter: IndexMap<String, usize> = IndexMap::new();
    for record in records {
        if let Some(kind) = error_type(record) {
            *counter.entry(kind).or_default() += 1;
        }
    }
    let mut counts: Vec<_> = counter.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.truncate(n);
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{Params, WorkPackage};

    fn failed_record(error_msg: Option<&str>) -> WorkRecord {
        let mut wp = WorkPackage::init_failed(
            "j.0".into(),
            Params::new(),
            error_msg.unwrap_or_default().to_string(),
        );
        if error_msg.is_none() {
            wp.error_msg = None;
        }
        wp.encode()
    }

    #[test]
    fn error_type_is_message_head() {
        let record = failed_record(Some("special case path /x does not exist: details"));
        assert_eq!(
            error_type(&record).as_deref(),
            Some("special case path /x does not exist")
        );
        assert_eq!(error_type(&failed_record(None)), None);
    }

    #[test]
    fn most_common_errors_ranks_by_count() {
        let records = vec![
            failed_record(Some("a: one")),
            failed_record(Some("b: two")),
            failed_record(Some("b: three")),
        ];
        let counts = most_common_errors(&records, 1);
        assert_eq!(counts, vec![("b".to_string(), 2)]);
    }
}
