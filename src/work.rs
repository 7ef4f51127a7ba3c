//! Work packages: one invocation of the user script with one parameter
//! bundle. The unit of scheduling, retry, and persistence.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::slurm::Status;

/// Opaque, ordered parameter bundle. Values are scalars (strings, numbers,
/// booleans); the scheduler never looks inside except for interpolation.
pub type Params = IndexMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    Pending,
    Failed,
    Succeeded,
}

impl WorkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkStatus::Pending => "PENDING",
            WorkStatus::Failed => "FAILED",
            WorkStatus::Succeeded => "SUCCEEDED",
        }
    }
}

/// Mutable lifecycle state of one work package. Only the scheduler mutates
/// these after creation.
#[derive(Debug, Clone)]
pub struct WorkPackage {
    pub params: Params,
    /// Display name, `<job>.<index>`.
    pub name: String,
    pub cpus: u64,
    /// Memory request in MB; 0 means "scheduler default". Grows on OOM
    /// retries.
    pub mem: u64,
    /// Time limit; multiplied on timeout retries.
    pub time: Option<String>,
    pub partition: Option<String>,
    pub status: WorkStatus,
    /// Last raw cluster state observed for the current `job_id`.
    pub slurm_status: Option<Status>,
    /// Number of submissions so far.
    pub n_tries: u32,
    /// Cluster id while scheduled; cleared on requeue.
    pub job_id: Option<String>,
    /// Ids of earlier submissions, appended on every requeue.
    pub old_job_ids: Vec<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub mem_profile: Option<String>,
    /// Peak memory in MB read from the profile artifact, when available.
    pub max_mem: Option<f64>,
    pub error_msg: Option<String>,
}

impl WorkPackage {
    pub fn new(
        name: String,
        params: Params,
        cpus: u64,
        mem: u64,
        time: Option<String>,
        partition: Option<String>,
    ) -> Self {
        WorkPackage {
            params,
            name,
            cpus,
            mem,
            time,
            partition,
            status: WorkStatus::Pending,
            slurm_status: None,
            n_tries: 0,
            job_id: None,
            old_job_ids: Vec::new(),
            stdout: None,
            stderr: None,
            mem_profile: None,
            max_mem: None,
            error_msg: None,
        }
    }

    /// A package whose resource resolution already failed: terminal FAILED
    /// from the start, no resources assigned.
    pub fn init_failed(name: String, params: Params, error_msg: String) -> Self {
        let mut wp = WorkPackage::new(name, params, 0, 0, None, None);
        wp.status = WorkStatus::Failed;
        wp.error_msg = Some(error_msg);
        wp
    }

    /// Queued: pending and not yet submitted (or requeued).
    pub fn is_queued(&self) -> bool {
        self.status == WorkStatus::Pending && self.job_id.is_none()
    }

    /// Scheduled: pending with a live cluster id to poll.
    pub fn is_scheduled(&self) -> bool {
        self.status == WorkStatus::Pending && self.job_id.is_some()
    }

    /// Grouping key for array submission: packages sharing it can ride in
    /// one array.
    pub fn resource_key(&self) -> (u64, u64, Option<String>, Option<String>) {
        (
            self.cpus,
            self.mem,
            self.time.clone(),
            self.partition.clone(),
        )
    }

    /// Stable JSON-serialisable record.
    pub fn encode(&self) -> WorkRecord {
        WorkRecord {
            cpus: self.cpus,
            error_msg: self.error_msg.clone(),
            job_id: self.job_id.clone(),
            max_mem: self.max_mem,
            mem: self.mem,
            mem_profile: self.mem_profile.clone(),
            n_tries: self.n_tries,
            name: self.name.clone(),
            old_job_ids: self.old_job_ids.clone(),
            params: self.params.clone(),
            partition: self.partition.clone(),
            slurm_status: self.slurm_status,
            status: self.status,
            stderr: self.stderr.clone(),
            stdout: self.stdout.clone(),
            time: self.time.clone(),
        }
    }
}

/// Persisted form of a work package, one element of `work.json`.
///
/// Field order is the sorted key order of the emitted JSON; keep it
/// alphabetical when adding fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRecord {
    pub cpus: u64,
    pub error_msg: Option<String>,
    pub job_id: Option<String>,
    pub max_mem: Option<f64>,
    pub mem: u64,
    pub mem_profile: Option<String>,
    pub n_tries: u32,
    pub name: String,
    pub old_job_ids: Vec<String>,
    pub params: Params,
    pub partition: Option<String>,
    pub slurm_status: Option<Status>,
    pub status: WorkStatus,
    pub stderr: Option<String>,
    pub stdout: Option<String>,
    pub time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(city: &str) -> Params {
        let mut p = Params::new();
        p.insert("city".to_string(), serde_json::json!(city));
        p
    }

    #[test]
    fn fresh_package_is_queued() {
        let wp = WorkPackage::new("job.0".into(), params("x"), 2, 0, None, None);
        assert!(wp.is_queued());
        assert!(!wp.is_scheduled());
        assert_eq!(wp.n_tries, 0);
    }

    #[test]
    fn init_failed_is_terminal() {
        let wp = WorkPackage::init_failed("job.0".into(), params("x"), "no such file".into());
        assert_eq!(wp.status, WorkStatus::Failed);
        assert_eq!(wp.error_msg.as_deref(), Some("no such file"));
        assert!(!wp.is_queued());
    }

    #[test]
    fn encoded_record_keys_are_sorted() {
        let wp = WorkPackage::new("job.0".into(), params("x"), 1, 0, None, None);
        let json = serde_json::to_value(wp.encode()).unwrap();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn status_serialises_screaming_case() {
        let wp = WorkPackage::new("job.0".into(), params("x"), 1, 0, None, None);
        let json = serde_json::to_value(wp.encode()).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert!(json["slurm_status"].is_null());
    }
}
