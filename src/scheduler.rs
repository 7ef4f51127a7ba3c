//! The control-plane scheduler: drives one job's work packages through the
//! cluster until every package has succeeded or terminally failed.
//!
//! The loop is strictly sequential and single-threaded; all parallelism
//! lives in the cluster. One iteration schedules queued packages, sleeps,
//! classifies observed states, persists a snapshot, and (throttled)
//! notifies the chat sink.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::config::{self, JobConfig, Properties};
use crate::resources;
use crate::slack::Notifier;
use crate::slurm::{
    self, Cluster, SlurmRequest, Status, GPU_MAX_MEM, GPU_MEM_PER_CPU, GPU_PARTITION, IO_PARTITION,
    MAX_ARRAY_SIZE, MAX_MEM, MEM_PER_CPU,
};
use crate::work::{Params, WorkPackage, WorkRecord, WorkStatus};

/// Fast poll used while the run is younger than [`BOOT_PHASE`].
const BOOT_POLL: Duration = Duration::from_secs(3);
const BOOT_PHASE: Duration = Duration::from_secs(300);

/// Status notifications go out every Nth poll.
const STATUS_NOTIFY_POLLS: u64 = 10;

/// Marker in a task's stderr identifying a cancellation that was really an
/// out-of-memory kill.
const OOM_CANCEL_MARKER: &str = "Exceeded job memory limit";

/// Scheduler for one job run. Owns the package queue and the run
/// directory; talks to the cluster and the chat sink only through the
/// injected handles.
pub struct Scheduler<'a, C: Cluster, N: Notifier> {
    job: &'a JobConfig,
    props: Properties,
    cluster: &'a C,
    notifier: Option<&'a N>,
    run_dir: PathBuf,
    workdir: PathBuf,
    task_log_dir: PathBuf,
    work_packages: Vec<WorkPackage>,
    n_total: usize,
    n_init_failed: usize,
    started: Instant,
    /// `(ts, channel)` of the pinned status message, once sent.
    thread: Option<(String, String)>,
}

impl<'a, C: Cluster, N: Notifier> Scheduler<'a, C, N> {
    /// Create the per-run directory tree and an empty queue.
    pub fn new(
        job: &'a JobConfig,
        props: Properties,
        cluster: &'a C,
        notifier: Option<&'a N>,
    ) -> Result<Self> {
        let timestamp = chrono::Local::now().format("%Y-%m-%d--%H-%M-%S");
        let run_dir = job.log_dir.join(format!("{}-{timestamp}", job.name));
        let workdir = run_dir.join("workdir");
        let task_log_dir = run_dir.join("task-logs");
        for dir in [&run_dir, &workdir, &task_log_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create run directory {}", dir.display()))?;
        }

        Ok(Scheduler {
            job,
            props,
            cluster,
            notifier,
            run_dir,
            workdir,
            task_log_dir,
            work_packages: Vec::new(),
            n_total: 0,
            n_init_failed: 0,
            started: Instant::now(),
            thread: None,
        })
    }

    /// Run the job to completion. No error observed while polling or
    /// submitting escapes the loop; only queue initialisation and final
    /// persistence can fail.
    pub fn run(&mut self) -> Result<()> {
        self.init_queue()?;

        while self.pending().next().is_some() {
            self.schedule();
            self.wait();
            self.monitor();
            self.notify_status();
        }

        self.persist_results()?;
        self.notify_final();
        self.cleanup()
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn work_packages(&self) -> &[WorkPackage] {
        &self.work_packages
    }

    // ---------- queue initialisation ----------

    fn init_queue(&mut self) -> Result<()> {
        let bundles = config::work_params(self.job)
            .with_context(|| format!("collect params for job {}", self.job.name))?;

        for (i, params) in bundles.into_iter().enumerate() {
            let name = format!("{}.{i}", self.job.name);
            let wp = match resources::effective_resources(self.job, &params) {
                Ok(r) => WorkPackage::new(name, params, r.cpus, r.mem, r.time, r.partition),
                Err(e) => {
                    error!(name = %name, error = %e, "failed to initialize work package");
                    self.n_init_failed += 1;
                    WorkPackage::init_failed(name, params, e.to_string())
                }
            };
            self.work_packages.push(wp);
        }

        self.n_total = self.work_packages.len();
        info!(total = self.n_total, init_failed = self.n_init_failed, "initialized queue");
        self.persist_work();

        if self.n_total > 0
            && self.n_init_failed > 0
            && self.n_init_failed as f64 / self.n_total as f64 >= self.props.failure_threshold
        {
            self.panic(&format!(
                "{} of {} work packages failed to initialize",
                self.n_init_failed, self.n_total
            ));
        }
        Ok(())
    }

    // ---------- schedule ----------

    fn schedule(&mut self) {
        let queued: Vec<usize> = (0..self.work_packages.len())
            .filter(|&i| self.work_packages[i].is_queued())
            .collect();
        if queued.is_empty() {
            return;
        }
        info!(queued = queued.len(), total = self.n_total, "scheduling new work packages");

        // Group by identical resource request so each group rides in one
        // array, preserving queue order.
        let mut groups: IndexMap<_, Vec<usize>> = IndexMap::new();
        for idx in queued {
            groups
                .entry(self.work_packages[idx].resource_key())
                .or_default()
                .push(idx);
        }
        debug!(groups = groups.len(), "grouped work by resource allocation");

        let chunks: Vec<Vec<usize>> = groups
            .into_values()
            .flat_map(|indices| {
                indices
                    .chunks(MAX_ARRAY_SIZE)
                    .map(<[usize]>::to_vec)
                    .collect::<Vec<_>>()
            })
            .collect();
        for chunk in chunks {
            self.submit_chunk(&chunk);
        }
        self.persist_work();
    }

    fn submit_chunk(&mut self, indices: &[usize]) {
        let bundles: Vec<Params> = indices
            .iter()
            .map(|&i| self.work_packages[i].params.clone())
            .collect();
        let workfile = match self.persist_workfile(&bundles) {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, "failed to persist workfile");
                for &idx in indices {
                    self.decommission(idx, Some(format!("failed to persist workfile: {e}")));
                }
                return;
            }
        };

        let first = &self.work_packages[indices[0]];
        let io_degraded = first.partition.as_deref() == Some(IO_PARTITION);
        // On the io partition the whole chunk runs as one job; logs still
        // need a per-index suffix, which index 0 of the %j pattern covers.
        let (output, error) = if io_degraded {
            ("%j_0.stdout", "%j_0.stderr")
        } else {
            ("%A_%a.stdout", "%A_%a.stderr")
        };
        let req = SlurmRequest {
            job_name: self.job.name.clone(),
            script: self.job.script.clone(),
            conda_env: self.props.conda_env.clone(),
            cpus: first.cpus,
            mem: first.mem,
            time: first.time.clone(),
            partition: first.partition.clone(),
            gres: self.job.resources.gres.clone(),
            account: self.props.account.clone(),
            chdir: self.task_log_dir.clone(),
            output: output.to_string(),
            error: error.to_string(),
            env_vars: Vec::new(),
            args: Vec::new(),
        };
        debug!(
            n = indices.len(),
            cpus = req.cpus,
            mem = req.mem,
            time = ?req.time,
            partition = ?req.partition,
            "submitting chunk"
        );

        match self.cluster.submit_array(&workfile, indices.len(), &req) {
            Ok((job_id, task_ids)) => {
                for (i, &idx) in indices.iter().enumerate() {
                    // Empty task list means io degradation: synthesise
                    // per-index ids so log paths stay unambiguous.
                    let task_id = task_ids
                        .get(i)
                        .cloned()
                        .unwrap_or_else(|| format!("{job_id}_{i}"));
                    let wp = &mut self.work_packages[idx];
                    wp.n_tries += 1;
                    wp.stdout = Some(
                        self.task_log_dir
                            .join(format!("{task_id}.stdout"))
                            .display()
                            .to_string(),
                    );
                    wp.stderr = Some(
                        self.task_log_dir
                            .join(format!("{task_id}.stderr"))
                            .display()
                            .to_string(),
                    );
                    wp.mem_profile = Some(
                        self.task_log_dir
                            .join(format!("mprofile_{task_id}.dat"))
                            .display()
                            .to_string(),
                    );
                    wp.job_id = Some(task_id);
                }
            }
            Err(e) => {
                error!(error = %e, "failed to submit job array");
                for &idx in indices {
                    self.decommission(idx, Some(e.to_string()));
                }
            }
        }
    }

    // ---------- wait ----------

    fn wait(&self) {
        let poll = Duration::from_secs(self.props.poll_interval);
        // Short-circuit the boot phase so small runs finish quickly.
        let interval = if self.started.elapsed() < BOOT_PHASE {
            poll.min(BOOT_POLL)
        } else {
            poll
        };
        debug!(seconds = interval.as_secs(), "waiting until next poll");
        std::thread::sleep(interval);
    }

    // ---------- monitor ----------

    fn monitor(&mut self) {
        let scheduled = self.work_packages.iter().filter(|wp| wp.is_scheduled()).count();
        info!(scheduled, total = self.n_total, "monitoring scheduled work packages");

        for idx in 0..self.work_packages.len() {
            if !self.work_packages[idx].is_scheduled() {
                continue;
            }
            let job_id = self.work_packages[idx]
                .job_id
                .clone()
                .expect("scheduled package has a job id");

            let status = match self.cluster.status(&job_id) {
                Ok(status) => status,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "failed to determine job status");
                    self.decommission(idx, Some(e.to_string()));
                    continue;
                }
            };
            self.work_packages[idx].slurm_status = Some(status);

            match status {
                Status::Completed => self.process_success(idx),
                Status::Timeout => self.process_timeout(idx),
                Status::OutOfMemory => self.process_oom(idx),
                Status::Cancelled => self.process_cancellation(idx),
                Status::Failed => self.process_failure(idx),
                s if s.is_retryable() => self.requeue(idx),
                s if s.is_active() => {}
                _ => self.process_unknown(idx),
            }
        }

        self.persist_work();

        if let Some(reason) = self.runtime_threshold_tripped() {
            self.panic(&reason);
        }
    }

    fn process_success(&mut self, idx: usize) {
        let wp = &mut self.work_packages[idx];
        wp.status = WorkStatus::Succeeded;
        wp.max_mem = wp.mem_profile.as_deref().and_then(read_peak_mem);
        debug!(name = %wp.name, job_id = ?wp.job_id, "job succeeded, removing from queue");
    }

    fn process_failure(&mut self, idx: usize) {
        let wp = &self.work_packages[idx];
        error!(name = %wp.name, job_id = ?wp.job_id, stderr = ?wp.stderr, "job failed, removing from queue");
        self.decommission(idx, None);
    }

    fn process_timeout(&mut self, idx: usize) {
        let factor = self.props.exp_backoff_factor;
        let wp = &mut self.work_packages[idx];
        let minutes = slurm::parse_time(wp.time.as_deref())
            .map(|d| (d.as_secs() + 30) / 60)
            .unwrap_or(0);

        if minutes == 0 {
            // No explicit limit to scale; resubmit unchanged.
            warn!(name = %wp.name, "job timed out without an explicit time limit, requeueing");
            self.requeue(idx);
            return;
        }

        let scaled = minutes * factor;
        wp.time = Some(scaled.to_string());
        error!(
            name = %wp.name,
            job_id = ?wp.job_id,
            minutes = scaled,
            "job ran into timeout, rescheduling with a higher limit"
        );
        self.requeue(idx);
    }

    fn process_oom(&mut self, idx: usize) {
        let factor = self.props.exp_backoff_factor;
        let wp = &self.work_packages[idx];
        let gpu = wp.partition.as_deref() == Some(GPU_PARTITION);
        let (mem_per_cpu, max_mem) = if gpu {
            (GPU_MEM_PER_CPU, GPU_MAX_MEM)
        } else {
            (MEM_PER_CPU, MAX_MEM)
        };

        let current = if wp.mem > 0 {
            wp.mem
        } else {
            wp.cpus * mem_per_cpu
        };
        if current >= max_mem {
            error!(
                name = %wp.name,
                job_id = ?wp.job_id,
                max_mem,
                "job ran out of memory at the partition maximum, removing from queue"
            );
            self.decommission(
                idx,
                Some(format!("out of memory at the partition limit ({max_mem} MB)")),
            );
            return;
        }

        let scaled = (current * factor).min(max_mem);
        let wp = &mut self.work_packages[idx];
        wp.mem = scaled;
        error!(
            name = %wp.name,
            job_id = ?wp.job_id,
            mem = scaled,
            "job ran out of memory, rescheduling with more memory"
        );
        self.requeue(idx);
    }

    fn process_cancellation(&mut self, idx: usize) {
        if self.was_oom_cancellation(idx) {
            self.process_oom(idx);
        } else {
            let wp = &self.work_packages[idx];
            error!(name = %wp.name, job_id = ?wp.job_id, "job was cancelled, removing from queue");
            self.decommission(idx, Some("job was cancelled".to_string()));
        }
    }

    /// Some clusters report memory kills as CANCELLED; the tell is in the
    /// task's stderr.
    fn was_oom_cancellation(&self, idx: usize) -> bool {
        self.work_packages[idx]
            .stderr
            .as_deref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .is_some_and(|log| log.contains(OOM_CANCEL_MARKER))
    }

    fn process_unknown(&mut self, idx: usize) {
        let wp = &self.work_packages[idx];
        let status = wp.slurm_status.map(Status::as_str).unwrap_or("UNKNOWN");
        error!(name = %wp.name, job_id = ?wp.job_id, status, "unknown status, removing from queue");
        self.decommission(idx, Some(format!("unknown status {status}")));
    }

    /// Put a package back onto the queue, or fail it terminally once its
    /// submissions are exhausted. `n_tries` counts submissions, so the
    /// guard allows exactly `max_retries + 1` of them.
    fn requeue(&mut self, idx: usize) {
        let max_retries = self.props.max_retries;
        let wp = &mut self.work_packages[idx];
        if wp.n_tries > max_retries {
            error!(
                name = %wp.name,
                n_tries = wp.n_tries,
                "failed after exhausting all retries, removing from queue"
            );
            self.decommission(idx, Some(format!("no retries left after {max_retries} retries")));
            return;
        }
        if let Some(job_id) = wp.job_id.take() {
            wp.old_job_ids.push(job_id);
        }
    }

    fn decommission(&mut self, idx: usize, error_msg: Option<String>) {
        let wp = &mut self.work_packages[idx];
        if error_msg.is_some() {
            wp.error_msg = error_msg;
        }
        wp.status = WorkStatus::Failed;
    }

    // ---------- failure threshold & panic ----------

    fn runtime_threshold_tripped(&self) -> Option<String> {
        let failed = self.count(WorkStatus::Failed);
        let succeeded = self.count(WorkStatus::Succeeded);
        let runtime_failed = failed.saturating_sub(self.n_init_failed);
        let processed = succeeded + runtime_failed;

        if processed < self.props.failure_threshold_activation {
            return None;
        }
        let rate = runtime_failed as f64 / processed as f64;
        if rate >= self.props.failure_threshold {
            Some(format!(
                "{runtime_failed} of {processed} processed work packages failed \
                 (threshold {})",
                self.props.failure_threshold
            ))
        } else {
            None
        }
    }

    /// Abort the run: fail every pending package and cancel the scheduled
    /// ones (best-effort). The main loop then drains naturally.
    fn panic(&mut self, reason: &str) {
        error!(reason, "panic: aborting all remaining work");

        for idx in 0..self.work_packages.len() {
            if self.work_packages[idx].status != WorkStatus::Pending {
                continue;
            }
            if let Some(job_id) = self.work_packages[idx].job_id.clone() {
                if let Err(e) = self.cluster.cancel(&job_id) {
                    warn!(job_id = %job_id, error = %e, "failed to cancel job");
                }
            }
            let wp = &mut self.work_packages[idx];
            wp.status = WorkStatus::Failed;
            wp.error_msg = Some(format!("Panic! {reason}"));
        }
        self.persist_work();
    }

    // ---------- notifications ----------

    fn notify_status(&mut self) {
        let Some(notifier) = self.notifier else {
            return;
        };
        if !self.every_n_polls(STATUS_NOTIFY_POLLS) {
            return;
        }

        let text = self.status_message();
        match &self.thread {
            Some((ts, _)) => {
                if let Err(e) = notifier.update(&text, ts) {
                    warn!(error = %e, "failed to update status message");
                }
            }
            None => match notifier.send(&text, None) {
                Ok(ids) => self.thread = Some(ids),
                Err(e) => warn!(error = %e, "failed to send status message"),
            },
        }
    }

    fn notify_final(&self) {
        let Some(notifier) = self.notifier else {
            info!("no notification hook configured; consider adding a Slack channel and token");
            return;
        };

        let succeeded = self.count(WorkStatus::Succeeded);
        let failed = self.count(WorkStatus::Failed);
        let mut text = format!(
            "⌛  Job {} finished after {}.\n🎉  {succeeded} of {} work packages succeeded.",
            self.job.name,
            format_duration(self.started.elapsed()),
            self.n_total,
        );
        if failed > 0 {
            text.push_str(&format!("\n⚠️  {failed} failed."));
        }

        let thread = self.thread.as_ref().map(|(ts, _)| ts.as_str());
        if let Err(e) = notifier.send(&text, thread) {
            warn!(error = %e, "failed to send final notification");
        }
    }

    fn status_message(&self) -> String {
        let scheduled = self.work_packages.iter().filter(|wp| wp.is_scheduled()).count();
        format!(
            "⏳  Job {}: {} pending ({scheduled} scheduled), {} succeeded, {} failed of {} \
             work packages after {}.",
            self.job.name,
            self.pending().count(),
            self.count(WorkStatus::Succeeded),
            self.count(WorkStatus::Failed),
            self.n_total,
            format_duration(self.started.elapsed()),
        )
    }

    /// Deterministic "every Nth poll" trigger that needs no counter and
    /// tolerates missed iterations.
    fn every_n_polls(&self, n: u64) -> bool {
        every_n_polls_at(self.started.elapsed().as_secs_f64(), self.props.poll_interval, n)
    }

    // ---------- persistence ----------

    /// Snapshot every package to `work.json`. Write failures are logged
    /// and never abort the loop.
    fn persist_work(&self) {
        if let Err(e) = self.write_records("work.json", None) {
            error!(error = %e, "failed to persist work state");
        }
    }

    fn persist_results(&self) -> Result<()> {
        info!("all pending work processed, persisting results");
        self.write_records("succeeded-work.json", Some(WorkStatus::Succeeded))?;
        self.write_records("failed-work.json", Some(WorkStatus::Failed))?;
        Ok(())
    }

    fn write_records(&self, filename: &str, filter: Option<WorkStatus>) -> Result<()> {
        let records: Vec<WorkRecord> = self
            .work_packages
            .iter()
            .filter(|wp| filter.is_none_or(|s| wp.status == s))
            .map(WorkPackage::encode)
            .collect();
        write_json_atomic(&self.run_dir.join(filename), &records)
    }

    fn persist_workfile(&self, bundles: &[Params]) -> Result<PathBuf> {
        let name = format!("{}-workfile.json", Ulid::new().to_string().to_lowercase());
        let path = self.workdir.join(name);
        write_json_atomic(&path, &bundles)?;
        Ok(path)
    }

    fn cleanup(&self) -> Result<()> {
        if self.props.keep_work_dir {
            return Ok(());
        }
        info!("cleaning up temporary resources");
        std::fs::remove_dir_all(&self.workdir)
            .with_context(|| format!("remove workdir {}", self.workdir.display()))
    }

    // ---------- queue views ----------

    fn pending(&self) -> impl Iterator<Item = &WorkPackage> + '_ {
        self.work_packages
            .iter()
            .filter(|wp| wp.status == WorkStatus::Pending)
    }

    fn count(&self, status: WorkStatus) -> usize {
        self.work_packages
            .iter()
            .filter(|wp| wp.status == status)
            .count()
    }
}

/// True when `duration`, rounded to the nearest whole poll, lands on a
/// multiple of `n` polls.
fn every_n_polls_at(duration_secs: f64, poll_interval: u64, n: u64) -> bool {
    if poll_interval == 0 || n == 0 {
        return true;
    }
    let polls = (duration_secs / poll_interval as f64).round() as u64;
    polls % n == 0
}

/// Peak memory in MB from a `mprof`-style profile: `MEM <mb> <timestamp>`
/// lines.
fn read_peak_mem(path: &str) -> Option<f64> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents
        .lines()
        .filter_map(|line| line.strip_prefix("MEM "))
        .filter_map(|rest| rest.split_whitespace().next())
        .filter_map(|field| field.parse::<f64>().ok())
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
}

fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Serialize to pretty JSON (4-space indent) and replace `path` atomically
/// so readers always see a complete snapshot.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut ser)
        .with_context(|| format!("serialize {}", path.display()))?;

    let dir = path.parent().context("target path has no parent")?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(&buf)
        .with_context(|| format!("write {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_n_polls_rounds_to_nearest_poll() {
        assert!(every_n_polls_at(100.0, 4, 25));
        assert!(every_n_polls_at(100.0, 9, 11));
        assert!(!every_n_polls_at(100.0, 9, 12));
    }

    #[test]
    fn every_n_polls_true_at_start() {
        assert!(every_n_polls_at(0.0, 30, 10));
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1:02:05");
        assert_eq!(format_duration(Duration::from_secs(90_000)), "25:00:00");
    }

    #[test]
    fn peak_mem_takes_the_maximum_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mprofile_1_0.dat");
        std::fs::write(
            &path,
            "CMDLINE python task.py\nMEM 120.5 1000.0\nMEM 512.25 1001.0\nMEM 300.0 1002.0\n",
        )
        .unwrap();
        assert_eq!(read_peak_mem(path.to_str().unwrap()), Some(512.25));
    }

    #[test]
    fn peak_mem_absent_file_is_none() {
        assert_eq!(read_peak_mem("/nonexistent/mprofile.dat"), None);
    }

    #[test]
    fn atomic_write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.json");
        let value = serde_json::json!([{"a": 1}]);

        write_json_atomic(&path, &value).unwrap();
        let first = std::fs::read(&path).unwrap();
        write_json_atomic(&path, &value).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }
}
