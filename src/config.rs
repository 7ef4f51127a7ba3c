//! Operator configuration: YAML loading, validation, defaults, and the
//! per-job property merge.
//!
//! Everything downstream of [`load`] works with validated records; the
//! scheduler never re-checks configuration invariants.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::work::Params;

pub const DEFAULT_POLL_INTERVAL: u64 = 30;
pub const DEFAULT_EXP_BACKOFF_FACTOR: u64 = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_FAILURE_THRESHOLD: f64 = 0.25;
pub const DEFAULT_FAILURE_THRESHOLD_ACTIVATION: usize = 50;

pub const MIN_POLL_INTERVAL: u64 = 10;
pub const MAX_POLL_INTERVAL: u64 = 3600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("error parsing config {path}:\n{source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("error loading params from {path}: {message}")]
    Params { path: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub jobs: Vec<JobConfig>,
    #[serde(default)]
    pub properties: RawProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Descriptive name; also the Slurm job name.
    pub name: String,
    /// Absolute path to the user script executed for every work package.
    pub script: PathBuf,
    /// Directory under which the per-run log directory is created.
    pub log_dir: PathBuf,
    /// Files listing parameter bundles (JSON array each).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub param_files: Vec<PathBuf>,
    /// Executable whose stdout is a JSON array of parameter bundles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_generator_file: Option<PathBuf>,
    /// Cap on bundles taken per param file (default: all).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<usize>,
    pub resources: Resources,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub special_cases: Vec<SpecialCase>,
    #[serde(default)]
    pub properties: RawProperties,
}

/// Default resource request for a job's work packages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: u64,
    /// Memory in MB; absent means "scheduler default".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<u64>,
    /// Time limit, `days-hours:min:sec` and shorter forms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gres: Option<String>,
}

/// Resource overrides applied when a special case matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
}

/// Rule that overrides the resource request based on on-disk input sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialCase {
    /// Documenting name only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub files: FilesRule,
    #[serde(default)]
    pub resources: ResourceOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesRule {
    /// File, directory, or glob; may reference params with `{{var}}`.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_max: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Properties as written in the file: everything optional so that per-job
/// sections can override just a subset of the global section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conda_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_work_dir: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp_backoff_factor: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold_activation: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackProperties>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlackProperties {
    pub channel: Option<String>,
    pub token: Option<String>,
}

/// Fully resolved properties for one job: global section overlaid with the
/// job's own, with defaults filled in.
#[derive(Debug, Clone)]
pub struct Properties {
    pub conda_env: String,
    pub account: Option<String>,
    pub log_level: LogLevel,
    pub keep_work_dir: bool,
    pub max_retries: u32,
    pub poll_interval: u64,
    pub exp_backoff_factor: u64,
    pub failure_threshold: f64,
    pub failure_threshold_activation: usize,
    pub slack_channel: Option<String>,
    pub slack_token: Option<String>,
}

impl Config {
    /// Merge the global properties with a job's overrides and apply the
    /// defaults. Only valid on a loaded (validated) config.
    pub fn job_properties(&self, job: &JobConfig) -> Properties {
        let g = &self.properties;
        let j = &job.properties;
        let slack = j.slack.clone().or_else(|| g.slack.clone()).unwrap_or_default();
        Properties {
            conda_env: j
                .conda_env
                .clone()
                .or_else(|| g.conda_env.clone())
                .unwrap_or_default(),
            account: j.account.clone().or_else(|| g.account.clone()),
            log_level: j.log_level.or(g.log_level).unwrap_or(LogLevel::Info),
            keep_work_dir: j.keep_work_dir.or(g.keep_work_dir).unwrap_or(false),
            max_retries: j.max_retries.or(g.max_retries).unwrap_or(DEFAULT_MAX_RETRIES),
            poll_interval: j
                .poll_interval
                .or(g.poll_interval)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            exp_backoff_factor: j
                .exp_backoff_factor
                .or(g.exp_backoff_factor)
                .unwrap_or(DEFAULT_EXP_BACKOFF_FACTOR),
            failure_threshold: j
                .failure_threshold
                .or(g.failure_threshold)
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            failure_threshold_activation: j
                .failure_threshold_activation
                .or(g.failure_threshold_activation)
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD_ACTIVATION),
            slack_channel: slack.channel,
            slack_token: slack.token,
        }
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// Load and validate a configuration file. Fails fast on any schema
/// violation; nothing downstream sees an invalid record.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: Config = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
        path: path.display().to_string(),
        source,
    })?;
    validate(&config)?;
    info!(path = %path.display(), jobs = config.jobs.len(), "loaded config");
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.jobs.is_empty() {
        return Err(ConfigError::Invalid("no jobs configured".to_string()));
    }

    for job in &config.jobs {
        if job.resources.cpus == 0 {
            return Err(ConfigError::Invalid(format!(
                "job {}: resources.cpus must be at least 1",
                job.name
            )));
        }

        // XOR: exactly one source of parameter bundles.
        if job.param_files.is_empty() == job.param_generator_file.is_none() {
            return Err(ConfigError::Invalid(format!(
                "either param_files or param_generator_file must be specified for job {}",
                job.name
            )));
        }

        let props = config.job_properties(job);
        if props.conda_env.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "the conda_env must be specified either in the global properties \
                 section or within job {}'s property section",
                job.name
            )));
        }
        if !(MIN_POLL_INTERVAL..=MAX_POLL_INTERVAL).contains(&props.poll_interval) {
            return Err(ConfigError::Invalid(format!(
                "job {}: poll_interval must be between {MIN_POLL_INTERVAL} and {MAX_POLL_INTERVAL} seconds",
                job.name
            )));
        }
        if !(0.0..=1.0).contains(&props.failure_threshold) {
            return Err(ConfigError::Invalid(format!(
                "job {}: failure_threshold must be between 0.0 and 1.0",
                job.name
            )));
        }
        if props.failure_threshold_activation == 0 {
            return Err(ConfigError::Invalid(format!(
                "job {}: failure_threshold_activation must be at least 1",
                job.name
            )));
        }
        if props.exp_backoff_factor < 1 {
            return Err(ConfigError::Invalid(format!(
                "job {}: exp_backoff_factor must be at least 1",
                job.name
            )));
        }
    }
    Ok(())
}

/// Collect the parameter bundles for one job, from its param files or its
/// generator executable.
pub fn work_params(job: &JobConfig) -> Result<Vec<Params>, ConfigError> {
    if let Some(generator) = &job.param_generator_file {
        return generated_params(generator);
    }

    let mut bundles = Vec::new();
    for file in &job.param_files {
        let raw = std::fs::read_to_string(file).map_err(|e| ConfigError::Params {
            path: file.display().to_string(),
            message: e.to_string(),
        })?;
        let mut parsed: Vec<Params> =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Params {
                path: file.display().to_string(),
                message: e.to_string(),
            })?;
        if let Some(n) = job.n {
            parsed.truncate(n);
        }
        bundles.extend(parsed);
    }
    Ok(bundles)
}

fn generated_params(generator: &Path) -> Result<Vec<Params>, ConfigError> {
    let output = Command::new(generator)
        .output()
        .map_err(|e| ConfigError::Params {
            path: generator.display().to_string(),
            message: format!("failed to run generator: {e}"),
        })?;
    if !output.status.success() {
        return Err(ConfigError::Params {
            path: generator.display().to_string(),
            message: format!(
                "generator exited with status {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr)
            ),
        });
    }
    serde_json::from_slice(&output.stdout).map_err(|e| ConfigError::Params {
        path: generator.display().to_string(),
        message: format!("generator output is not a JSON array of bundles: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
jobs:
  - name: reproject
    script: /opt/pipeline/reproject.sh
    log_dir: /var/log/pipeline
    param_files: [/opt/pipeline/params.json]
    resources:
      cpus: 2
properties:
  conda_env: /opt/conda/envs/pipeline
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let f = write_config(MINIMAL);
        let config = load(f.path()).unwrap();
        let props = config.job_properties(&config.jobs[0]);
        assert_eq!(props.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(props.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(props.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
        assert_eq!(props.log_level, LogLevel::Info);
        assert!(!props.keep_work_dir);
    }

    #[test]
    fn missing_conda_env_is_rejected() {
        let f = write_config(&MINIMAL.replace("properties:\n  conda_env: /opt/conda/envs/pipeline", ""));
        let err = load(f.path()).unwrap_err();
        assert!(err.to_string().contains("conda_env"), "{err}");
    }

    #[test]
    fn param_sources_are_exclusive() {
        let both = MINIMAL.replace(
            "param_files: [/opt/pipeline/params.json]",
            "param_files: [/opt/pipeline/params.json]\n    param_generator_file: /opt/pipeline/gen.sh",
        );
        let f = write_config(&both);
        let err = load(f.path()).unwrap_err();
        assert!(err.to_string().contains("param_files or param_generator_file"), "{err}");

        let neither = MINIMAL.replace("param_files: [/opt/pipeline/params.json]\n    ", "");
        let f = write_config(&neither);
        assert!(load(f.path()).is_err());
    }

    #[test]
    fn poll_interval_bounds_enforced() {
        let f = write_config(&MINIMAL.replace(
            "conda_env: /opt/conda/envs/pipeline",
            "conda_env: /opt/conda/envs/pipeline\n  poll_interval: 5",
        ));
        assert!(load(f.path()).is_err());
    }

    #[test]
    fn job_properties_override_globals() {
        let overridden = MINIMAL.replace(
            "    resources:",
            "    properties:\n      max_retries: 7\n    resources:",
        );
        let f = write_config(&overridden);
        let config = load(f.path()).unwrap();
        let props = config.job_properties(&config.jobs[0]);
        assert_eq!(props.max_retries, 7);
        assert_eq!(props.conda_env, "/opt/conda/envs/pipeline");
    }

    #[test]
    fn param_files_respect_cap() {
        let mut params = tempfile::NamedTempFile::new().unwrap();
        params
            .write_all(br#"[{"city": "a"}, {"city": "b"}, {"city": "c"}]"#)
            .unwrap();

        let job = JobConfig {
            name: "j".into(),
            script: "/bin/true".into(),
            log_dir: "/tmp".into(),
            param_files: vec![params.path().to_path_buf()],
            param_generator_file: None,
            n: Some(2),
            resources: Resources {
                cpus: 1,
                mem: None,
                time: None,
                partition: None,
                gres: None,
            },
            special_cases: vec![],
            properties: RawProperties::default(),
        };
        let bundles = work_params(&job).unwrap();
        assert_eq!(bundles.len(), 2);
    }
}
