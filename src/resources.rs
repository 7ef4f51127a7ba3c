//! Resource policy: derive the effective resource request for one work
//! package from the job defaults and the configured special cases.
//!
//! Pure with respect to scheduler state; the only side effect is reading
//! file sizes referenced by special-case rules.

use std::path::Path;

use globset::Glob;
use regex::Regex;
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::JobConfig;
use crate::work::Params;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("special case path {path}: param {{{{{param}}}}} is missing or not a scalar")]
    MissingParam { path: String, param: String },

    #[error("special case path {path} does not exist")]
    MissingPath { path: String },

    #[error("cannot measure {path}: {source}")]
    Measure {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid glob {path}: {source}")]
    BadGlob {
        path: String,
        source: globset::Error,
    },
}

/// The resolved request a work package is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveResources {
    pub cpus: u64,
    /// MB; 0 means "scheduler default".
    pub mem: u64,
    pub time: Option<String>,
    pub partition: Option<String>,
}

/// Resolve the request for one parameter bundle. Starts from the job
/// defaults; the first special case whose measured file size falls inside
/// its `[size_min, size_max]` window wins.
pub fn effective_resources(
    job: &JobConfig,
    params: &Params,
) -> Result<EffectiveResources, PolicyError> {
    let defaults = EffectiveResources {
        cpus: job.resources.cpus,
        mem: job.resources.mem.unwrap_or(0),
        time: job.resources.time.clone(),
        partition: job.resources.partition.clone(),
    };

    for case in &job.special_cases {
        let path = interpolate(&case.files.path, params)?;
        let size = files_size(&path)?;
        let min = case.files.size_min.unwrap_or(0);
        let max = case.files.size_max.unwrap_or(u64::MAX);

        if size >= min && size <= max {
            return Ok(EffectiveResources {
                cpus: case.resources.cpus.unwrap_or(defaults.cpus),
                mem: case.resources.mem.or(job.resources.mem).unwrap_or(0),
                time: case.resources.time.clone().or(defaults.time),
                partition: case.resources.partition.clone().or(defaults.partition),
            });
        }
    }

    Ok(defaults)
}

/// Replace `{{var}}` references with the bundle's scalar values.
fn interpolate(template: &str, params: &Params) -> Result<String, PolicyError> {
    let re = Regex::new(r"\{\{(.*?)\}\}").expect("interpolation pattern is valid");
    let mut result = String::new();
    let mut last = 0;

    for caps in re.captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = caps[1].trim();
        let value = params
            .get(name)
            .and_then(scalar_to_string)
            .ok_or_else(|| PolicyError::MissingParam {
                path: template.to_string(),
                param: name.to_string(),
            })?;
        result.push_str(&template[last..whole.start()]);
        result.push_str(&value);
        last = whole.end();
    }
    result.push_str(&template[last..]);
    Ok(result)
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Total size in bytes of the file, directory tree, or glob at `path`.
/// A glob with no matches measures 0; a plain path that does not exist is
/// an error.
fn files_size(path: &str) -> Result<u64, PolicyError> {
    if path.contains('*') {
        return glob_size(path);
    }

    let p = Path::new(path);
    if p.is_dir() {
        let mut total = 0;
        for entry in WalkDir::new(p) {
            let entry = entry.map_err(|e| PolicyError::Measure {
                path: path.to_string(),
                source: e.into(),
            })?;
            if entry.file_type().is_file() {
                total += entry
                    .metadata()
                    .map_err(|e| PolicyError::Measure {
                        path: path.to_string(),
                        source: e.into(),
                    })?
                    .len();
            }
        }
        return Ok(total);
    }

    if !p.is_file() {
        return Err(PolicyError::MissingPath {
            path: path.to_string(),
        });
    }
    p.metadata()
        .map(|m| m.len())
        .map_err(|source| PolicyError::Measure {
            path: path.to_string(),
            source,
        })
}

fn glob_size(pattern: &str) -> Result<u64, PolicyError> {
    let matcher = Glob::new(pattern)
        .map_err(|source| PolicyError::BadGlob {
            path: pattern.to_string(),
            source,
        })?
        .compile_matcher();

    // Walk from the deepest literal directory prefix of the pattern.
    let prefix = pattern.split('*').next().unwrap_or("");
    let root = if prefix.ends_with(std::path::MAIN_SEPARATOR) {
        Path::new(prefix)
    } else {
        Path::new(prefix)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
    };

    let mut total = 0;
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if entry.file_type().is_file() && matcher.is_match(entry.path()) {
            if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilesRule, RawProperties, ResourceOverrides, Resources, SpecialCase};
    use std::io::Write;

    fn params(pairs: &[(&str, serde_json::Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn job_with_cases(cases: Vec<SpecialCase>) -> JobConfig {
        JobConfig {
            name: "j".into(),
            script: "/bin/true".into(),
            log_dir: "/tmp".into(),
            param_files: vec![],
            param_generator_file: None,
            n: None,
            resources: Resources {
                cpus: 2,
                mem: None,
                time: Some("01:00:00".into()),
                partition: None,
                gres: None,
            },
            special_cases: cases,
            properties: RawProperties::default(),
        }
    }

    fn case(path: &str, size_min: Option<u64>, size_max: Option<u64>, cpus: u64) -> SpecialCase {
        SpecialCase {
            name: None,
            files: FilesRule {
                path: path.to_string(),
                size_min,
                size_max,
            },
            resources: ResourceOverrides {
                cpus: Some(cpus),
                ..Default::default()
            },
        }
    }

    #[test]
    fn interpolates_scalar_params() {
        let p = params(&[
            ("city", serde_json::json!("berlin")),
            ("year", serde_json::json!(2021)),
        ]);
        let out = interpolate("/data/{{city}}/{{year}}.gpkg", &p).unwrap();
        assert_eq!(out, "/data/berlin/2021.gpkg");
    }

    #[test]
    fn missing_param_is_an_error() {
        let err = interpolate("/data/{{city}}.gpkg", &Params::new()).unwrap_err();
        assert!(err.to_string().contains("city"), "{err}");
    }

    #[test]
    fn default_resources_when_no_case_matches() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("input.bin");
        std::fs::File::create(&file)
            .unwrap()
            .write_all(&[0u8; 100])
            .unwrap();

        let job = job_with_cases(vec![case(
            file.to_str().unwrap(),
            Some(1_000),
            None,
            16,
        )]);
        let eff = effective_resources(&job, &Params::new()).unwrap();
        assert_eq!(eff.cpus, 2);
        assert_eq!(eff.time.as_deref(), Some("01:00:00"));
    }

    #[test]
    fn first_matching_case_wins() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("input.bin");
        std::fs::File::create(&file)
            .unwrap()
            .write_all(&[0u8; 500])
            .unwrap();
        let path = file.to_str().unwrap();

        let job = job_with_cases(vec![
            case(path, Some(100), Some(1_000), 8),
            case(path, None, None, 32),
        ]);
        let eff = effective_resources(&job, &Params::new()).unwrap();
        assert_eq!(eff.cpus, 8);
    }

    #[test]
    fn directory_sizes_are_summed() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b"] {
            std::fs::File::create(dir.path().join(name))
                .unwrap()
                .write_all(&[0u8; 300])
                .unwrap();
        }
        assert_eq!(files_size(dir.path().to_str().unwrap()).unwrap(), 600);
    }

    #[test]
    fn glob_measures_matches_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("x.gpkg"))
            .unwrap()
            .write_all(&[0u8; 200])
            .unwrap();
        std::fs::File::create(dir.path().join("x.csv"))
            .unwrap()
            .write_all(&[0u8; 999])
            .unwrap();

        let pattern = format!("{}/*.gpkg", dir.path().display());
        assert_eq!(files_size(&pattern).unwrap(), 200);
    }

    #[test]
    fn missing_plain_path_is_an_error() {
        let err = files_size("/nonexistent/input.bin").unwrap_err();
        assert!(matches!(err, PolicyError::MissingPath { .. }));
    }
}
