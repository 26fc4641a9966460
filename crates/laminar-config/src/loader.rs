//! Loaders for the `cfg/` directory layout.

use std::path::Path;

use glob::Pattern;
use tracing::warn;

use crate::{ConfMap, ConfigError, ConfigResult};

/// One `cfg/contexts/<name>.conf` file. `config` is `None` when the
/// file failed to parse; the prior definition then stays in effect.
#[derive(Debug)]
pub struct ContextFile {
    pub name: String,
    pub config: Option<ContextConfig>,
}

#[derive(Debug)]
pub struct ContextConfig {
    pub executors: u32,
    pub job_patterns: Vec<Pattern>,
}

/// One `cfg/jobs/<name>.conf` file, with the same failure convention.
#[derive(Debug)]
pub struct JobFile {
    pub name: String,
    pub config: Option<JobConfig>,
}

#[derive(Debug)]
pub struct JobConfig {
    pub context_patterns: Vec<Pattern>,
    pub description: Option<String>,
    pub timeout: u64,
}

/// Result of scanning the whole `cfg/` tree.
#[derive(Debug)]
pub struct LoadedConfig {
    /// Sorted by context name, which fixes the matching order.
    pub contexts: Vec<ContextFile>,
    pub jobs: Vec<JobFile>,
    /// `None` when groups.conf exists but failed to parse.
    pub groups: Option<Vec<(String, String)>>,
}

/// Presence of the deprecated `cfg/nodes` directory is a hard startup
/// error.
pub fn check_legacy(home: &Path) -> ConfigResult<()> {
    if home.join("cfg").join("nodes").exists() {
        return Err(ConfigError::LegacyNodes);
    }
    Ok(())
}

/// Scan `cfg/` under `home`. Individual file errors are logged and
/// reported through the `config: None` convention; the scan itself
/// never fails.
pub fn load(home: &Path) -> LoadedConfig {
    let mut contexts = Vec::new();
    for (name, path) in conf_files(&home.join("cfg").join("contexts")) {
        let config = match parse_context(&path) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping unparseable context file");
                None
            }
        };
        contexts.push(ContextFile { name, config });
    }
    contexts.sort_by(|a, b| a.name.cmp(&b.name));

    let mut jobs = Vec::new();
    for (name, path) in conf_files(&home.join("cfg").join("jobs")) {
        let config = match parse_job(&path) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping unparseable job file");
                None
            }
        };
        jobs.push(JobFile { name, config });
    }

    let groups_path = home.join("cfg").join("groups.conf");
    let groups = if groups_path.is_file() {
        match ConfMap::load(&groups_path) {
            Ok(conf) => Some(defaulted_groups(conf.entries().to_vec())),
            Err(e) => {
                warn!(file = %groups_path.display(), error = %e, "skipping unparseable groups file");
                None
            }
        }
    } else {
        Some(defaulted_groups(Vec::new()))
    };

    LoadedConfig { contexts, jobs, groups }
}

fn defaulted_groups(groups: Vec<(String, String)>) -> Vec<(String, String)> {
    if groups.is_empty() {
        vec![("All Jobs".to_string(), ".*".to_string())]
    } else {
        groups
    }
}

/// `.conf` files in a directory as `(stem, path)` pairs. A missing
/// directory is the same as an empty one.
fn conf_files(dir: &Path) -> Vec<(String, std::path::PathBuf)> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return files,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "conf") && path.is_file() {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                files.push((stem.to_string(), path));
            }
        }
    }
    files
}

fn parse_context(path: &Path) -> ConfigResult<ContextConfig> {
    let conf = ConfMap::load(path)?;
    let executors = conf.get_int("EXECUTORS", 6)?;
    if executors < 1 {
        return Err(ConfigError::InvalidValue {
            field: "EXECUTORS".to_string(),
            message: format!("must be positive, got {executors}"),
        });
    }
    Ok(ContextConfig {
        executors: executors as u32,
        job_patterns: compile_patterns(conf.get_list("JOBS"))?,
    })
}

fn parse_job(path: &Path) -> ConfigResult<JobConfig> {
    let conf = ConfMap::load(path)?;
    let timeout = conf.get_int("TIMEOUT", 0)?;
    Ok(JobConfig {
        context_patterns: compile_patterns(conf.get_list("CONTEXTS"))?,
        description: conf.get("DESCRIPTION").map(String::from),
        timeout: timeout.max(0) as u64,
    })
}

fn compile_patterns(raw: Vec<String>) -> ConfigResult<Vec<Pattern>> {
    raw.into_iter()
        .map(|p| {
            Pattern::new(&p).map_err(|e| ConfigError::BadPattern {
                pattern: p,
                message: e.to_string(),
            })
        })
        .collect()
}
