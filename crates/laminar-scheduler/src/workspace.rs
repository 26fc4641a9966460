//! Per-run scratch directories, the archive tree and its upkeep.

use std::path::{Path, PathBuf};

use laminar_db::ArtifactRow;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Filesystem layout under the home directory:
/// `run/<job>/<number>` scratch while building,
/// `archive/<job>/<number>` artifacts afterwards, with a `latest`
/// symlink per job.
#[derive(Debug, Clone)]
pub struct Workspace {
    home: PathBuf,
}

impl Workspace {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn rundir(&self, job: &str, number: i64) -> PathBuf {
        self.home.join("run").join(job).join(number.to_string())
    }

    pub fn archive_dir(&self, job: &str, number: i64) -> PathBuf {
        self.home.join("archive").join(job).join(number.to_string())
    }

    /// Enumerate the artifacts a finished run left in its archive
    /// directory. Only regular files count; subdirectories recurse,
    /// symlinks and special files are ignored. A missing directory is
    /// an empty result.
    pub fn collect_artifacts(&self, job: &str, number: i64) -> Vec<ArtifactRow> {
        let root = self.archive_dir(job, number);
        let mut artifacts = Vec::new();
        for entry in WalkDir::new(&root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(job, number, error = %e, "skipping unreadable archive entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let filename = match entry.path().strip_prefix(&root) {
                Ok(rel) => rel.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            let filesize = entry.metadata().map(|m| m.len() as i64).unwrap_or(0);
            artifacts.push(ArtifactRow { filename, filesize });
        }
        artifacts
    }

    /// Point `archive/<job>/latest` at the given build number.
    pub fn update_latest(&self, job: &str, number: i64) {
        let dir = self.home.join("archive").join(job);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(job, error = %e, "could not create archive directory");
            return;
        }
        let link = dir.join("latest");
        let _ = std::fs::remove_file(&link);
        #[cfg(unix)]
        if let Err(e) = std::os::unix::fs::symlink(number.to_string(), &link) {
            warn!(job, number, error = %e, "could not update latest symlink");
        }
    }

    /// Delete old run directories, from `run/<job>/<from>` counting
    /// down to 1 and stopping at the first index that does not exist.
    /// Removal errors are logged and never fatal.
    pub fn prune_rundirs(&self, job: &str, from: i64) {
        for number in (1..=from).rev() {
            let dir = self.rundir(job, number);
            if !dir.exists() {
                break;
            }
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(job, number, error = %e, "could not remove run directory");
            }
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}
