//! Scheduler settings.

use std::path::{Path, PathBuf};

/// Paths and URLs the scheduler needs.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Absolute home directory holding `cfg/`, `run/` and `archive/`.
    pub home: PathBuf,
    /// Prefix for artifact URLs in event payloads; always ends with `/`.
    pub archive_url: String,
}

impl Settings {
    pub fn new(home: impl Into<PathBuf>, archive_url: impl Into<String>) -> Self {
        let mut archive_url = archive_url.into();
        if !archive_url.ends_with('/') {
            archive_url.push('/');
        }
        Self { home: home.into(), archive_url }
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.home.join("cfg").join("jobs")
    }

    pub fn recipe(&self, job: &str) -> PathBuf {
        self.jobs_dir().join(format!("{job}.run"))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }
}
