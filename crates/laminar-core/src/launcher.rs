//! The subprocess capability the scheduler consumes.
//!
//! The core never sees pids, signals or fork; it sees a handle, a byte
//! stream of merged stdout/stderr, a completion future and an abort.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::run::RunState;
use crate::Result;

/// Everything a launcher needs to start one build.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub job: String,
    pub number: i64,
    /// Context the run was matched to.
    pub context: String,
    /// Scratch directory for the build; created by the launcher.
    pub rundir: PathBuf,
    /// Directory the build drops artifacts into.
    pub archive_dir: PathBuf,
    /// The `.run` recipe to execute.
    pub recipe: PathBuf,
    pub params: HashMap<String, String>,
    /// Most recent completed result of this job, surfaced to the recipe
    /// as the LAST_RESULT environment variable.
    pub last_result: RunState,
}

/// Handle to a spawned build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub job: String,
    pub number: i64,
    /// Launcher-specific identifier (e.g. a pid or container id).
    pub launcher_id: String,
}

/// Final state a build exited with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failed,
    Aborted,
}

impl ExitStatus {
    pub fn as_run_state(self) -> RunState {
        match self {
            ExitStatus::Success => RunState::Success,
            ExitStatus::Failed => RunState::Failed,
            ExitStatus::Aborted => RunState::Aborted,
        }
    }
}

/// Trait for build launchers.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start a build.
    async fn spawn(&self, spec: LaunchSpec) -> Result<RunHandle>;

    /// Stream of merged stdout/stderr bytes. Ends when the build's
    /// output pipes close.
    async fn output(&self, handle: &RunHandle) -> Result<BoxStream<'static, Bytes>>;

    /// Wait for the build to be reaped and return its final state.
    async fn wait(&self, handle: &RunHandle) -> Result<ExitStatus>;

    /// Signal the build to terminate. The completion future still
    /// resolves normally with whatever state results.
    async fn abort(&self, handle: &RunHandle) -> Result<()>;
}
