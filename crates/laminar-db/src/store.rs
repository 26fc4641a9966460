//! The store capability the scheduler consumes.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::DbResult;

/// A build record as read back from the store.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildRow {
    pub name: String,
    pub number: i64,
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub result: Option<i32>,
    pub reason: Option<String>,
    pub parent_job: Option<String>,
    pub parent_build: Option<i64>,
    pub node: Option<String>,
}

/// One artifact of a completed build, path relative to its archive
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ArtifactRow {
    pub filename: String,
    pub filesize: i64,
}

/// Insert payload for a freshly queued build.
#[derive(Debug)]
pub struct QueuedBuild {
    pub name: String,
    pub number: i64,
    pub queued_at: i64,
    pub reason: Option<String>,
    pub parent_job: Option<String>,
    pub parent_build: Option<i64>,
}

/// Final payload persisted in one transaction when a run ends.
#[derive(Debug)]
pub struct CompletedBuild<'a> {
    pub name: &'a str,
    pub number: i64,
    pub completed_at: i64,
    pub result: i32,
    pub output: &'a [u8],
    pub artifacts: &'a [ArtifactRow],
}

/// Transactional build persistence plus the queries the status
/// projector needs.
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Highest build number per job, for seeding the in-memory counters.
    async fn build_numbers(&self) -> DbResult<HashMap<String, i64>>;

    async fn insert_queued(&self, build: &QueuedBuild) -> DbResult<()>;

    async fn mark_started(&self, name: &str, number: i64, node: &str, started_at: i64) -> DbResult<()>;

    /// Commit the final record, the artifact batch and the aggregate
    /// view refresh in a single transaction.
    async fn complete(&self, build: &CompletedBuild<'_>) -> DbResult<()>;

    /// Result of the most recent completed build of this job.
    async fn last_result(&self, name: &str) -> DbResult<Option<i32>>;

    /// Duration of the most recent completed build of this job.
    async fn last_runtime(&self, name: &str) -> DbResult<Option<i64>>;

    async fn build(&self, name: &str, number: i64) -> DbResult<Option<BuildRow>>;

    async fn output(&self, name: &str, number: i64) -> DbResult<Option<Vec<u8>>>;

    async fn artifacts(&self, name: &str, number: i64) -> DbResult<Vec<ArtifactRow>>;

    /// Latest build per job name.
    async fn latest_per_job(&self) -> DbResult<Vec<BuildRow>>;

    async fn recent_completed(&self, limit: i64) -> DbResult<Vec<BuildRow>>;

    /// One page of a job's completed builds. `field` is matched against
    /// a whitelist; anything unknown falls back to build number.
    async fn job_page(&self, name: &str, field: &str, desc: bool, limit: i64, offset: i64)
        -> DbResult<Vec<BuildRow>>;

    /// Completed-build count and average runtime for one job.
    async fn job_stats(&self, name: &str) -> DbResult<(i64, i64)>;

    /// Most recent build of this job that did (or did not) succeed, as
    /// `(number, started_at)`.
    async fn last_with_result(&self, name: &str, success: bool) -> DbResult<Option<(i64, i64)>>;

    async fn completed_counts(&self) -> DbResult<Vec<(String, i64)>>;

    /// `(result, days_ago, count)` rows over the last 7 days.
    async fn builds_per_day(&self) -> DbResult<Vec<(i32, i64, i64)>>;

    async fn builds_per_job(&self) -> DbResult<Vec<(String, i64)>>;

    async fn time_per_job(&self) -> DbResult<Vec<(String, f64)>>;

    /// `(name, last_success, last_failure)` per job where both exist.
    async fn result_changed(&self) -> DbResult<Vec<(String, i64, i64)>>;

    async fn low_pass_rates(&self) -> DbResult<Vec<(String, f64)>>;

    /// `(name, numbers_csv, durations_csv)` for the most variable jobs.
    async fn build_time_changes(&self) -> DbResult<Vec<(String, String, Option<String>)>>;
}
