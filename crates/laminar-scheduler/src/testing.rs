//! In-memory store and controllable launcher for scheduler tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use laminar_core::{Error as CoreError, ExitStatus, LaunchSpec, Launcher, RunHandle};
use laminar_db::{ArtifactRow, BuildRow, BuildStore, CompletedBuild, DbError, DbResult, QueuedBuild};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone)]
struct StoredBuild {
    row: BuildRow,
    output: Vec<u8>,
}

#[derive(Default)]
struct StoreInner {
    builds: Vec<StoredBuild>,
    artifacts: HashMap<(String, i64), Vec<ArtifactRow>>,
}

/// `BuildStore` backed by a vector, with a failure switch for the
/// queue path.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    pub fail_inserts: AtomicBool,
}

impl MemoryStore {
    pub fn row(&self, name: &str, number: i64) -> Option<BuildRow> {
        self.inner
            .lock()
            .builds
            .iter()
            .find(|b| b.row.name == name && b.row.number == number)
            .map(|b| b.row.clone())
    }
}

fn duration(row: &BuildRow) -> Option<i64> {
    match (row.started_at, row.completed_at) {
        (Some(started), Some(completed)) => Some(completed - started),
        _ => None,
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn build_numbers(&self) -> DbResult<HashMap<String, i64>> {
        let inner = self.inner.lock();
        let mut numbers: HashMap<String, i64> = HashMap::new();
        for build in &inner.builds {
            let entry = numbers.entry(build.row.name.clone()).or_insert(0);
            *entry = (*entry).max(build.row.number);
        }
        Ok(numbers)
    }

    async fn insert_queued(&self, build: &QueuedBuild) -> DbResult<()> {
        if self.fail_inserts.load(Ordering::Relaxed) {
            return Err(DbError::Database(sqlx::Error::PoolClosed));
        }
        self.inner.lock().builds.push(StoredBuild {
            row: BuildRow {
                name: build.name.clone(),
                number: build.number,
                queued_at: build.queued_at,
                started_at: None,
                completed_at: None,
                result: None,
                reason: build.reason.clone(),
                parent_job: build.parent_job.clone(),
                parent_build: build.parent_build,
                node: None,
            },
            output: Vec::new(),
        });
        Ok(())
    }

    async fn mark_started(&self, name: &str, number: i64, node: &str, started_at: i64) -> DbResult<()> {
        let mut inner = self.inner.lock();
        if let Some(build) = inner
            .builds
            .iter_mut()
            .find(|b| b.row.name == name && b.row.number == number)
        {
            build.row.node = Some(node.to_string());
            build.row.started_at = Some(started_at);
        }
        Ok(())
    }

    async fn complete(&self, completed: &CompletedBuild<'_>) -> DbResult<()> {
        let mut inner = self.inner.lock();
        if let Some(build) = inner
            .builds
            .iter_mut()
            .find(|b| b.row.name == completed.name && b.row.number == completed.number)
        {
            build.row.completed_at = Some(completed.completed_at);
            build.row.result = Some(completed.result);
            build.output = completed.output.to_vec();
        }
        inner.artifacts.insert(
            (completed.name.to_string(), completed.number),
            completed.artifacts.to_vec(),
        );
        Ok(())
    }

    async fn last_result(&self, name: &str) -> DbResult<Option<i32>> {
        let inner = self.inner.lock();
        Ok(inner
            .builds
            .iter()
            .filter(|b| b.row.name == name && b.row.completed_at.is_some())
            .max_by_key(|b| b.row.completed_at)
            .and_then(|b| b.row.result))
    }

    async fn last_runtime(&self, name: &str) -> DbResult<Option<i64>> {
        let inner = self.inner.lock();
        Ok(inner
            .builds
            .iter()
            .filter(|b| b.row.name == name && b.row.completed_at.is_some())
            .max_by_key(|b| b.row.completed_at)
            .and_then(|b| duration(&b.row)))
    }

    async fn build(&self, name: &str, number: i64) -> DbResult<Option<BuildRow>> {
        Ok(self.row(name, number))
    }

    async fn output(&self, name: &str, number: i64) -> DbResult<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        Ok(inner
            .builds
            .iter()
            .find(|b| b.row.name == name && b.row.number == number && b.row.completed_at.is_some())
            .map(|b| b.output.clone()))
    }

    async fn artifacts(&self, name: &str, number: i64) -> DbResult<Vec<ArtifactRow>> {
        let inner = self.inner.lock();
        Ok(inner
            .artifacts
            .get(&(name.to_string(), number))
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_per_job(&self) -> DbResult<Vec<BuildRow>> {
        let inner = self.inner.lock();
        let mut latest: HashMap<String, BuildRow> = HashMap::new();
        for build in &inner.builds {
            let entry = latest.entry(build.row.name.clone()).or_insert_with(|| build.row.clone());
            if build.row.number > entry.number {
                *entry = build.row.clone();
            }
        }
        let mut rows: Vec<BuildRow> = latest.into_values().collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn recent_completed(&self, limit: i64) -> DbResult<Vec<BuildRow>> {
        let inner = self.inner.lock();
        let mut rows: Vec<BuildRow> = inner
            .builds
            .iter()
            .filter(|b| b.row.completed_at.is_some())
            .map(|b| b.row.clone())
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(r.completed_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn job_page(&self, name: &str, field: &str, desc: bool, limit: i64, offset: i64)
        -> DbResult<Vec<BuildRow>>
    {
        let inner = self.inner.lock();
        let mut rows: Vec<BuildRow> = inner
            .builds
            .iter()
            .filter(|b| b.row.name == name && b.row.result.is_some())
            .map(|b| b.row.clone())
            .collect();
        match field {
            "result" => rows.sort_by_key(|r| (r.result, std::cmp::Reverse(r.number))),
            "started" => rows.sort_by_key(|r| (r.started_at, std::cmp::Reverse(r.number))),
            "duration" => rows.sort_by_key(|r| (duration(r), std::cmp::Reverse(r.number))),
            "number" => rows.sort_by_key(|r| r.number),
            _ => {
                rows.sort_by_key(|r| std::cmp::Reverse(r.number));
                let page: Vec<BuildRow> =
                    rows.into_iter().skip(offset as usize).take(limit as usize).collect();
                return Ok(page);
            }
        }
        if desc {
            rows.reverse();
        }
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn job_stats(&self, name: &str) -> DbResult<(i64, i64)> {
        let inner = self.inner.lock();
        let durations: Vec<i64> = inner
            .builds
            .iter()
            .filter(|b| b.row.name == name && b.row.result.is_some())
            .filter_map(|b| duration(&b.row))
            .collect();
        let count = inner
            .builds
            .iter()
            .filter(|b| b.row.name == name && b.row.result.is_some())
            .count() as i64;
        let average = if durations.is_empty() {
            0
        } else {
            durations.iter().sum::<i64>() / durations.len() as i64
        };
        Ok((count, average))
    }

    async fn last_with_result(&self, name: &str, success: bool) -> DbResult<Option<(i64, i64)>> {
        let inner = self.inner.lock();
        Ok(inner
            .builds
            .iter()
            .filter(|b| {
                b.row.name == name
                    && b.row.result.is_some()
                    && (b.row.result == Some(5)) == success
            })
            .max_by_key(|b| b.row.completed_at)
            .map(|b| (b.row.number, b.row.started_at.unwrap_or(0))))
    }

    async fn completed_counts(&self) -> DbResult<Vec<(String, i64)>> {
        let inner = self.inner.lock();
        let mut counts: HashMap<String, i64> = HashMap::new();
        for build in inner.builds.iter().filter(|b| b.row.result.is_some()) {
            *counts.entry(build.row.name.clone()).or_insert(0) += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn builds_per_day(&self) -> DbResult<Vec<(i32, i64, i64)>> {
        let inner = self.inner.lock();
        let today = now() / 86400;
        let mut counts: HashMap<(i32, i64), i64> = HashMap::new();
        for build in &inner.builds {
            if let (Some(result), Some(completed)) = (build.row.result, build.row.completed_at) {
                let day = today - completed / 86400;
                if day <= 6 {
                    *counts.entry((result, day)).or_insert(0) += 1;
                }
            }
        }
        Ok(counts.into_iter().map(|((r, d), c)| (r, d, c)).collect())
    }

    async fn builds_per_job(&self) -> DbResult<Vec<(String, i64)>> {
        let inner = self.inner.lock();
        let cutoff = now() - 86400;
        let mut counts: HashMap<String, i64> = HashMap::new();
        for build in &inner.builds {
            if build.row.completed_at.is_some_and(|c| c > cutoff) {
                *counts.entry(build.row.name.clone()).or_insert(0) += 1;
            }
        }
        let mut rows: Vec<(String, i64)> = counts.into_iter().collect();
        rows.sort_by_key(|(_, c)| std::cmp::Reverse(*c));
        rows.truncate(5);
        Ok(rows)
    }

    async fn time_per_job(&self) -> DbResult<Vec<(String, f64)>> {
        let inner = self.inner.lock();
        let cutoff = now() - 7 * 86400;
        let mut durations: HashMap<String, Vec<i64>> = HashMap::new();
        for build in &inner.builds {
            if build.row.completed_at.is_some_and(|c| c > cutoff) {
                if let Some(d) = duration(&build.row) {
                    durations.entry(build.row.name.clone()).or_default().push(d);
                }
            }
        }
        Ok(durations
            .into_iter()
            .map(|(name, ds)| {
                let average = ds.iter().sum::<i64>() as f64 / ds.len() as f64;
                (name, average)
            })
            .collect())
    }

    async fn result_changed(&self) -> DbResult<Vec<(String, i64, i64)>> {
        let inner = self.inner.lock();
        let mut stats: HashMap<String, (Option<i64>, Option<i64>)> = HashMap::new();
        for build in &inner.builds {
            if let Some(result) = build.row.result {
                let entry = stats.entry(build.row.name.clone()).or_default();
                if result == 5 {
                    entry.0 = entry.0.max(Some(build.row.number));
                } else {
                    entry.1 = entry.1.max(Some(build.row.number));
                }
            }
        }
        Ok(stats
            .into_iter()
            .filter_map(|(name, (success, failure))| Some((name, success?, failure?)))
            .collect())
    }

    async fn low_pass_rates(&self) -> DbResult<Vec<(String, f64)>> {
        let inner = self.inner.lock();
        let mut totals: HashMap<String, (i64, i64)> = HashMap::new();
        for build in &inner.builds {
            let entry = totals.entry(build.row.name.clone()).or_default();
            entry.1 += 1;
            if build.row.result == Some(5) {
                entry.0 += 1;
            }
        }
        Ok(totals
            .into_iter()
            .map(|(name, (passed, total))| (name, passed as f64 / total as f64))
            .collect())
    }

    async fn build_time_changes(&self) -> DbResult<Vec<(String, String, Option<String>)>> {
        Ok(Vec::new())
    }
}

struct MockProc {
    log_tx: Option<mpsc::UnboundedSender<Bytes>>,
    log_rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    done_tx: Option<oneshot::Sender<ExitStatus>>,
    done_rx: Option<oneshot::Receiver<ExitStatus>>,
}

/// `Launcher` whose builds run until the test pushes log bytes and an
/// exit state.
#[derive(Default)]
pub struct MockLauncher {
    procs: Mutex<HashMap<(String, i64), MockProc>>,
    pub fail_spawn: AtomicBool,
}

impl MockLauncher {
    pub fn emit_log(&self, job: &str, number: i64, chunk: &[u8]) {
        let procs = self.procs.lock();
        if let Some(tx) = procs
            .get(&(job.to_string(), number))
            .and_then(|p| p.log_tx.as_ref())
        {
            let _ = tx.send(Bytes::copy_from_slice(chunk));
        }
    }

    /// Close the build's output stream and resolve its completion.
    pub fn finish(&self, job: &str, number: i64, status: ExitStatus) {
        let mut procs = self.procs.lock();
        if let Some(process) = procs.get_mut(&(job.to_string(), number)) {
            process.log_tx.take();
            if let Some(done) = process.done_tx.take() {
                let _ = done.send(status);
            }
        }
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn spawn(&self, spec: LaunchSpec) -> laminar_core::Result<RunHandle> {
        if self.fail_spawn.load(Ordering::Relaxed) {
            return Err(CoreError::Launch("mock spawn failure".to_string()));
        }
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.procs.lock().insert(
            (spec.job.clone(), spec.number),
            MockProc {
                log_tx: Some(log_tx),
                log_rx: Some(log_rx),
                done_tx: Some(done_tx),
                done_rx: Some(done_rx),
            },
        );
        Ok(RunHandle {
            job: spec.job,
            number: spec.number,
            launcher_id: "mock".to_string(),
        })
    }

    async fn output(&self, handle: &RunHandle) -> laminar_core::Result<BoxStream<'static, Bytes>> {
        let rx = self
            .procs
            .lock()
            .get_mut(&(handle.job.clone(), handle.number))
            .and_then(|p| p.log_rx.take())
            .ok_or_else(|| CoreError::Launch("unknown mock run".to_string()))?;
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
        .boxed())
    }

    async fn wait(&self, handle: &RunHandle) -> laminar_core::Result<ExitStatus> {
        let rx = self
            .procs
            .lock()
            .get_mut(&(handle.job.clone(), handle.number))
            .and_then(|p| p.done_rx.take())
            .ok_or_else(|| CoreError::Launch("unknown mock run".to_string()))?;
        Ok(rx.await.unwrap_or(ExitStatus::Failed))
    }

    async fn abort(&self, handle: &RunHandle) -> laminar_core::Result<()> {
        self.finish(&handle.job, handle.number, ExitStatus::Aborted);
        Ok(())
    }
}
