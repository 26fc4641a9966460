//! Status snapshots: JSON projections of scheduler state plus
//! persisted history, one per monitoring scope.

use laminar_core::RunState;
use laminar_db::BuildRow;
use serde_json::{json, Map, Value};

use crate::dispatcher::Scheduler;
use crate::Result;

const RUNS_PER_PAGE: i64 = 20;

/// Which snapshot a client wants.
#[derive(Debug, Clone)]
pub enum StatusRequest {
    Home,
    All,
    Job { name: String, page: i64, field: String, desc: bool },
    Run { name: String, number: i64 },
}

/// State a persisted row is in, for display purposes.
fn row_state(row: &BuildRow) -> RunState {
    if row.completed_at.is_some() {
        RunState::from_db(row.result)
    } else if row.started_at.is_some() {
        RunState::Running
    } else {
        RunState::Queued
    }
}

fn csv_numbers(csv: &str) -> Vec<i64> {
    csv.split(',').filter_map(|n| n.parse().ok()).collect()
}

impl Scheduler {
    pub(crate) async fn status_snapshot(&self, request: &StatusRequest) -> Result<Value> {
        let data = match request {
            StatusRequest::Home => self.home_status().await?,
            StatusRequest::All => self.all_status().await?,
            StatusRequest::Job { name, page, field, desc } => {
                self.job_status(name, *page, field, *desc).await?
            }
            StatusRequest::Run { name, number } => self.run_status(name, *number).await?,
        };
        Ok(json!({
            "type": "status",
            "title": std::env::var("LAMINAR_TITLE").unwrap_or_else(|_| "Laminar".to_string()),
            "version": env!("CARGO_PKG_VERSION"),
            "time": chrono::Utc::now().timestamp(),
            "data": data,
        }))
    }

    async fn run_status(&self, name: &str, number: i64) -> Result<Value> {
        let mut data = Map::new();
        let row = self.store.build(name, number).await?;
        let mut is_completed = false;
        if let Some(row) = &row {
            is_completed = row.completed_at.is_some();
            data.insert("queued".into(), json!(row.queued_at));
            data.insert("started".into(), json!(row.started_at.unwrap_or(0)));
            if let Some(completed) = row.completed_at {
                data.insert("completed".into(), json!(completed));
            }
            data.insert("result".into(), json!(row_state(row).to_string()));
            data.insert("reason".into(), json!(row.reason.clone().unwrap_or_default()));
            data.insert(
                "upstream".into(),
                json!({
                    "name": row.parent_job.clone().unwrap_or_default(),
                    "num": row.parent_build.unwrap_or(0),
                }),
            );
            if let Some(started) = row.started_at {
                if let Some(runtime) = self.store.last_runtime(name).await? {
                    data.insert("etc".into(), json!(started + runtime));
                }
            }
        }
        if let Some(latest) = self.build_numbers.get(name) {
            data.insert("latestNum".into(), json!(latest));
        }

        // a finished run's artifacts come from the store, a live one's
        // from the archive tree as it fills up
        let artifacts = if is_completed {
            self.store.artifacts(name, number).await?
        } else {
            self.workspace.collect_artifacts(name, number)
        };
        let artifacts: Vec<Value> = artifacts
            .iter()
            .map(|a| {
                json!({
                    "url": format!("{}{}/{}/{}", self.settings.archive_url, name, number, a.filename),
                    "filename": a.filename,
                    "size": a.filesize,
                })
            })
            .collect();
        data.insert("artifacts".into(), Value::Array(artifacts));
        Ok(Value::Object(data))
    }

    async fn job_status(&self, name: &str, page: i64, field: &str, desc: bool) -> Result<Value> {
        let mut data = Map::new();

        let rows = self
            .store
            .job_page(name, field, desc, RUNS_PER_PAGE, page * RUNS_PER_PAGE)
            .await?;
        let recent: Vec<Value> = rows
            .iter()
            .map(|row| {
                json!({
                    "number": row.number,
                    "completed": row.completed_at.unwrap_or(0),
                    "started": row.started_at.unwrap_or(0),
                    "result": RunState::from_db(row.result).to_string(),
                    "reason": row.reason.clone().unwrap_or_default(),
                })
            })
            .collect();
        data.insert("recent".into(), Value::Array(recent));

        let (completed_count, average_runtime) = self.store.job_stats(name).await?;
        data.insert("averageRuntime".into(), json!(average_runtime));
        data.insert("pages".into(), json!((completed_count - 1) / RUNS_PER_PAGE + 1));
        data.insert(
            "sort".into(),
            json!({
                "page": page,
                "field": field,
                "order": if desc { "dsc" } else { "asc" },
            }),
        );

        let running: Vec<Value> = self
            .active
            .job_numbers(name)
            .into_iter()
            .filter_map(|number| self.active.get(name, number))
            .map(|run| {
                json!({
                    "number": run.number,
                    "context": run.context.as_ref().map(|c| c.name().to_string()).unwrap_or_default(),
                    "started": run.started_at.unwrap_or(0),
                    "result": run.state().to_string(),
                    "reason": run.reason(),
                })
            })
            .collect();
        data.insert("running".into(), Value::Array(running));

        let queued: Vec<Value> = self
            .queue
            .iter()
            .filter(|run| run.name == name)
            .map(|run| {
                json!({
                    "number": run.number,
                    "result": run.state().to_string(),
                    "reason": run.reason(),
                })
            })
            .collect();
        data.insert("queued".into(), Value::Array(queued));

        if let Some((number, started)) = self.store.last_with_result(name, true).await? {
            data.insert("lastSuccess".into(), json!({"number": number, "started": started}));
        }
        if let Some((number, started)) = self.store.last_with_result(name, false).await? {
            data.insert("lastFailed".into(), json!({"number": number, "started": started}));
        }

        let description = self
            .job_specs
            .get(name)
            .and_then(|spec| spec.description.clone())
            .unwrap_or_default();
        data.insert("description".into(), json!(description));
        Ok(Value::Object(data))
    }

    async fn all_status(&self) -> Result<Value> {
        let mut data = Map::new();

        let jobs: Vec<Value> = self
            .store
            .latest_per_job()
            .await?
            .iter()
            .map(|row| {
                json!({
                    "name": row.name,
                    "number": row.number,
                    "result": RunState::from_db(row.result).to_string(),
                    "started": row.started_at.unwrap_or(0),
                    "completed": row.completed_at.unwrap_or(0),
                    "reason": row.reason.clone().unwrap_or_default(),
                })
            })
            .collect();
        data.insert("jobs".into(), Value::Array(jobs));

        let running: Vec<Value> = self
            .active
            .iter_by_start()
            .map(|run| {
                json!({
                    "name": run.name,
                    "number": run.number,
                    "context": run.context.as_ref().map(|c| c.name().to_string()).unwrap_or_default(),
                    "started": run.started_at.unwrap_or(0),
                })
            })
            .collect();
        data.insert("running".into(), Value::Array(running));

        let mut groups = Map::new();
        for (group, pattern) in &self.groups {
            groups.insert(group.clone(), json!(pattern));
        }
        data.insert("groups".into(), Value::Object(groups));
        Ok(Value::Object(data))
    }

    async fn home_status(&self) -> Result<Value> {
        let mut data = Map::new();

        let recent: Vec<Value> = self
            .store
            .recent_completed(20)
            .await?
            .iter()
            .map(|row| {
                json!({
                    "name": row.name,
                    "number": row.number,
                    "context": row.node.clone().unwrap_or_default(),
                    "queued": row.queued_at,
                    "started": row.started_at.unwrap_or(0),
                    "completed": row.completed_at.unwrap_or(0),
                    "result": RunState::from_db(row.result).to_string(),
                    "reason": row.reason.clone().unwrap_or_default(),
                })
            })
            .collect();
        data.insert("recent".into(), Value::Array(recent));

        let mut running = Vec::new();
        for run in self.active.iter_by_start() {
            let mut entry = Map::new();
            entry.insert("name".into(), json!(run.name));
            entry.insert("number".into(), json!(run.number));
            entry.insert(
                "context".into(),
                json!(run.context.as_ref().map(|c| c.name().to_string()).unwrap_or_default()),
            );
            entry.insert("started".into(), json!(run.started_at.unwrap_or(0)));
            if let (Some(started), Some(runtime)) =
                (run.started_at, self.store.last_runtime(&run.name).await?)
            {
                entry.insert("etc".into(), json!(started + runtime));
            }
            running.push(Value::Object(entry));
        }
        data.insert("running".into(), Value::Array(running));

        let queued: Vec<Value> = self
            .queue
            .iter()
            .map(|run| {
                json!({
                    "name": run.name,
                    "number": run.number,
                    "result": run.state().to_string(),
                })
            })
            .collect();
        data.insert("queued".into(), Value::Array(queued));

        let executors_total: u32 = self.contexts.iter().map(|c| c.executors()).sum();
        let executors_busy: u32 = self.contexts.iter().map(|c| c.busy()).sum();
        data.insert("executorsTotal".into(), json!(executors_total));
        data.insert("executorsBusy".into(), json!(executors_busy));

        let per_day = self.store.builds_per_day().await?;
        let mut builds_per_day = Vec::new();
        for day in (0..=6).rev() {
            let mut bucket = Map::new();
            for (result, _, count) in per_day.iter().filter(|(_, d, _)| *d == day) {
                bucket.insert(RunState::from_db(Some(*result)).to_string(), json!(count));
            }
            builds_per_day.push(Value::Object(bucket));
        }
        data.insert("buildsPerDay".into(), Value::Array(builds_per_day));

        let mut builds_per_job = Map::new();
        for (job, count) in self.store.builds_per_job().await? {
            builds_per_job.insert(job, json!(count));
        }
        data.insert("buildsPerJob".into(), Value::Object(builds_per_job));

        let mut time_per_job = Map::new();
        for (job, average) in self.store.time_per_job().await? {
            time_per_job.insert(job, json!(average));
        }
        data.insert("timePerJob".into(), Value::Object(time_per_job));

        let result_changed: Vec<Value> = self
            .store
            .result_changed()
            .await?
            .iter()
            .map(|(job, last_success, last_failure)| {
                json!({
                    "name": job,
                    "lastSuccess": last_success,
                    "lastFailure": last_failure,
                })
            })
            .collect();
        data.insert("resultChanged".into(), Value::Array(result_changed));

        let low_pass_rates: Vec<Value> = self
            .store
            .low_pass_rates()
            .await?
            .iter()
            .map(|(job, pass_rate)| json!({"name": job, "passRate": pass_rate}))
            .collect();
        data.insert("lowPassRates".into(), Value::Array(low_pass_rates));

        let build_time_changes: Vec<Value> = self
            .store
            .build_time_changes()
            .await?
            .iter()
            .map(|(job, numbers, durations)| {
                json!({
                    "name": job,
                    "numbers": csv_numbers(numbers),
                    "durations": csv_numbers(durations.as_deref().unwrap_or("")),
                })
            })
            .collect();
        data.insert("buildTimeChanges".into(), Value::Array(build_time_changes));

        let mut completed_counts = Map::new();
        for (job, count) in self.store.completed_counts().await? {
            completed_counts.insert(job, json!(count));
        }
        data.insert("completedCounts".into(), Value::Object(completed_counts));

        Ok(Value::Object(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Scheduler;
    use crate::testing::{MemoryStore, MockLauncher};
    use crate::Settings;
    use laminar_core::JobSpec;
    use laminar_db::{ArtifactRow, BuildStore, CompletedBuild, QueuedBuild};
    use std::sync::Arc;

    fn scheduler_with(store: Arc<MemoryStore>) -> Scheduler {
        let settings = Settings::new("/tmp/laminar-status-test", "/archive/");
        let (_, scheduler) = Scheduler::new(settings, store, Arc::new(MockLauncher::default()));
        scheduler
    }

    async fn seed_completed(store: &MemoryStore, name: &str, number: i64, result: i32) {
        let now = chrono::Utc::now().timestamp();
        store
            .insert_queued(&QueuedBuild {
                name: name.to_string(),
                number,
                queued_at: now - 300 + number,
                reason: Some("test".to_string()),
                parent_job: None,
                parent_build: None,
            })
            .await
            .unwrap();
        store.mark_started(name, number, "default", now - 200 + number).await.unwrap();
        store
            .complete(&CompletedBuild {
                name,
                number,
                completed_at: now - 100 + number,
                result,
                output: b"done\n",
                artifacts: &[ArtifactRow { filename: "out.bin".to_string(), filesize: 4 }],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn run_scope_reports_the_finished_build() {
        let store = Arc::new(MemoryStore::default());
        seed_completed(&store, "foo", 1, 5).await;
        let mut scheduler = scheduler_with(store);
        scheduler.build_numbers.insert("foo".to_string(), 1);

        let status = scheduler
            .status_snapshot(&StatusRequest::Run { name: "foo".into(), number: 1 })
            .await
            .unwrap();
        assert_eq!(status["type"], "status");
        let data = &status["data"];
        assert_eq!(data["result"], "success");
        assert_eq!(data["reason"], "test");
        assert_eq!(data["latestNum"], 1);
        assert_eq!(data["artifacts"][0]["filename"], "out.bin");
        assert_eq!(data["artifacts"][0]["url"], "/archive/foo/1/out.bin");
    }

    #[tokio::test]
    async fn job_scope_paginates_and_describes() {
        let store = Arc::new(MemoryStore::default());
        for number in 1..=3 {
            seed_completed(&store, "foo", number, if number == 2 { 4 } else { 5 }).await;
        }
        let mut scheduler = scheduler_with(store);
        scheduler.job_specs.insert(
            "foo".to_string(),
            JobSpec { description: Some("builds foo".to_string()), ..JobSpec::default() },
        );

        let status = scheduler
            .status_snapshot(&StatusRequest::Job {
                name: "foo".into(),
                page: 0,
                field: "number".into(),
                desc: true,
            })
            .await
            .unwrap();
        let data = &status["data"];
        assert_eq!(data["recent"][0]["number"], 3);
        assert_eq!(data["recent"][2]["number"], 1);
        assert_eq!(data["pages"], 1);
        assert_eq!(data["sort"]["order"], "dsc");
        assert_eq!(data["description"], "builds foo");
        assert_eq!(data["lastSuccess"]["number"], 3);
        assert_eq!(data["lastFailed"]["number"], 2);
    }

    #[tokio::test]
    async fn all_scope_lists_jobs_and_groups() {
        let store = Arc::new(MemoryStore::default());
        seed_completed(&store, "alpha", 2, 5).await;
        seed_completed(&store, "beta", 7, 4).await;
        let mut scheduler = scheduler_with(store);
        scheduler.groups = vec![("All Jobs".to_string(), ".*".to_string())];

        let status = scheduler.status_snapshot(&StatusRequest::All).await.unwrap();
        let data = &status["data"];
        assert_eq!(data["jobs"][0]["name"], "alpha");
        assert_eq!(data["jobs"][0]["result"], "success");
        assert_eq!(data["jobs"][1]["number"], 7);
        assert_eq!(data["groups"]["All Jobs"], ".*");
    }

    #[tokio::test]
    async fn home_scope_aggregates() {
        let store = Arc::new(MemoryStore::default());
        seed_completed(&store, "foo", 1, 5).await;
        seed_completed(&store, "foo", 2, 4).await;
        let mut scheduler = scheduler_with(store);
        scheduler.contexts.push(Arc::new(laminar_core::Context::new("default", 2, Vec::new())));

        let status = scheduler.status_snapshot(&StatusRequest::Home).await.unwrap();
        let data = &status["data"];
        assert_eq!(data["recent"][0]["number"], 2);
        assert_eq!(data["executorsTotal"], 2);
        assert_eq!(data["executorsBusy"], 0);
        assert_eq!(data["buildsPerDay"].as_array().unwrap().len(), 7);
        // both completions landed today, the last bucket
        assert_eq!(data["buildsPerDay"][6]["success"], 1);
        assert_eq!(data["buildsPerDay"][6]["failed"], 1);
        assert_eq!(data["completedCounts"]["foo"], 2);
        assert_eq!(data["buildsPerJob"]["foo"], 2);
    }
}
