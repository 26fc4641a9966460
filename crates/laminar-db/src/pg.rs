//! PostgreSQL implementation of the build store.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::store::{ArtifactRow, BuildRow, BuildStore, CompletedBuild, QueuedBuild};
use crate::DbResult;

const BUILD_COLUMNS: &str =
    "name, number, queued_at, started_at, completed_at, result, reason, parent_job, parent_build, node";

const VIEWS: [&str; 6] = [
    "build_time_changes",
    "builds_per_day",
    "low_pass_rates",
    "time_per_job",
    "result_changed",
    "builds_per_job",
];

pub struct PgBuildStore {
    pool: PgPool,
}

impl PgBuildStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Escape one value for COPY text format.
fn copy_escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\t', "\\t")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

#[async_trait]
impl BuildStore for PgBuildStore {
    async fn build_numbers(&self) -> DbResult<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT name, MAX(number) FROM builds GROUP BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn insert_queued(&self, build: &QueuedBuild) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO builds (name, number, queued_at, parent_job, parent_build, reason) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&build.name)
        .bind(build.number)
        .bind(build.queued_at)
        .bind(&build.parent_job)
        .bind(build.parent_build)
        .bind(&build.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_started(&self, name: &str, number: i64, node: &str, started_at: i64) -> DbResult<()> {
        sqlx::query("UPDATE builds SET node = $1, started_at = $2 WHERE name = $3 AND number = $4")
            .bind(node)
            .bind(started_at)
            .bind(name)
            .bind(number)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete(&self, build: &CompletedBuild<'_>) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE builds SET completed_at = $1, result = $2, output = $3, output_len = $4 \
             WHERE name = $5 AND number = $6",
        )
        .bind(build.completed_at)
        .bind(build.result)
        .bind(build.output)
        .bind(build.output.len() as i64)
        .bind(build.name)
        .bind(build.number)
        .execute(&mut *tx)
        .await?;

        if !build.artifacts.is_empty() {
            let mut copy = (&mut *tx)
                .copy_in_raw("COPY artifacts (name, number, filename, filesize) FROM STDIN")
                .await?;
            let mut buf = String::new();
            for artifact in build.artifacts {
                buf.push_str(&copy_escape(build.name));
                buf.push('\t');
                buf.push_str(&build.number.to_string());
                buf.push('\t');
                buf.push_str(&copy_escape(&artifact.filename));
                buf.push('\t');
                buf.push_str(&artifact.filesize.to_string());
                buf.push('\n');
            }
            copy.send(buf.as_bytes()).await?;
            copy.finish().await?;
        }

        for view in VIEWS {
            sqlx::query(&format!("REFRESH MATERIALIZED VIEW {view}"))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn last_result(&self, name: &str) -> DbResult<Option<i32>> {
        let result = sqlx::query_scalar::<_, i32>(
            "SELECT result FROM builds WHERE name = $1 AND result IS NOT NULL \
             ORDER BY completed_at DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(result)
    }

    async fn last_runtime(&self, name: &str) -> DbResult<Option<i64>> {
        let runtime = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT completed_at - started_at FROM builds \
             WHERE name = $1 AND completed_at IS NOT NULL \
             ORDER BY completed_at DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(runtime.flatten())
    }

    async fn build(&self, name: &str, number: i64) -> DbResult<Option<BuildRow>> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE name = $1 AND number = $2"
        ))
        .bind(name)
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn output(&self, name: &str, number: i64) -> DbResult<Option<Vec<u8>>> {
        let output = sqlx::query_scalar::<_, Option<Vec<u8>>>(
            "SELECT output FROM builds WHERE name = $1 AND number = $2",
        )
        .bind(name)
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(output.flatten())
    }

    async fn artifacts(&self, name: &str, number: i64) -> DbResult<Vec<ArtifactRow>> {
        let rows = sqlx::query_as::<_, ArtifactRow>(
            "SELECT filename, filesize FROM artifacts \
             WHERE name = $1 AND number = $2 ORDER BY filename",
        )
        .bind(name)
        .bind(number)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn latest_per_job(&self) -> DbResult<Vec<BuildRow>> {
        let rows = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT DISTINCT ON (name) {BUILD_COLUMNS} FROM builds ORDER BY name, number DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn recent_completed(&self, limit: i64) -> DbResult<Vec<BuildRow>> {
        let rows = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE completed_at IS NOT NULL \
             ORDER BY completed_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn job_page(&self, name: &str, field: &str, desc: bool, limit: i64, offset: i64)
        -> DbResult<Vec<BuildRow>>
    {
        // ORDER BY cannot be bound; whitelist the sortable fields.
        let direction = if desc { "DESC" } else { "ASC" };
        let order_by = match field {
            "result" => format!("result {direction}, number DESC"),
            "started" => format!("started_at {direction}, number DESC"),
            "duration" => format!("(completed_at - started_at) {direction}, number DESC"),
            "number" => format!("number {direction}"),
            _ => "number DESC".to_string(),
        };
        let rows = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE name = $1 AND result IS NOT NULL \
             ORDER BY {order_by} LIMIT $2 OFFSET $3"
        ))
        .bind(name)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn job_stats(&self, name: &str) -> DbResult<(i64, i64)> {
        let stats: (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), CAST(COALESCE(AVG(completed_at - started_at), 0) AS BIGINT) \
             FROM builds WHERE name = $1 AND result IS NOT NULL",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    async fn last_with_result(&self, name: &str, success: bool) -> DbResult<Option<(i64, i64)>> {
        let condition = if success { "result = 5" } else { "result IS NOT NULL AND result <> 5" };
        let row: Option<(i64, i64)> = sqlx::query_as(&format!(
            "SELECT number, COALESCE(started_at, 0) FROM builds \
             WHERE name = $1 AND {condition} ORDER BY completed_at DESC LIMIT 1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn completed_counts(&self) -> DbResult<Vec<(String, i64)>> {
        let rows = sqlx::query_as(
            "SELECT name, COUNT(*) FROM builds WHERE result IS NOT NULL GROUP BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn builds_per_day(&self) -> DbResult<Vec<(i32, i64, i64)>> {
        let rows = sqlx::query_as("SELECT COALESCE(result, 0), day, cnt FROM builds_per_day")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn builds_per_job(&self) -> DbResult<Vec<(String, i64)>> {
        let rows = sqlx::query_as("SELECT name, c FROM builds_per_job")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn time_per_job(&self) -> DbResult<Vec<(String, f64)>> {
        let rows = sqlx::query_as("SELECT name, CAST(av AS DOUBLE PRECISION) FROM time_per_job")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn result_changed(&self) -> DbResult<Vec<(String, i64, i64)>> {
        let rows = sqlx::query_as("SELECT name, last_success, last_failure FROM result_changed")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn low_pass_rates(&self) -> DbResult<Vec<(String, f64)>> {
        let rows = sqlx::query_as("SELECT name, pass_rate FROM low_pass_rates")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn build_time_changes(&self) -> DbResult<Vec<(String, String, Option<String>)>> {
        let rows = sqlx::query_as("SELECT name, numbers, durations FROM build_time_changes")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}
