//! Job Run / Task Run: the mutable execution-state side of the data model.
//!
//! Job-run creation (§4.H) and pause/resume (§4.I) live here because both
//! operate purely on these rows — no queue or executor involvement.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Pending => "pending",
            JobRunStatus::Queued => "queued",
            JobRunStatus::Running => "running",
            JobRunStatus::Paused => "paused",
            JobRunStatus::Completed => "completed",
            JobRunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobRunStatus::Completed | JobRunStatus::Failed)
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => JobRunStatus::Pending,
            "queued" => JobRunStatus::Queued,
            "running" => JobRunStatus::Running,
            "paused" => JobRunStatus::Paused,
            "completed" => JobRunStatus::Completed,
            "failed" => JobRunStatus::Failed,
            other => anyhow::bail!("unknown job_run status '{other}'"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRunStatus::Pending => "pending",
            TaskRunStatus::Running => "running",
            TaskRunStatus::Completed => "completed",
            TaskRunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub status: JobRunStatus,
    pub triggered_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct JobRunRow {
    id: Uuid,
    job_id: Uuid,
    status: String,
    triggered_by: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    metadata: serde_json::Value,
    scheduled_at: DateTime<Utc>,
    paused_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = anyhow::Error;

    fn try_from(row: JobRunRow) -> Result<Self> {
        Ok(JobRun {
            id: row.id,
            job_id: row.job_id,
            status: JobRunStatus::parse(&row.status)?,
            triggered_by: row.triggered_by,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error_message: row.error_message,
            metadata: row.metadata,
            scheduled_at: row.scheduled_at,
            paused_at: row.paused_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub job_run_id: Uuid,
    pub task_id: Uuid,
    pub status: TaskRunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error_message: Option<String>,
}

#[derive(FromRow)]
struct TaskRunRow {
    id: Uuid,
    job_run_id: Uuid,
    task_id: Uuid,
    status: String,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    output: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<TaskRunRow> for TaskRun {
    type Error = anyhow::Error;

    fn try_from(row: TaskRunRow) -> Result<Self> {
        let status = match row.status.as_str() {
            "pending" => TaskRunStatus::Pending,
            "running" => TaskRunStatus::Running,
            "completed" => TaskRunStatus::Completed,
            "failed" => TaskRunStatus::Failed,
            other => anyhow::bail!("unknown task_run status '{other}'"),
        };
        Ok(TaskRun {
            id: row.id,
            job_run_id: row.job_run_id,
            task_id: row.task_id,
            status,
            started_at: row.started_at,
            finished_at: row.finished_at,
            exit_code: row.exit_code,
            output: row.output,
            error_message: row.error_message,
        })
    }
}

/// Result of creating a Job Run: the new run id plus its frozen Task Run ids,
/// in Task order — what the caller enqueues.
pub struct JobRunDescriptor {
    pub job_run_id: Uuid,
    pub task_run_ids: Vec<Uuid>,
}

/// Atomic creation of a Job Run + one Task Run per Task of the parent Job (§4.H).
pub async fn create_job_run(
    pool: &PgPool,
    job_id: Uuid,
    task_ids_in_order: &[Uuid],
    triggered_by: Option<&str>,
    scheduled_at: DateTime<Utc>,
    metadata: serde_json::Value,
) -> Result<JobRunDescriptor> {
    let mut tx = pool.begin().await?;

    let (job_run_id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO job_runs (job_id, status, triggered_by, metadata, scheduled_at)
        VALUES ($1, 'pending', $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(job_id)
    .bind(triggered_by)
    .bind(&metadata)
    .bind(scheduled_at)
    .fetch_one(&mut *tx)
    .await?;

    let mut task_run_ids = Vec::with_capacity(task_ids_in_order.len());
    for task_id in task_ids_in_order {
        let (task_run_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO task_runs (job_run_id, task_id, status)
            VALUES ($1, $2, 'pending')
            RETURNING id
            "#,
        )
        .bind(job_run_id)
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await?;
        task_run_ids.push(task_run_id);
    }

    tx.commit().await?;

    Ok(JobRunDescriptor {
        job_run_id,
        task_run_ids,
    })
}

impl JobRun {
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<JobRun> {
        let row: JobRunRow = sqlx::query_as(
            r#"SELECT id, job_id, status, triggered_by, started_at, finished_at,
                      error_message, metadata, scheduled_at, paused_at, created_at
               FROM job_runs WHERE id = $1"#,
        )
        .bind(id)
        .fetch_one(pool)
        .await?;
        JobRun::try_from(row)
    }

    /// Runs that are pending and due, for the scheduler tick (§4.F).
    pub async fn find_due_pending(pool: &PgPool) -> Result<Vec<JobRun>> {
        let rows: Vec<JobRunRow> = sqlx::query_as(
            r#"SELECT id, job_id, status, triggered_by, started_at, finished_at,
                      error_message, metadata, scheduled_at, paused_at, created_at
               FROM job_runs WHERE status = 'pending' AND scheduled_at <= NOW()
               ORDER BY scheduled_at"#,
        )
        .fetch_all(pool)
        .await?;
        rows.into_iter().map(JobRun::try_from).collect()
    }

    pub async fn find_paused(pool: &PgPool) -> Result<Vec<JobRun>> {
        let rows: Vec<JobRunRow> = sqlx::query_as(
            r#"SELECT id, job_id, status, triggered_by, started_at, finished_at,
                      error_message, metadata, scheduled_at, paused_at, created_at
               FROM job_runs WHERE status = 'paused' ORDER BY paused_at"#,
        )
        .fetch_all(pool)
        .await?;
        rows.into_iter().map(JobRun::try_from).collect()
    }

    pub async fn mark_queued(pool: &PgPool, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE job_runs SET status = 'queued' WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Transition to `running`, atomically, setting `started_at`. Returns
    /// `false` (no-op) if the run is no longer in a claimable state — callers
    /// use this to implement the Executor's idempotent-duplicate discard.
    pub async fn try_start(pool: &PgPool, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE job_runs SET status = 'running', started_at = NOW()
               WHERE id = $1 AND status IN ('pending', 'queued')"#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_completed(pool: &PgPool, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE job_runs SET status = 'completed', finished_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(pool: &PgPool, id: Uuid, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"UPDATE job_runs SET status = 'failed', finished_at = NOW(), error_message = $1
               WHERE id = $2"#,
        )
        .bind(error_message)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Pause a `running` or `queued` run (§4.I). Returns `false` if the run
    /// was not in a pausable state.
    pub async fn pause(pool: &PgPool, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE job_runs SET status = 'paused', paused_at = NOW()
               WHERE id = $1 AND status IN ('running', 'queued')"#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Resume a `paused` run back to `queued`; caller re-enqueues. Returns
    /// `false` if the run was not paused.
    pub async fn resume(pool: &PgPool, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE job_runs SET status = 'queued', paused_at = NULL
               WHERE id = $1 AND status = 'paused'"#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

impl TaskRun {
    pub async fn find_for_task(pool: &PgPool, job_run_id: Uuid, task_id: Uuid) -> Result<TaskRun> {
        let row: TaskRunRow = sqlx::query_as(
            r#"SELECT id, job_run_id, task_id, status, started_at, finished_at,
                      exit_code, output, error_message
               FROM task_runs WHERE job_run_id = $1 AND task_id = $2"#,
        )
        .bind(job_run_id)
        .bind(task_id)
        .fetch_one(pool)
        .await?;
        TaskRun::try_from(row)
    }

    pub async fn find_all_for_run(pool: &PgPool, job_run_id: Uuid) -> Result<Vec<TaskRun>> {
        let rows: Vec<TaskRunRow> = sqlx::query_as(
            r#"SELECT id, job_run_id, task_id, status, started_at, finished_at,
                      exit_code, output, error_message
               FROM task_runs WHERE job_run_id = $1"#,
        )
        .bind(job_run_id)
        .fetch_all(pool)
        .await?;
        rows.into_iter().map(TaskRun::try_from).collect()
    }

    pub async fn mark_running(pool: &PgPool, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE task_runs SET status = 'running', started_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_completed(pool: &PgPool, id: Uuid, output: &str) -> Result<()> {
        sqlx::query(
            r#"UPDATE task_runs SET status = 'completed', finished_at = NOW(),
                      exit_code = 0, output = $1
               WHERE id = $2"#,
        )
        .bind(output)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(pool: &PgPool, id: Uuid, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"UPDATE task_runs SET status = 'failed', finished_at = NOW(),
                      exit_code = 1, error_message = $1
               WHERE id = $2"#,
        )
        .bind(error_message)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_completed_and_failed() {
        assert!(JobRunStatus::Completed.is_terminal());
        assert!(JobRunStatus::Failed.is_terminal());
        assert!(!JobRunStatus::Paused.is_terminal());
        assert!(!JobRunStatus::Running.is_terminal());
    }

    #[test]
    fn job_run_status_round_trips_through_as_str() {
        for s in ["pending", "queued", "running", "paused", "completed", "failed"] {
            assert_eq!(JobRunStatus::parse(s).unwrap().as_str(), s);
        }
    }
}
