//! Job and Task definitions: the immutable recipe side of the data model.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

/// Whether a Task dispatches to the registry by name or runs an inline script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Builtin,
    Custom,
}

/// Language of an inline script, closed set per the runner contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    Python,
    Javascript,
    Typescript,
    Bash,
    Sh,
    Ruby,
    Go,
    Php,
    Perl,
}

impl ScriptLanguage {
    /// (interpreter, args-before-script-path) pair used to spawn the process.
    pub fn interpreter(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            ScriptLanguage::Python => ("python3", &[]),
            ScriptLanguage::Javascript => ("node", &[]),
            ScriptLanguage::Typescript => ("ts-node", &[]),
            ScriptLanguage::Bash => ("bash", &[]),
            ScriptLanguage::Sh => ("sh", &[]),
            ScriptLanguage::Ruby => ("ruby", &[]),
            ScriptLanguage::Go => ("go", &["run"]),
            ScriptLanguage::Php => ("php", &[]),
            ScriptLanguage::Perl => ("perl", &[]),
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            ScriptLanguage::Python => "py",
            ScriptLanguage::Javascript => "js",
            ScriptLanguage::Typescript => "ts",
            ScriptLanguage::Bash | ScriptLanguage::Sh => "sh",
            ScriptLanguage::Ruby => "rb",
            ScriptLanguage::Go => "go",
            ScriptLanguage::Php => "php",
            ScriptLanguage::Perl => "pl",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    pub language: ScriptLanguage,
    pub code: String,
}

/// `tasks.config` JSONB payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskConfig {
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// secret name -> env var name
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    #[serde(default)]
    pub script: Option<ScriptConfig>,
}

/// One step within a Job: either a named built-in or an inline script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub name: String,
    pub task_type: TaskType,
    pub order: i32,
    pub config: TaskConfig,
}

#[derive(FromRow)]
struct TaskRow {
    id: Uuid,
    job_id: Uuid,
    name: String,
    task_type: String,
    task_order: i32,
    config: serde_json::Value,
}

impl TryFrom<TaskRow> for Task {
    type Error = anyhow::Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        let task_type = match row.task_type.as_str() {
            "builtin" => TaskType::Builtin,
            "custom" => TaskType::Custom,
            other => anyhow::bail!("unknown task_type '{other}'"),
        };
        Ok(Task {
            id: row.id,
            job_id: row.job_id,
            name: row.name,
            task_type,
            order: row.task_order,
            config: serde_json::from_value(row.config)?,
        })
    }
}

/// Immutable recipe: ordered Tasks + optional cron schedule. Created once, referenced forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub source: String,
    pub raw_payload: serde_json::Value,
    pub cron_schedule: Option<String>,
    pub created_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    source: String,
    raw_payload: serde_json::Value,
    cron_schedule: Option<String>,
    created_at: DateTime<Utc>,
}

impl Job {
    /// Create a Job and its Tasks transactionally. Tasks must form an acyclic
    /// graph over `depends_on` by name, but that is only verified at plan time
    /// (§4.D) — creation itself accepts any well-formed task list.
    pub async fn create(
        pool: &PgPool,
        name: &str,
        description: Option<&str>,
        source: &str,
        raw_payload: serde_json::Value,
        cron_schedule: Option<&str>,
        tasks: Vec<(String, TaskType, i32, TaskConfig)>,
    ) -> Result<Job> {
        let mut tx = pool.begin().await?;

        let row: JobRow = sqlx::query_as(
            r#"
            INSERT INTO jobs (name, description, source, raw_payload, cron_schedule)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, description, source, raw_payload, cron_schedule, created_at
            "#,
        )
        .bind(name)
        .bind(description)
        .bind(source)
        .bind(&raw_payload)
        .bind(cron_schedule)
        .fetch_one(&mut *tx)
        .await?;

        let mut created_tasks = Vec::with_capacity(tasks.len());
        for (task_name, task_type, order, config) in tasks {
            let type_str = match task_type {
                TaskType::Builtin => "builtin",
                TaskType::Custom => "custom",
            };
            let task_row: TaskRow = sqlx::query_as(
                r#"
                INSERT INTO tasks (job_id, name, task_type, task_order, config)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id, job_id, name, task_type, task_order, config
                "#,
            )
            .bind(row.id)
            .bind(&task_name)
            .bind(type_str)
            .bind(order)
            .bind(serde_json::to_value(&config)?)
            .fetch_one(&mut *tx)
            .await?;
            created_tasks.push(Task::try_from(task_row)?);
        }

        tx.commit().await?;

        Ok(Job {
            id: row.id,
            name: row.name,
            description: row.description,
            source: row.source,
            raw_payload: row.raw_payload,
            cron_schedule: row.cron_schedule,
            created_at: row.created_at,
            tasks: created_tasks,
        })
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Job> {
        let row: JobRow = sqlx::query_as(
            "SELECT id, name, description, source, raw_payload, cron_schedule, created_at FROM jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_one(pool)
        .await?;

        let task_rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, job_id, name, task_type, task_order, config FROM tasks WHERE job_id = $1 ORDER BY task_order",
        )
        .bind(id)
        .fetch_all(pool)
        .await?;

        let tasks = task_rows
            .into_iter()
            .map(Task::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(Job {
            id: row.id,
            name: row.name,
            description: row.description,
            source: row.source,
            raw_payload: row.raw_payload,
            cron_schedule: row.cron_schedule,
            created_at: row.created_at,
            tasks,
        })
    }

    /// Jobs with a cron schedule, for the scheduler's cron-activation tick (§4.F).
    pub async fn find_cron_scheduled(pool: &PgPool) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT id, name, description, source, raw_payload, cron_schedule, created_at FROM jobs WHERE cron_schedule IS NOT NULL",
        )
        .fetch_all(pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let task_rows: Vec<TaskRow> = sqlx::query_as(
                "SELECT id, job_id, name, task_type, task_order, config FROM tasks WHERE job_id = $1 ORDER BY task_order",
            )
            .bind(row.id)
            .fetch_all(pool)
            .await?;
            let tasks = task_rows
                .into_iter()
                .map(Task::try_from)
                .collect::<Result<Vec<_>>>()?;
            jobs.push(Job {
                id: row.id,
                name: row.name,
                description: row.description,
                source: row.source,
                raw_payload: row.raw_payload,
                cron_schedule: row.cron_schedule,
                created_at: row.created_at,
                tasks,
            });
        }
        Ok(jobs)
    }

    /// Most recent run's `scheduled_at`, used to decide whether a cron Job is due.
    pub async fn last_run_at(pool: &PgPool, job_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT scheduled_at FROM job_runs WHERE job_id = $1 ORDER BY scheduled_at DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|(t,)| t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_language_maps_closed_set_of_interpreters() {
        assert_eq!(ScriptLanguage::Python.interpreter().0, "python3");
        assert_eq!(ScriptLanguage::Go.interpreter(), ("go", &["run"][..]));
    }

    #[test]
    fn task_config_defaults_are_empty() {
        let config = TaskConfig::default();
        assert!(config.depends_on.is_empty());
        assert!(config.parameters.is_empty());
        assert!(config.secrets.is_empty());
        assert!(config.script.is_none());
    }
}
