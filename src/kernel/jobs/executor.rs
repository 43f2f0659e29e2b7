//! Executor (§4.E): claims a message, plans the DAG, runs each Task in
//! order, and reconciles Job Run / Task Run state. One Executor instance is
//! one queue consumer; run several for horizontal throughput.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::dag::{self, PlannerError};
use super::job_run::{JobRun, JobRunStatus, TaskRun, TaskRunStatus};
use super::logging::{JobRunLogger, LogLevel, LogStream, LogType};
use super::model::{Job, Task, TaskType};
use super::owner::SYSTEM_OWNER;
use super::queue::{ClaimedMessage, RedisQueue};
use super::registry::FrozenTaskRegistry;
use super::resolver::{self, ResolveError};
use super::script;
use super::secrets::SecretCipher;
use crate::kernel::stream_hub::StreamHub;

/// Bound on Tasks dispatched concurrently within one DAG level (§4.E).
const LEVEL_CONCURRENCY: usize = 5;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub worker_id: String,
    pub poll_block: Duration,
    pub reclaim_interval: Duration,
    pub reclaim_idle: Duration,
    pub log_dir: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("executor-{}", Uuid::new_v4()),
            poll_block: Duration::from_secs(5),
            reclaim_interval: Duration::from_secs(30),
            reclaim_idle: Duration::from_secs(90),
            log_dir: PathBuf::from("./data/logs"),
        }
    }
}

pub struct Executor {
    queue: RedisQueue,
    pool: PgPool,
    registry: FrozenTaskRegistry,
    cipher: Arc<SecretCipher>,
    stream_hub: StreamHub,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        queue: RedisQueue,
        pool: PgPool,
        registry: FrozenTaskRegistry,
        cipher: Arc<SecretCipher>,
        stream_hub: StreamHub,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            queue,
            pool,
            registry,
            cipher,
            stream_hub,
            config,
        }
    }

    fn logger(&self, job_run_id: Uuid) -> JobRunLogger {
        JobRunLogger::new(job_run_id, self.config.log_dir.clone(), self.pool.clone(), self.stream_hub.clone())
    }

    /// Run until `shutdown` is cancelled. Spawns its own reclaim ticker
    /// alongside the claim loop.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(worker_id = %self.config.worker_id, "executor starting");
        self.queue.ensure_group().await?;

        let reclaim_queue = self.queue.clone();
        let reclaim_interval = self.config.reclaim_interval;
        let reclaim_idle = self.config.reclaim_idle;
        let reclaim_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reclaim_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(reclaim_interval) => {}
                }
                match reclaim_queue.reclaim_stuck_jobs(reclaim_idle).await {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        warn!(count = reclaimed.len(), "reclaimed stuck queue entries");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "reclaim tick failed"),
                }
            }
        });

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let claimed = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.queue.dequeue(self.config.poll_block) => result,
            };

            let message = match claimed {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "dequeue failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            self.process(message, &shutdown).await;
        }

        info!(worker_id = %self.config.worker_id, "executor stopped");
        Ok(())
    }

    async fn process(&self, message: ClaimedMessage, shutdown: &CancellationToken) {
        let job_run_id = match message.job_run_id() {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "poison message");
                let _ = self.queue.retry_or_dlq(&message.message_id, &message.fields).await;
                return;
            }
        };

        match self.execute_job_run(job_run_id, shutdown).await {
            Ok(()) => {
                let _ = self.queue.ack(&message.message_id).await;
            }
            Err(ExecuteError::AlreadyClaimed) => {
                // Another consumer (or a previous delivery) already started this run.
                let _ = self.queue.ack(&message.message_id).await;
            }
            Err(ExecuteError::Infrastructural(e)) => {
                // Leave unacked; reclaim_stuck_jobs will hand it to another consumer.
                error!(job_run_id = %job_run_id, error = %e, "infrastructural error, leaving pending");
            }
            Err(ExecuteError::TaskFailed(e)) => {
                // Task error: no queue retry, the Job Run is already marked failed.
                warn!(job_run_id = %job_run_id, error = %e, "job run failed");
                let _ = self.queue.ack(&message.message_id).await;
            }
        }
    }

    async fn execute_job_run(
        &self,
        job_run_id: Uuid,
        shutdown: &CancellationToken,
    ) -> Result<(), ExecuteError> {
        if !JobRun::try_start(&self.pool, job_run_id)
            .await
            .map_err(ExecuteError::infra)?
        {
            return Err(ExecuteError::AlreadyClaimed);
        }

        let logger = self.logger(job_run_id);
        let _ = logger.log(LogType::Job, LogLevel::Info, LogStream::System, "job run started").await;

        let job_run = JobRun::find_by_id(&self.pool, job_run_id)
            .await
            .map_err(ExecuteError::infra)?;
        let job = Job::find_by_id(&self.pool, job_run.job_id)
            .await
            .map_err(ExecuteError::infra)?;

        let plan = dag::plan(job.tasks.clone()).map_err(|e| match e {
            PlannerError::UnknownDependency(_) | PlannerError::CyclicDependency => {
                ExecuteError::TaskFailed(e.to_string())
            }
        })?;

        let task_outputs: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
        let semaphore = Arc::new(Semaphore::new(LEVEL_CONCURRENCY));

        for level in plan.levels {
            // Cooperative pause check (§10 design note): a single read of
            // the authoritative store before each level, not a signal bus.
            let current = JobRun::find_by_id(&self.pool, job_run_id)
                .await
                .map_err(ExecuteError::infra)?;
            if current.status == JobRunStatus::Paused {
                let _ = logger
                    .log(LogType::Job, LogLevel::Info, LogStream::System, "job run paused, deferring remaining tasks")
                    .await;
                return Ok(());
            }

            // Independent Tasks within a level dispatch concurrently, bounded
            // by `semaphore`; a sibling failure doesn't cancel the others —
            // every spawned Task is awaited to completion before the level
            // (and, on failure, the Job Run) is resolved.
            let mut handles = Vec::with_capacity(level.len());
            for task in level {
                let task_run = TaskRun::find_for_task(&self.pool, job_run_id, task.id)
                    .await
                    .map_err(ExecuteError::infra)?;

                // Resume re-walks the whole plan; a Task Run already
                // completed before the pause keeps its recorded output
                // instead of re-running (and re-firing any side effects).
                if task_run.status == TaskRunStatus::Completed {
                    task_outputs
                        .lock()
                        .await
                        .insert(task.name.clone(), task_run.output.clone().unwrap_or_default());
                    continue;
                }

                let permit = semaphore.clone().acquire_owned().await.map_err(ExecuteError::infra)?;
                let pool = self.pool.clone();
                let cipher = self.cipher.clone();
                let registry = self.registry.clone();
                let logger = logger.clone();
                let ctx = shutdown.child_token();
                let outputs = task_outputs.clone();
                let task_run_id = task_run.id;

                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    run_task(pool, cipher, registry, logger, ctx, task, task_run_id, outputs).await
                }));
            }

            let mut first_error: Option<String> = None;
            for handle in handles {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(message)) => {
                        first_error.get_or_insert(message);
                    }
                    Err(join_err) => {
                        first_error.get_or_insert(join_err.to_string());
                    }
                }
            }

            if let Some(message) = first_error {
                JobRun::mark_failed(&self.pool, job_run_id, &message)
                    .await
                    .map_err(ExecuteError::infra)?;
                return Err(ExecuteError::TaskFailed(message));
            }
        }

        JobRun::mark_completed(&self.pool, job_run_id)
            .await
            .map_err(ExecuteError::infra)?;
        let _ = logger.log(LogType::Job, LogLevel::Info, LogStream::System, "job run completed").await;
        Ok(())
    }
}

/// Resolve parameters, dispatch, and reconcile Task Run state for a single
/// Task. Runs inside its own spawned task so siblings in the same level
/// proceed independently; returns the failure message on error rather than
/// marking the Job Run itself (the caller does that once, after every
/// sibling in the level has finished).
async fn run_task(
    pool: PgPool,
    cipher: Arc<SecretCipher>,
    registry: FrozenTaskRegistry,
    logger: JobRunLogger,
    ctx: CancellationToken,
    task: Task,
    task_run_id: Uuid,
    outputs: Arc<Mutex<HashMap<String, String>>>,
) -> Result<(), String> {
    TaskRun::mark_running(&pool, task_run_id).await.map_err(|e| e.to_string())?;
    let _ = logger
        .log(LogType::Task, LogLevel::Info, LogStream::System, &format!("task '{}' started", task.name))
        .await;

    let snapshot = outputs.lock().await.clone();
    let resolved = resolver::resolve(&pool, &cipher, SYSTEM_OWNER, &task.config, &snapshot).await;

    let resolved = match resolved {
        Ok(r) => r,
        Err(e) => {
            let message = resolve_error_message(&e);
            TaskRun::mark_failed(&pool, task_run_id, &message).await.map_err(|e| e.to_string())?;
            let _ = logger.log(LogType::Task, LogLevel::Error, LogStream::System, &message).await;
            return Err(message);
        }
    };

    let outcome = match task.task_type {
        TaskType::Builtin => registry.run_builtin(ctx, &task.name, resolved.params).await,
        TaskType::Custom => {
            let script_config = task.config.script.clone().ok_or_else(|| {
                super::registry::TaskError::Failed("custom task missing script config".into())
            });
            match script_config {
                Ok(script_config) => {
                    script::run(ctx, &script_config, resolved.params, resolved.secret_env, snapshot).await
                }
                Err(e) => Err(e),
            }
        }
    };

    match outcome {
        Ok(output) => {
            let output = output.trim().to_string();
            TaskRun::mark_completed(&pool, task_run_id, &output).await.map_err(|e| e.to_string())?;
            let _ = logger.log(LogType::Task, LogLevel::Info, LogStream::Stdout, &output).await;
            outputs.lock().await.insert(task.name.clone(), output);
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            TaskRun::mark_failed(&pool, task_run_id, &message).await.map_err(|e| e.to_string())?;
            let _ = logger.log(LogType::Task, LogLevel::Error, LogStream::Stderr, &message).await;
            Err(message)
        }
    }
}

enum ExecuteError {
    AlreadyClaimed,
    Infrastructural(String),
    TaskFailed(String),
}

impl ExecuteError {
    fn infra(e: impl std::fmt::Display) -> Self {
        ExecuteError::Infrastructural(e.to_string())
    }
}

fn resolve_error_message(e: &ResolveError) -> String {
    e.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_claimed_never_dead_letters() {
        // Duplicate delivery of an already-started run is an ack, not a
        // failure; this is the invariant the dispatch match above encodes.
        let err = ExecuteError::AlreadyClaimed;
        assert!(matches!(err, ExecuteError::AlreadyClaimed));
    }
}
