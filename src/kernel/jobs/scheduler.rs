//! Scheduler tick (§4.F): two interval loops — one enqueues due pending Job
//! Runs, the other resolves due cron Jobs into fresh pending Job Runs.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::job_run::{create_job_run, JobRun};
use super::model::Job;
use super::queue::RedisQueue;

const PENDING_TICK: Duration = Duration::from_secs(30);
const CRON_TICK: Duration = Duration::from_secs(60);

pub struct Scheduler {
    pool: PgPool,
    queue: RedisQueue,
}

impl Scheduler {
    pub fn new(pool: PgPool, queue: RedisQueue) -> Self {
        Self { pool, queue }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let pending = self.run_pending_tick(shutdown.clone());
        let cron = self.run_cron_tick(shutdown);
        tokio::join!(pending, cron);
    }

    async fn run_pending_tick(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(PENDING_TICK);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.enqueue_due_pending().await {
                error!(error = %e, "pending tick failed");
            }
        }
    }

    async fn run_cron_tick(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(CRON_TICK);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.activate_due_cron_jobs().await {
                error!(error = %e, "cron tick failed");
            }
        }
    }

    async fn enqueue_due_pending(&self) -> anyhow::Result<()> {
        let due = JobRun::find_due_pending(&self.pool).await?;
        for run in due {
            if let Err(e) = self.queue.enqueue(run.id).await {
                error!(job_run_id = %run.id, error = %e, "failed to enqueue due run");
                continue;
            }
            JobRun::mark_queued(&self.pool, run.id).await?;
        }
        Ok(())
    }

    async fn activate_due_cron_jobs(&self) -> anyhow::Result<()> {
        let jobs = Job::find_cron_scheduled(&self.pool).await?;
        for job in jobs {
            let Some(expr) = &job.cron_schedule else { continue };
            let schedule = match Schedule::from_str(expr) {
                Ok(s) => s,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "invalid cron expression");
                    continue;
                }
            };

            let last_run = Job::last_run_at(&self.pool, job.id).await?;
            let now = Utc::now();
            let is_due = match last_run {
                None => true,
                Some(last) => schedule
                    .after(&last)
                    .next()
                    .map(|next| next <= now)
                    .unwrap_or(false),
            };
            if !is_due {
                continue;
            }

            let task_ids: Vec<_> = job.tasks.iter().map(|t| t.id).collect();
            let descriptor = create_job_run(
                &self.pool,
                job.id,
                &task_ids,
                Some("cron"),
                now,
                json!({}),
            )
            .await?;
            info!(job_id = %job.id, job_run_id = %descriptor.job_run_id, "cron job activated");
        }
        Ok(())
    }
}
