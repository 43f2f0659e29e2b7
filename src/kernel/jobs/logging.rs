//! Log fan-out (§4.G): a `JobRunLogger` writes every entry to the append-only
//! file, the relational `logs` table, and the process-wide `StreamHub` —
//! topic `job-run:<id>` plus the `global` firehose.

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::kernel::stream_hub::StreamHub;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    System,
    Job,
    Task,
}

impl LogType {
    fn as_str(&self) -> &'static str {
        match self {
            LogType::System => "system",
            LogType::Job => "job",
            LogType::Task => "task",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

impl LogStream {
    fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
            LogStream::System => "system",
        }
    }
}

#[derive(Clone)]
pub struct JobRunLogger {
    job_run_id: Uuid,
    base_dir: PathBuf,
    pool: PgPool,
    stream_hub: StreamHub,
}

impl JobRunLogger {
    pub fn new(job_run_id: Uuid, base_dir: impl Into<PathBuf>, pool: PgPool, stream_hub: StreamHub) -> Self {
        Self {
            job_run_id,
            base_dir: base_dir.into(),
            pool,
            stream_hub,
        }
    }

    fn file_path(&self) -> PathBuf {
        let date = Utc::now().format("%Y-%m-%d");
        self.base_dir.join(format!("{}-{}.txt", self.job_run_id, date))
    }

    pub async fn log(
        &self,
        log_type: LogType,
        level: LogLevel,
        stream: LogStream,
        message: &str,
    ) -> anyhow::Result<()> {
        let now = Utc::now();

        if let Err(e) = self.append_file(now, log_type, level, stream, message).await {
            tracing::warn!(error = %e, "failed to append job run log file");
        }

        sqlx::query(
            r#"INSERT INTO logs (log_type, job_run_id, timestamp, level, stream, message)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(log_type.as_str())
        .bind(self.job_run_id)
        .bind(now)
        .bind(level.as_str())
        .bind(stream.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;

        let payload = json!({
            "type": log_type.as_str(),
            "level": level.as_str(),
            "stream": stream.as_str(),
            "message": message,
            "timestamp": now,
        });
        self.stream_hub
            .publish(&format!("job-run:{}", self.job_run_id), payload.clone())
            .await;
        self.stream_hub.publish("global", payload).await;

        Ok(())
    }

    async fn append_file(
        &self,
        ts: chrono::DateTime<Utc>,
        log_type: LogType,
        level: LogLevel,
        stream: LogStream,
        message: &str,
    ) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let line = format!(
            "[{}] [{}] [{}] [{}] {}\n",
            ts.to_rfc3339(),
            log_type.as_str(),
            level.as_str(),
            stream.as_str(),
            message
        );
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_path_is_keyed_by_job_run_and_date() {
        let logger = JobRunLogger::new(
            Uuid::nil(),
            "/tmp/logs",
            sqlx::PgPool::connect_lazy("postgres://localhost/nonexistent").unwrap(),
            StreamHub::new(),
        );
        let path = logger.file_path();
        assert!(path.to_string_lossy().starts_with("/tmp/logs/"));
        assert!(path.to_string_lossy().contains(&Uuid::nil().to_string()));
    }
}
