//! Reliable queue client (§4.A): a Redis Streams consumer group wrapping
//! enqueue / claim / ack / retry / DLQ / reclaim.

use deadpool_redis::{redis::AsyncCommands, Pool};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const GROUP: &str = "workers";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
    #[error("malformed queue message: {0}")]
    Malformed(String),
}

/// Fields carried by a queue message, per the wire model (§6).
#[derive(Debug, Clone)]
pub struct QueueFields {
    pub job_run_id: String,
    pub retry_count: u32,
}

pub struct ClaimedMessage {
    pub message_id: String,
    pub fields: QueueFields,
}

impl ClaimedMessage {
    /// Parsed `job_run_id`, or a `Malformed` error the caller should DLQ.
    pub fn job_run_id(&self) -> Result<Uuid, QueueError> {
        Uuid::parse_str(&self.fields.job_run_id)
            .map_err(|e| QueueError::Malformed(format!("bad job_run_id: {e}")))
    }
}

#[derive(Clone)]
pub struct RedisQueue {
    pool: Pool,
    stream: String,
    consumer: String,
    max_retries: u32,
}

impl RedisQueue {
    pub fn new(pool: Pool, stream: impl Into<String>, max_retries: u32) -> Self {
        let consumer = format!(
            "{}-{}",
            hostname(),
            std::process::id()
        );
        Self {
            pool,
            stream: stream.into(),
            consumer,
            max_retries,
        }
    }

    fn dlq_stream(&self) -> String {
        format!("{}:dlq", self.stream)
    }

    /// Ensure the consumer group exists; idempotent (ignores BUSYGROUP).
    pub async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await?;
        let result: deadpool_redis::redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.stream, GROUP, "0")
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn enqueue(&self, job_run_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await?;
        let _: String = conn
            .xadd(
                &self.stream,
                "*",
                &[("job_run_id", job_run_id.to_string()), ("retry_count", "0".to_string())],
            )
            .await?;
        Ok(())
    }

    /// Consumer-group read with a bounded block, `NEW` position (`>`).
    pub async fn dequeue(&self, block: Duration) -> Result<Option<ClaimedMessage>, QueueError> {
        use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};

        let mut conn = self.pool.get().await?;
        let opts = StreamReadOptions::default()
            .group(GROUP, &self.consumer)
            .count(1)
            .block(block.as_millis() as usize);

        let reply: StreamReadReply = conn.xread_options(&[&self.stream], &[">"], &opts).await?;
        Ok(first_message(reply))
    }

    pub async fn ack(&self, message_id: &str) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await?;
        let _: i64 = conn.xack(&self.stream, GROUP, &[message_id]).await?;
        Ok(())
    }

    /// If `retry_count < max_retries`, re-append with an incremented counter
    /// and ack the original; otherwise move to the dead-letter stream.
    pub async fn retry_or_dlq(&self, message_id: &str, fields: &QueueFields) -> Result<(), QueueError> {
        if fields.retry_count < self.max_retries {
            let mut conn = self.pool.get().await?;
            let _: String = conn
                .xadd(
                    &self.stream,
                    "*",
                    &[
                        ("job_run_id", fields.job_run_id.clone()),
                        ("retry_count", (fields.retry_count + 1).to_string()),
                    ],
                )
                .await?;
            self.ack(message_id).await?;
        } else {
            self.move_to_dead_letter(fields).await?;
            self.ack(message_id).await?;
        }
        Ok(())
    }

    pub async fn move_to_dead_letter(&self, fields: &QueueFields) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await?;
        let _: String = conn
            .xadd(
                self.dlq_stream(),
                "*",
                &[
                    ("job_run_id", fields.job_run_id.clone()),
                    ("retry_count", fields.retry_count.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    /// Transfer ownership of any pending entry idle longer than `idle` to
    /// this consumer, returning the reclaimed messages for reprocessing.
    pub async fn reclaim_stuck_jobs(&self, idle: Duration) -> Result<Vec<ClaimedMessage>, QueueError> {
        use deadpool_redis::redis::streams::{StreamClaimOptions, StreamClaimReply, StreamPendingCountReply};

        let mut conn = self.pool.get().await?;
        let pending: StreamPendingCountReply = conn
            .xpending_count(&self.stream, GROUP, "-", "+", 100)
            .await?;

        let ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= idle.as_millis() as usize)
            .map(|p| p.id)
            .collect();

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let claim_opts = StreamClaimOptions::default().with_force();
        let reply: StreamClaimReply = conn
            .xclaim_options(
                &self.stream,
                GROUP,
                &self.consumer,
                idle.as_millis() as usize,
                &ids,
                claim_opts,
            )
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .filter_map(|entry| to_fields(&entry).map(|fields| ClaimedMessage { message_id: entry.id.clone(), fields }))
            .collect())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

fn to_fields(entry: &deadpool_redis::redis::streams::StreamId) -> Option<QueueFields> {
    let job_run_id = entry.get("job_run_id")?;
    let retry_count: String = entry.get("retry_count").unwrap_or_else(|| "0".to_string());
    Some(QueueFields {
        job_run_id,
        retry_count: retry_count.parse().unwrap_or(0),
    })
}

fn first_message(reply: deadpool_redis::redis::streams::StreamReadReply) -> Option<ClaimedMessage> {
    let stream_key = reply.keys.into_iter().next()?;
    let entry = stream_key.ids.into_iter().next()?;
    let fields = to_fields(&entry)?;
    Some(ClaimedMessage {
        message_id: entry.id.clone(),
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claimed_message_parses_valid_uuid() {
        let id = Uuid::new_v4();
        let msg = ClaimedMessage {
            message_id: "1-0".to_string(),
            fields: QueueFields {
                job_run_id: id.to_string(),
                retry_count: 0,
            },
        };
        assert_eq!(msg.job_run_id().unwrap(), id);
    }

    #[test]
    fn claimed_message_rejects_poison_payload() {
        let msg = ClaimedMessage {
            message_id: "1-0".to_string(),
            fields: QueueFields {
                job_run_id: "not-a-uuid".to_string(),
                retry_count: 0,
            },
        };
        assert!(matches!(msg.job_run_id(), Err(QueueError::Malformed(_))));
    }
}
