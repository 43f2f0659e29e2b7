use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub host: String,
    pub port: u16,
    /// AES-256-GCM key for secret plaintext; must be exactly 32 bytes.
    pub encryption_key: String,
    /// Directory the per-job-run log files are written under.
    pub log_dir: String,
    /// Queue retry budget before a message is dead-lettered.
    pub max_retries: u32,
    /// How long a pending queue entry may sit unacked before reclaim.
    pub reclaim_idle_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let encryption_key = env::var("ENCRYPTION_KEY").context("ENCRYPTION_KEY must be set")?;
        if encryption_key.len() != 32 {
            anyhow::bail!("ENCRYPTION_KEY must be exactly 32 bytes long");
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("SERVER_PORT must be a valid number")?,
            encryption_key,
            log_dir: env::var("LOG_DIR").unwrap_or_else(|_| "./data/logs".to_string()),
            max_retries: env::var("QUEUE_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            reclaim_idle_secs: env::var("QUEUE_RECLAIM_IDLE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(90),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn log_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.log_dir)
    }
}
