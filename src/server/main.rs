// Main entry point for the orchestrator server: HTTP admission surface,
// Executor, and Scheduler running side by side in one process.

use std::sync::Arc;

use anyhow::{Context, Result};
use orchestrator_core::config::Config;
use orchestrator_core::kernel::jobs::{default_registry, Executor, ExecutorConfig, RedisQueue, Scheduler, SecretCipher};
use orchestrator_core::kernel::stream_hub::StreamHub;
use orchestrator_core::kernel::AppState;
use orchestrator_core::server::build_app;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const QUEUE_STREAM: &str = "job-runs";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting orchestrator");

    let config = Config::from_env().context("failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;
    tracing::info!("migrations complete");

    let redis_cfg = deadpool_redis::Config::from_url(&config.redis_url);
    let redis_pool = redis_cfg
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .context("failed to build redis pool")?;

    let queue = RedisQueue::new(redis_pool, QUEUE_STREAM, config.max_retries);
    let registry = default_registry().freeze();
    let cipher = SecretCipher::new(&config.encryption_key).context("failed to build secret cipher")?;
    let stream_hub = StreamHub::new();

    let state = AppState::new(
        pool.clone(),
        queue.clone(),
        registry.clone(),
        cipher.clone(),
        stream_hub.clone(),
        config.clone(),
    );

    let shutdown = CancellationToken::new();

    let executor_config = ExecutorConfig {
        log_dir: config.log_dir_path(),
        reclaim_idle: std::time::Duration::from_secs(config.reclaim_idle_secs),
        ..ExecutorConfig::default()
    };
    let executor = Executor::new(
        queue.clone(),
        pool.clone(),
        registry,
        Arc::new(cipher),
        stream_hub,
        executor_config,
    );
    let executor_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = executor.run(executor_shutdown).await {
            tracing::error!(error = %e, "executor exited");
        }
    });

    let scheduler = Scheduler::new(pool, queue);
    let scheduler_shutdown = shutdown.clone();
    tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
    });

    let app = build_app(state);

    let addr = config.bind_address();
    tracing::info!(%addr, "binding http server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind to address")?;

    tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            result.context("server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    }

    Ok(())
}
