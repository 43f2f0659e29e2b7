//! Kernel — process-wide infrastructure shared by the HTTP surface, the
//! Executor, and the Scheduler: the DB pool, the reliable queue, the frozen
//! task registry, the secret cipher, and the log/event stream hub.

pub mod jobs;
pub mod stream_hub;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use jobs::{FrozenTaskRegistry, RedisQueue, SecretCipher};
use stream_hub::StreamHub;

/// Shared application state. Cheap to clone: every field is a pool, an
/// `Arc`, or a small value type.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub queue: RedisQueue,
    pub registry: FrozenTaskRegistry,
    pub cipher: Arc<SecretCipher>,
    pub stream_hub: StreamHub,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        queue: RedisQueue,
        registry: FrozenTaskRegistry,
        cipher: SecretCipher,
        stream_hub: StreamHub,
        config: Config,
    ) -> Self {
        Self {
            pool,
            queue,
            registry,
            cipher: Arc::new(cipher),
            stream_hub,
            config: Arc::new(config),
        }
    }
}
