// Durable job orchestrator: reliable queue, DAG executor, cron scheduler,
// and the HTTP admission surface that fronts them.

pub mod config;
pub mod kernel;
pub mod server;

pub use config::Config;
