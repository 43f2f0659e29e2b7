//! Schema migration CLI. Runs or inspects the embedded `migrations/` set
//! against `DATABASE_URL` without booting the full server.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestrator_core::config::Config;
use sqlx::migrate::MigrateDatabase;
use sqlx::postgres::PgPoolOptions;

#[derive(Parser)]
#[command(name = "migrate_cli")]
#[command(about = "Run or inspect database migrations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending migrations.
    Up,
    /// Create the target database if it does not already exist.
    Create,
    /// List the embedded migration set.
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;

    match cli.command {
        Commands::Create => {
            if !sqlx::Postgres::database_exists(&config.database_url).await? {
                sqlx::Postgres::create_database(&config.database_url).await?;
                println!("database created");
            } else {
                println!("database already exists");
            }
            Ok(())
        }
        Commands::Up => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&config.database_url)
                .await
                .context("failed to connect to database")?;
            sqlx::migrate!("./migrations").run(&pool).await?;
            println!("migrations applied");
            Ok(())
        }
        Commands::Info => {
            for migration in sqlx::migrate!("./migrations").iter() {
                println!("{} {}", migration.version, migration.description);
            }
            Ok(())
        }
    }
}
