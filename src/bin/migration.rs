use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use migrations::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database};
use tracing::info;

#[derive(Parser)]
#[command(name = "migration", about = "Run storefront schema migrations", version)]
struct Cli {
    /// Database URL; falls back to DATABASE_URL
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending migrations
    Up,
    /// Roll back the most recent migration
    Down {
        #[arg(long, default_value_t = 1)]
        steps: u32,
    },
    /// Drop every table and re-apply the full history
    Fresh,
    /// Print applied and pending migrations
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    let database_url = match cli.database_url {
        Some(url) => url,
        None => std::env::var("DATABASE_URL")
            .context("set DATABASE_URL or pass --database-url")?,
    };

    let mut options = ConnectOptions::new(database_url);
    options
        .max_connections(5)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(10))
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .sqlx_logging(true);

    let db = Database::connect(options)
        .await
        .context("failed to connect to database")?;

    match cli.command {
        Commands::Up => {
            info!("applying pending migrations");
            Migrator::up(&db, None).await?;
            info!("migrations applied");
        }
        Commands::Down { steps } => {
            info!(steps, "rolling back migrations");
            Migrator::down(&db, Some(steps)).await?;
            info!("rollback complete");
        }
        Commands::Fresh => {
            info!("rebuilding schema from scratch");
            Migrator::fresh(&db).await?;
            info!("schema rebuilt");
        }
        Commands::Status => {
            Migrator::status(&db).await?;
        }
    }

    Ok(())
}
