mod config;
mod domain;
mod event;
mod metrics;
mod nip11;
mod probe;
mod publisher;
mod queue;
mod scheduler;
mod seeds;
mod server;
mod store;
mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use config::Settings;
use queue::TaskQueue;
use scheduler::Scheduler;
use store::{PgRelayStore, RelayRepository, MIGRATOR};
use worker::Worker;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "relaymon", author, version, about = "NIP-66 Nostr relay health monitor")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Enqueue recurring health-check and announcement jobs.
    Scheduler,
    /// Consume jobs: probe relays, persist results, publish events.
    Worker,
    /// Serve the dashboard JSON API.
    Server,
    /// Manage the database schema.
    Migrate {
        #[command(subcommand)]
        direction: MigrateCommands,
    },
    /// Seed the catalog from a relay list file.
    Seeds {
        /// Path to the newline-separated relay URL list.
        #[arg(long, default_value = "relays.txt")]
        file: String,
    },
}

/// Schema migration directions.
#[derive(Subcommand)]
enum MigrateCommands {
    /// Apply all pending migrations.
    Up,
    /// Revert all applied migrations.
    Down,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Scheduler => {
            let store = PgRelayStore::connect(&cfg.database_url()).await?;
            let queue = TaskQueue::connect(&cfg.redis_url()).await?;
            let scheduler = Scheduler::new(
                Arc::new(queue),
                cfg.healthcheck_period.duration(),
                cfg.announcement_period.duration(),
            );
            let repo: Arc<dyn RelayRepository> = Arc::new(store);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(async move { scheduler.run(repo, shutdown_rx).await });
            worker::wait_for_signal().await?;
            info!("shutting down scheduler");
            let _ = shutdown_tx.send(true);
            task.await??;
        }
        Commands::Worker => {
            let store = PgRelayStore::connect(&cfg.database_url()).await?;
            Worker::new(cfg, Arc::new(store)).run().await?;
        }
        Commands::Server => {
            let store = PgRelayStore::connect(&cfg.database_url()).await?;
            let addr: SocketAddr = format!("0.0.0.0:{}", cfg.dashboard_port).parse()?;
            info!(%addr, "dashboard server listening");
            server::serve_http(addr, Arc::new(store), async {
                let _ = worker::wait_for_signal().await;
            })
            .await?;
        }
        Commands::Migrate { direction } => {
            let store = PgRelayStore::connect(&cfg.database_url()).await?;
            match direction {
                MigrateCommands::Up => {
                    MIGRATOR.run(store.pool()).await?;
                    info!("migrations applied");
                }
                MigrateCommands::Down => {
                    MIGRATOR.undo(store.pool(), 0).await?;
                    info!("migrations reverted");
                }
            }
        }
        Commands::Seeds { file } => {
            let store = PgRelayStore::connect(&cfg.database_url()).await?;
            seeds::seed_relays(&file, Arc::new(store), cfg.probe_timeout).await?;
        }
    }
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    run(cli).await
}
