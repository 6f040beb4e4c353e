// memory-router/src/main.rs

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use memory_router::{config::Config, run_server, server::open_store};
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "memory-router")]
#[command(about = "Tiered memory store and schema-driven intent router")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Override DATABASE_PATH
    #[arg(long, global = true)]
    database: Option<PathBuf>,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API (default)
    Serve,
    /// Run one expiry and eviction sweep, then print the report
    Sweep,
    /// Print store statistics
    Stats,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = Config::from_env()?;
    if let Some(path) = cli.database {
        cfg.database_path = path;
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(cfg).await,
        Commands::Sweep => {
            memory_router::telemetry::init_tracing();
            let store = open_store(&cfg)?;
            let report = store.sweep_now().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Stats => {
            let store = open_store(&cfg)?;
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
