use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use tutor_sync::commands::{self, AppContext};
use tutor_sync::config::{Config, default_config_path, default_data_dir};
use tutor_sync::quota::CleanupStrategy;

#[derive(Parser)]
#[command(name = "tutor-sync", version, about = "Offline content sync for the tutor app")]
struct Cli {
    /// Path to the config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding the local database
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show storage, queue, dataset, and connection status
    Status,
    /// Download the embedding corpus from the server
    Download {
        /// Dataset version to pin; defaults to the server's latest
        #[arg(long)]
        version: Option<String>,
    },
    /// Search the local corpus
    Search {
        query: String,
        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Upload pending queued queries
    Sync {
        /// Also put previously failed queries back into rotation
        #[arg(long)]
        retry_failed: bool,
    },
    /// Evict embeddings and prune old queued queries
    Cleanup {
        /// Eviction strategy (defaults to the recommended one)
        #[arg(long)]
        strategy: Option<StrategyArg>,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    OldestFirst,
    Lru,
    LowUsage,
    Partial,
}

impl From<StrategyArg> for CleanupStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::OldestFirst => CleanupStrategy::OldestFirst,
            StrategyArg::Lru => CleanupStrategy::Lru,
            StrategyArg::LowUsage => CleanupStrategy::LowUsage,
            StrategyArg::Partial => CleanupStrategy::Partial,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => match default_config_path() {
            Ok(path) => Config::load(&path)?,
            Err(_) => Config::default(),
        },
    };

    if let Commands::Config = cli.command {
        return commands::show_config(&config);
    }

    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?,
    };
    let ctx = AppContext::initialize(config, &data_dir).await?;

    match cli.command {
        Commands::Status => commands::status(&ctx).await,
        Commands::Download { version } => commands::download(&ctx, version).await,
        Commands::Search { query, limit } => commands::search(&ctx, &query, limit).await,
        Commands::Sync { retry_failed } => commands::sync(&ctx, retry_failed).await,
        Commands::Cleanup { strategy } => {
            commands::cleanup(&ctx, strategy.map(CleanupStrategy::from)).await
        }
        Commands::Config => unreachable!("handled above"),
    }
}
