//! Tokenflow Indexer CLI
//!
//! Entry point for the indexer binary. Provides subcommands for:
//! - `run` - Start the indexer
//! - `migrate` - Run database migrations
//! - `version` - Show version information

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tokenflow_indexer::config::Settings;
use tokenflow_indexer::store::PostgresRepository;

/// Tokenflow ERC-20 transfer indexer
#[derive(Parser, Debug)]
#[command(name = "tokenflow-indexer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Environment name (selects config/{env}.toml)
    #[arg(short, long, env = "APP_ENV", default_value = "development")]
    env: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the indexer
    Run {
        /// Start from a specific block number, ignoring the checkpoint
        #[arg(long)]
        from_block: Option<u64>,
    },

    /// Run database migrations
    Migrate,

    /// Show version information
    Version,
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.logging.level.clone()));

    if settings.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // .env is optional; ignore a missing file
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if matches!(cli.command, Commands::Version) {
        println!("tokenflow-indexer {}", tokenflow_indexer::VERSION);
        return Ok(());
    }

    let settings =
        Settings::load(&cli.env).map_err(|e| eyre::eyre!("failed to load settings: {e}"))?;
    init_tracing(&settings);

    info!(
        version = tokenflow_indexer::VERSION,
        env = %cli.env,
        chain_id = settings.chain.chain_id,
        "Starting Tokenflow Indexer"
    );

    match cli.command {
        Commands::Run { from_block } => {
            let cancel = CancellationToken::new();

            // Ctrl-C cancels the pipeline; tasks drain at their next
            // suspension point
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupt received, shutting down");
                        cancel.cancel();
                    }
                });
            }

            tokenflow_indexer::app::run(settings, from_block, cancel)
                .await
                .map_err(|e| eyre::eyre!(e))?;
        }
        Commands::Migrate => {
            let repo = PostgresRepository::connect(&settings.database)
                .await
                .map_err(|e| eyre::eyre!(e))?;
            repo.run_migrations().await.map_err(|e| eyre::eyre!(e))?;
            info!("Migrations applied");
        }
        Commands::Version => unreachable!("handled above"),
    }

    Ok(())
}
