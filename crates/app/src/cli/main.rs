//! duetd: dual-mix audio routing daemon

mod daemon;
mod instance;

use clap::{Parser, Subcommand};
use duet_core::domain::ConfigManager;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "duetd")]
#[command(about = "Route applications into channels and mix them to two outputs", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration directory (default: ~/.config/duet)
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Run,
    /// List the output devices the mixes can play into
    Devices,
    /// Delete the saved configuration
    ResetConfig,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => ConfigManager::default_config_dir()?,
    };
    let manager = ConfigManager::new(config_dir);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            tracing::info!("🎧 duetd starting...");
            daemon::run(manager).await
        }
        Commands::Devices => daemon::list_devices(manager).await,
        Commands::ResetConfig => {
            manager.clear().await?;
            println!("Configuration reset: {}", manager.config_path().display());
            Ok(())
        }
    }
}
