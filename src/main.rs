use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use e4s_index::{config, logging, server};

#[derive(Parser)]
#[command(author, version, about = "e4s-index server CLI")]
struct Cli {
    /// Path to the configuration file. Defaults to ./.e4s-index/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the index server
    Start(StartArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct StartArgs {
    /// Override the configured HTTP port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let (mut config, config_path) = config::load_or_default(cli.config)?;

    match cli.command {
        Commands::Start(args) => {
            if let Some(port) = args.port {
                config.port = port;
            }
            info!("loaded configuration from {}", config_path.display());
            server::run(config).await?;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
