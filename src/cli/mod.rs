mod service;

use crate::conf;
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[clap(name = "waypost")]
#[clap(about = "Waypost is a self-contained field server deployment backend.")]
#[clap(
    long_about = "Waypost provisions and monitors field server deployments and keeps the \
    operational state around them: shared notes, points of interest, and server metrics \
    history. Running `waypost service start` brings up the combined HTTP/websocket API."
)]
#[clap(version)]
struct Cli {
    /// Set configuration path; if empty default paths are used
    #[clap(long, value_name = "PATH")]
    config_path: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manages service related commands pertaining to administration.
    Service(service::ServiceSubcommands),
}

/// init the CLI and appropriately run the correct command.
pub async fn init() -> Result<()> {
    let args = Cli::parse();

    match args.command {
        Commands::Service(service) => match service.command {
            service::ServiceCommands::Start => {
                let config = conf::parse_api_config(&args.config_path)?;
                service::start(config).await
            }
        },
    }
}
