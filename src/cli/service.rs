use crate::{api, conf};
use anyhow::Result;
use clap::{Args, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Args)]
pub struct ServiceSubcommands {
    #[clap(subcommand)]
    pub command: ServiceCommands,
}

#[derive(Debug, Subcommand)]
pub enum ServiceCommands {
    /// Start the waypost api service.
    #[clap(
        long_about = "Waypost runs a combined HTTP/websocket API service. Running this command \
    attempts to start the long running service. This command will block and only gracefully \
    stop on SIGINT or SIGTERM signals."
    )]
    Start,
}

fn init_logging(config: &conf::api::Config) {
    // RUST_LOG wins over the configured level so operators can crank verbosity per-run.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.general.log_level.clone()));

    if config.general.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

pub async fn start(config: conf::api::Config) -> Result<()> {
    init_logging(&config);
    api::start_service(config).await
}
