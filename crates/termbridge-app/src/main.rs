use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use termbridge::{logging, AppConfig, Cli, WebServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    logging::init_tracing(cli.log_format)?;

    let config = AppConfig::from_cli(&cli)?;
    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                signal.cancel();
            }
            Err(e) => warn!("cannot listen for ctrl-c: {}", e),
        }
    });

    WebServer::new(config).start(shutdown).await
}
