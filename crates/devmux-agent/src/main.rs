mod config;
mod connection;
mod server;

use anyhow::Result;
use clap::Parser;

use crate::config::{AgentConfig, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devmux_agent=info,libdevmux=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::load(&cli)?;
    server::run(config).await
}
