//! arbiterd: run or query an admission-control arbiter.

mod cli;
mod logging;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;

use arbiter::transport::{ServerConfig, serve};
use arbiter::{ArbiterClient, QuotaConfig};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing();

    match cli.command {
        Commands::Serve { host, port, config } => {
            let quotas = match &config {
                Some(path) => QuotaConfig::load(path)?,
                None => QuotaConfig::builtin(),
            };
            tracing::info!(
                version = arbiter::ARBITER_VERSION,
                defaults = ?quotas.defaults,
                resources = quotas.resources.len(),
                "Loaded quotas"
            );

            // Kept alive for the life of the server; only signals stop it.
            let (_shutdown_tx, shutdown_rx) = watch::channel(false);
            serve(ServerConfig { host, port }, quotas, shutdown_rx).await
        }
        Commands::ReadConfig { server } => {
            let client = connect(&server.server).await?;
            print_json(&client.read_config().await?)
        }
        Commands::Configure { server, config } => {
            let quotas = QuotaConfig::load(&config)?;
            let client = connect(&server.server).await?;
            let installed = client.configure(quotas).await?;
            tracing::info!(path = %config.display(), "Quota table installed");
            print_json(&installed)
        }
        Commands::Stats { server } => {
            let client = connect(&server.server).await?;
            print_json(&client.stats().await?)
        }
    }
}

async fn connect(addr: &str) -> anyhow::Result<ArbiterClient> {
    ArbiterClient::connect(addr)
        .await
        .with_context(|| format!("failed to connect to arbiter at {addr}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
