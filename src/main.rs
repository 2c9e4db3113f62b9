// Category WebSocket Server: Terminal Session Broker
//
// Serves resumable shell sessions to browser terminals over WebSocket.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use kodegen_terminal_broker::{
    Broker, BrokerConfig, CommandSpawner, FormatValidator, start_server,
};

#[derive(Debug, Parser)]
#[command(name = "kodegen-terminal-broker", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// WebSocket listen address
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Idle budget in seconds
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Credentials budget in seconds
    #[arg(long, value_name = "SECS")]
    auth_timeout: Option<u64>,

    /// Shell program spawned for each session
    #[arg(long, value_name = "PROGRAM")]
    shell: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<BrokerConfig> {
        let mut config = BrokerConfig::load(self.config.as_deref())
            .context("Failed to load configuration")?;

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        if let Some(secs) = self.auth_timeout {
            config.auth_timeout_secs = secs;
        }
        if let Some(shell) = self.shell {
            config.shell.program = shell;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = args.into_config()?;
    let broker = Arc::new(Broker::new(
        config.clone(),
        Arc::new(FormatValidator::new()),
        Arc::new(CommandSpawner::new(config.shell.clone())),
    ));

    let server = start_server(&config, Arc::clone(&broker))
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    log::info!("Received Ctrl-C, shutting down");

    server.shutdown().await;
    broker.shutdown().await?;
    Ok(())
}
