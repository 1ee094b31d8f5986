//! chat-relay: a TCP chat relay server
//!
//! Clients connect over TCP, receive a unique chat id, and exchange
//! framed messages addressed to other chat ids. A stream-capable
//! key/value backend stores per-recipient message streams and fans them
//! out to each recipient's connection.
//!
//! Features:
//! - Self-describing binary wire protocol with heartbeats
//! - Durable per-recipient streams with at-least-once delivery
//! - Idle-session teardown driven by read/write deadlines
//! - Configuration via CLI arguments or TOML file

mod config;
mod hooks;
mod logger;
mod pinger;
mod protocol;
mod server;
mod store;

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{Cli, Command, Config, RunArgs};
use logger::Logger;
use server::Server;
use store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Hooks(args) => Ok(hooks::run(&args)?),
    }
}

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(args)?;

    // Initialize stderr diagnostics
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        address = %config.address,
        port = config.port,
        backend = %config.backend_url,
        ping_interval_secs = config.ping_interval_secs,
        "Starting chat relay"
    );

    let server_log = Arc::new(Logger::open(config.log_path("server.log"))?);
    let database_log = Arc::new(Logger::open(config.log_path("database.log"))?);
    let pinger_log = Arc::new(Logger::open(config.log_path("pinger.log"))?);

    let store = Store::connect(&config.backend_url, database_log).await?;
    let server = Server::new(config, store, server_log, pinger_log);
    server.run().await
}
