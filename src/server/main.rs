//! Keychat Server - Main Entry Point
//!
//! Loads or creates the key file, then relays encrypted chat until Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

use keychat::crypto::keystore;
use keychat::{ChatServer, ServerConfig};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "keychat-server")]
#[command(about = "Keychat Server - shared-key group chat")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Override host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Override listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override key file path
    #[arg(short, long)]
    key_file: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        ServerConfig::from_file(&args.config)?
    } else {
        ServerConfig::default()
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(key_file) = args.key_file {
        config.key_file = key_file;
    }

    // Initialize logging
    let log_level = args.log_level.unwrap_or_else(|| config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level))
        .init();

    if !args.config.exists() {
        info!("Config file {} not found, using defaults", args.config.display());
    }

    let key = keystore::load_or_create(&config.key_file)
        .with_context(|| format!("key file {}", config.key_file.display()))?;

    let server = ChatServer::bind(&config, key)
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.port))?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stopping server...");
            shutdown.shutdown();
        }
    });

    server.run().await;
    Ok(())
}
