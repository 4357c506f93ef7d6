mod tracing_helper;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use sendrecv_relay::{config::Config, registry::PeerRegistry, server::serve};
use tokio::{net::TcpListener, sync::Mutex};

/// Pairs endpoints by identity and relays their signaling messages.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "SENDRECV_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the configuration file
    #[arg(short, long, env = "SENDRECV_RELAY_LISTEN")]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_helper::init_tracing(true);
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    serve(listener, Arc::new(Mutex::new(PeerRegistry::new()))).await
}
