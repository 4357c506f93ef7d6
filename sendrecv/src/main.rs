mod config;
mod flows;
mod tracing_helper;

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use sendrecv_lib::{
    connection::RtcEngine, endpoint::Endpoint, signaling::client::connect_with_retries,
};
use tracing::info;

use crate::{config::Config, flows::RtcMediaFlows};

/// Registers with a signaling relay and runs a WebRTC session with a peer.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "SENDRECV_CONFIG")]
    config: Option<PathBuf>,

    /// Relay URL (ws://host:port)
    #[arg(short, long, env = "SENDRECV_SERVER")]
    server: Option<String>,

    /// Identity to register with, random when omitted
    #[arg(long, env = "SENDRECV_OUR_ID")]
    our_id: Option<String>,

    /// Peer to call after registering, wait for a call when omitted
    #[arg(long, env = "SENDRECV_PEER_ID")]
    peer_id: Option<String>,

    /// IVF (VP8) file sent as the video test pattern
    #[arg(long, env = "SENDRECV_TEST_PATTERN")]
    test_pattern: Option<PathBuf>,

    /// Directory of the log file
    #[arg(long, env = "SENDRECV_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(server) = self.server {
            config.server = server;
        }
        if self.our_id.is_some() {
            config.our_id = self.our_id;
        }
        if self.peer_id.is_some() {
            config.peer_id = self.peer_id;
        }
        if self.test_pattern.is_some() {
            config.test_pattern = self.test_pattern;
        }
        if let Some(log_dir) = self.log_dir {
            config.log_dir = log_dir;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    args.apply(&mut config);
    tracing_helper::init_tracing(
        &config.log_dir,
        concat!(env!("CARGO_PKG_NAME"), ".log"),
        true,
    );

    let (engine, events) = RtcEngine::new(config.engine_config()).await?;
    let engine = Arc::new(engine);
    let flows = Arc::new(RtcMediaFlows::new(
        engine.clone(),
        config.test_pattern.clone(),
    ));
    let socket = connect_with_retries(
        &config.server,
        config.connect_retries,
        config.retry_interval(),
    )
    .await?;
    info!("connected to {}", config.server);

    Endpoint::new(socket, engine, events, flows, config.endpoint_config())
        .run()
        .await?;
    info!("session ended");
    Ok(())
}
