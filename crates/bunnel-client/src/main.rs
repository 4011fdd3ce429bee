//! bunnel - expose a local HTTP service through a tunnel server
//!
//! ```bash
//! bunnel --local http://localhost:3000 --tunnel ws://localhost:4444
//! bunnel -l http://localhost:3000 -t wss://tunnel.example.com -s
//! ```

use anyhow::{Context, Result};
use bunnel_client::{ClientConfig, TunnelClient};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Tunnel agent for a local HTTP service
#[derive(Parser, Debug)]
#[command(
    name = "bunnel",
    about = "Expose a local HTTP service through a bunnel tunnel server",
    version
)]
struct Args {
    /// Local service URL to forward to, e.g. http://localhost:3000
    #[arg(short = 'l', long)]
    local: String,

    /// Tunnel server URL, e.g. ws://localhost:4444 or wss://tunnel.example.com
    #[arg(short = 't', long)]
    tunnel: String,

    /// Accept a self-signed certificate from the tunnel server
    #[arg(short = 's', long, default_value_t = false)]
    self_signed: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BUNNEL_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ClientConfig::new(&args.local, &args.tunnel, args.self_signed)
        .context("invalid configuration")?;

    let client = TunnelClient::connect(config)
        .await
        .context("failed to establish tunnel")?;
    info!(
        "forwarding {} -> {}",
        client.tunnel_url(),
        args.local
    );

    tokio::select! {
        _ = client.closed() => {
            warn!("tunnel session closed by the server");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, closing tunnel");
            client.disconnect().await;
        }
    }

    Ok(())
}
