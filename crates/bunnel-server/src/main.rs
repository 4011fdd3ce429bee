//! bunnel-server - reverse HTTP tunnel server
//!
//! Accepts outbound WebSocket connections from agents, assigns each one a
//! subdomain, and exposes the agent's local HTTP service to anyone reaching
//! `<subdomain>.<host>` on the tunnel port.

use anyhow::Result;
use bunnel_server::{ServerConfig, TlsMaterial, TunnelServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Reverse HTTP tunnel server with subdomain routing
#[derive(Parser, Debug)]
#[command(
    name = "bunnel-server",
    about = "Reverse HTTP tunnel server with subdomain routing",
    version
)]
struct Args {
    /// Tunnel port hosting agent connections and tunneled HTTP
    #[arg(short = 'p', long, default_value_t = 4444)]
    port: u16,

    /// Cleartext proxy port that forwards to the tunnel port
    #[arg(short = 'x', long, default_value_t = 5555)]
    proxy: u16,

    /// TLS certificate chain (PEM); requires --key
    #[arg(long)]
    cert: Option<PathBuf>,

    /// TLS private key (PEM); requires --cert
    #[arg(long)]
    key: Option<PathBuf>,

    /// Extra CA certificates (PEM) trusted for optional client certs
    #[arg(long, num_args = 1..)]
    ca: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BUNNEL_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let tls = match (args.cert, args.key) {
        (Some(cert), Some(key)) => Some(TlsMaterial {
            cert,
            key,
            ca: args.ca,
        }),
        (None, None) => None,
        _ => anyhow::bail!("--cert and --key must be provided together"),
    };

    let config = ServerConfig {
        port: args.port,
        proxy_port: Some(args.proxy),
        tls,
        ..ServerConfig::default()
    };

    let server = Arc::new(TunnelServer::new(config));
    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.start().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl+C, shutting down gracefully");
    server.shutdown();
    runner.await??;

    Ok(())
}
