//! bunnel server library
//!
//! A single listener hosts both halves of the tunnel surface: WebSocket
//! upgrades from agents (and secondary clients) and plain HTTP from callers
//! reaching `<subdomain>.<root>`. Requests are serialised over the agent's
//! control channel and correlated back by request id.

pub mod allocator;
pub mod http;
pub mod monitor;
pub mod pending;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod session;
pub mod tls;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use allocator::SubdomainAllocator;
pub use pending::PendingRequests;
pub use registry::{TunnelRegistry, TunnelState};
pub use server::TunnelServer;

/// Body the registry delivers to every caller whose tunnel goes away.
pub const TUNNEL_LOST_BODY: &str = "Tunnel connection lost";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("failed to read TLS material from {path}: {reason}")]
    TlsMaterial { path: PathBuf, reason: String },

    #[error("invalid TLS configuration: {0}")]
    TlsConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// TLS material supplied on the command line.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// Extra trust anchors; when present, client certificates are verified
    /// against them if offered.
    pub ca: Vec<PathBuf>,
}

/// Server configuration with the protocol defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Tunnel port hosting upgrades and tunneled HTTP.
    pub port: u16,
    /// Optional cleartext front-end that reverse-proxies to the tunnel port.
    pub proxy_port: Option<u16>,
    /// Root host label; hosts of shape `<sub>.<root>` route into tunnels.
    pub root_label: String,
    /// How long an HTTP caller waits for the agent's response.
    pub request_timeout: Duration,
    /// How long a disconnected tunnel keeps its identity.
    pub grace_window: Duration,
    /// Tunnels idle past this are reaped by the sweeper.
    pub idle_timeout: Duration,
    /// Sweeper period.
    pub sweep_interval: Duration,
    /// Request bodies above this answer 413.
    pub max_body_bytes: usize,
    /// TLS material for the tunnel port; cleartext when absent.
    pub tls: Option<TlsMaterial>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4444,
            proxy_port: Some(5555),
            root_label: "localhost".to_string(),
            request_timeout: Duration::from_secs(30),
            grace_window: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            max_body_bytes: 10 * 1024 * 1024,
            tls: None,
        }
    }
}
